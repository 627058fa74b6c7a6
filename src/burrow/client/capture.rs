use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use ipnet::IpNet;
use tokio::sync::mpsc;

use crate::burrow::packet::IpPacket;

/// Narrow capability interface over the platform packet capture (TUN
/// device, divert driver, VPN service). The core only depends on this.
pub trait PacketCapture: Send + Sync {
    fn started(&self) -> bool;
    fn start(&self) -> std::io::Result<()>;
    fn stop(&self);

    /// Stream of packets captured from the device; the core takes it once.
    fn take_captured_receiver(&self) -> Option<mpsc::Receiver<Vec<IpPacket>>>;

    /// Delivers packets to the device (inbound, toward applications).
    fn send_to_inbound(&self, packets: Vec<IpPacket>);

    /// Whether out-of-range traffic can bypass the capture natively.
    fn can_send_to_outbound(&self) -> bool {
        false
    }

    /// Native pass-through for out-of-range packets; only called when
    /// [`PacketCapture::can_send_to_outbound`] is true.
    fn send_to_outbound(&self, _packets: Vec<IpPacket>) {}

    /// Keeps a socket outside the capture loop (mobile platforms).
    fn protect_socket(&self, _socket: socket2::SockRef<'_>) -> std::io::Result<()> {
        Ok(())
    }

    /// DNS servers the platform exposes; `None` means the core must rewrite
    /// DNS itself.
    fn dns_servers(&self) -> Option<Vec<IpAddr>> {
        None
    }

    /// Ranges the capture claims from the routing table.
    fn include_networks(&self) -> Vec<IpNet> {
        Vec::new()
    }

    fn mtu(&self) -> Option<usize> {
        None
    }
}

/// In-memory capture for tests and embedding: the "device" is a pair of
/// queues.
pub struct MemoryPacketCapture {
    started: AtomicBool,
    captured_tx: mpsc::Sender<Vec<IpPacket>>,
    captured_rx: Mutex<Option<mpsc::Receiver<Vec<IpPacket>>>>,
    inbound_tx: mpsc::Sender<Vec<IpPacket>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Vec<IpPacket>>>>,
    include_networks: Vec<IpNet>,
}

impl MemoryPacketCapture {
    pub fn new(include_networks: Vec<IpNet>) -> Self {
        let (captured_tx, captured_rx) = mpsc::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        Self {
            started: AtomicBool::new(false),
            captured_tx,
            captured_rx: Mutex::new(Some(captured_rx)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            include_networks,
        }
    }

    /// Test harness: pretend the device emitted these packets.
    pub async fn inject(&self, packets: Vec<IpPacket>) {
        let _ = self.captured_tx.send(packets).await;
    }

    /// Test harness: what the core delivered back to the device.
    pub fn take_inbound_receiver(&self) -> Option<mpsc::Receiver<Vec<IpPacket>>> {
        self.inbound_rx.lock().unwrap().take()
    }
}

impl PacketCapture for MemoryPacketCapture {
    fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn start(&self) -> std::io::Result<()> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    fn take_captured_receiver(&self) -> Option<mpsc::Receiver<Vec<IpPacket>>> {
        self.captured_rx.lock().unwrap().take()
    }

    fn send_to_inbound(&self, packets: Vec<IpPacket>) {
        let _ = self.inbound_tx.try_send(packets);
    }

    fn include_networks(&self) -> Vec<IpNet> {
        self.include_networks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burrow::packet::build_udp;

    #[tokio::test]
    async fn memory_capture_roundtrip() {
        let cap = MemoryPacketCapture::new(Vec::new());
        cap.start().unwrap();
        assert!(cap.started());

        let mut captured = cap.take_captured_receiver().unwrap();
        assert!(cap.take_captured_receiver().is_none(), "receiver taken once");

        let p = build_udp(
            "10.0.0.1:1".parse().unwrap(),
            "1.2.3.4:2".parse().unwrap(),
            b"x",
        )
        .unwrap();
        cap.inject(vec![p.clone()]).await;
        let got = captured.recv().await.unwrap();
        assert_eq!(got[0].as_bytes(), p.as_bytes());

        let mut inbound = cap.take_inbound_receiver().unwrap();
        cap.send_to_inbound(vec![p.clone()]);
        let got = inbound.recv().await.unwrap();
        assert_eq!(got[0].as_bytes(), p.as_bytes());
    }
}
