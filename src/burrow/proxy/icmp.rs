use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::burrow::error::{SessionError, SessionResult};
use crate::burrow::packet::{self, IpPacket, IpVersion, TransportProtocol};
use crate::burrow::proxy::{EndpointObserver, PacketSink};
use crate::burrow::util::TimeoutDictionary;
use crate::burrow::util::net::bind_icmp;

pub const DEFAULT_ICMP_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_MESSAGE: usize = 64 * 1024;

/// One kernel ping socket per tunneled echo flow (source address + echo id).
/// The kernel owns the on-wire identifier; replies are restamped with the
/// flow's original id before they re-enter the tunnel.
struct PingWorker {
    socket: Arc<UdpSocket>,
    observer: Arc<dyn EndpointObserver>,
    seen_remotes: Mutex<HashSet<IpAddr>>,
}

impl PingWorker {
    fn new(
        version: IpVersion,
        observer: Arc<dyn EndpointObserver>,
    ) -> std::io::Result<Arc<Self>> {
        let socket = bind_icmp(version == IpVersion::V6)?;
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            observer,
            seen_remotes: Mutex::new(HashSet::new()),
        }))
    }

    fn spawn_reply_loop(
        self: &Arc<Self>,
        source: IpAddr,
        echo_id: u16,
        sink: PacketSink,
        cancel: CancellationToken,
    ) {
        let worker = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MESSAGE];
            loop {
                let (len, from) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = worker.socket.recv_from(&mut buf) => match r {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::debug!(err = %err, "icmp proxy: recv failed");
                            break;
                        }
                    },
                };
                let reply = packet::build_icmp(from.ip(), source, &buf[..len])
                    .and_then(|mut p| p.set_icmp_echo_id(echo_id).map(|_| p));
                match reply {
                    Ok(p) => {
                        if sink.send(p).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "icmp proxy: could not wrap reply");
                    }
                }
            }
        });
    }

    async fn forward(&self, packet: &IpPacket) -> SessionResult<()> {
        let destination = packet.destination();
        if self.seen_remotes.lock().unwrap().insert(destination) {
            self.observer.on_new_remote_endpoint(
                packet.protocol(),
                SocketAddr::new(destination, 0),
            )?;
        }
        let message = packet
            .icmp_message()
            .ok_or_else(|| SessionError::general("not an icmp packet"))?;
        self.socket
            .send_to(message, SocketAddr::new(destination, 0))
            .await?;
        Ok(())
    }
}

/// Echo proxy pool keyed by (source address, echo id), aged out like the UDP
/// pools.
pub struct IcmpProxyPool {
    sink: PacketSink,
    observer: Arc<dyn EndpointObserver>,
    workers: TimeoutDictionary<(IpAddr, u16), Arc<PingWorker>>,
    cancel: CancellationToken,
}

impl IcmpProxyPool {
    pub fn new(sink: PacketSink, observer: Arc<dyn EndpointObserver>, timeout: Duration) -> Self {
        Self {
            sink,
            observer,
            workers: TimeoutDictionary::new(timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub async fn send_packet(&self, packet: IpPacket) -> SessionResult<()> {
        if !packet.is_icmp_echo_request() {
            return Err(SessionError::general("only echo requests are proxied"));
        }
        let source = packet.source();
        let echo_id = packet
            .icmp_echo_id()
            .ok_or_else(|| SessionError::general("echo without id"))?;

        let key = (source, echo_id);
        let worker = match self.workers.get(&key) {
            Some(w) => w,
            None => {
                let worker = PingWorker::new(packet.version(), self.observer.clone())
                    .map_err(SessionError::from)?;
                if let Ok(local) = worker.socket.local_addr() {
                    self.observer
                        .on_new_local_endpoint(packet.protocol(), local);
                }
                worker.spawn_reply_loop(
                    source,
                    echo_id,
                    self.sink.clone(),
                    self.cancel.child_token(),
                );
                self.workers.insert(key, worker.clone());
                worker
            }
        };

        worker.forward(&packet).await
    }

    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

impl Drop for IcmpProxyPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burrow::packet::{ICMP_V4_ECHO_REQUEST, build_icmp};
    use crate::burrow::proxy::AllowAll;
    use tokio::sync::mpsc;

    fn echo_request(src: &str, dst: &str, id: u16) -> IpPacket {
        let mut msg = vec![ICMP_V4_ECHO_REQUEST, 0, 0, 0];
        msg.extend_from_slice(&id.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(b"burrow-ping");
        build_icmp(src.parse().unwrap(), dst.parse().unwrap(), &msg).unwrap()
    }

    #[tokio::test]
    async fn rejects_non_echo() {
        let (tx, _rx) = mpsc::channel(4);
        let pool = IcmpProxyPool::new(tx, Arc::new(AllowAll), DEFAULT_ICMP_TIMEOUT);
        // An echo *reply* must not create a worker.
        let mut msg = vec![0u8, 0, 0, 0, 0, 1, 0, 1];
        msg.extend_from_slice(b"x");
        let reply = build_icmp(
            "10.0.0.1".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            &msg,
        )
        .unwrap();
        assert!(pool.send_packet(reply).await.is_err());
        assert_eq!(pool.worker_count(), 0);
    }

    // Unprivileged ping sockets need net.ipv4.ping_group_range to cover the
    // test user; loop back to ourselves so the test stays hermetic.
    #[tokio::test]
    async fn pings_loopback_when_permitted() {
        let (tx, mut rx) = mpsc::channel(4);
        let pool = IcmpProxyPool::new(tx, Arc::new(AllowAll), DEFAULT_ICMP_TIMEOUT);

        let packet = echo_request("10.0.0.5", "127.0.0.1", 0x77);
        match pool.send_packet(packet).await {
            Ok(()) => {
                let reply =
                    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
                if let Ok(Some(reply)) = reply {
                    assert_eq!(reply.destination(), "10.0.0.5".parse::<IpAddr>().unwrap());
                    assert_eq!(reply.icmp_echo_id(), Some(0x77));
                }
            }
            Err(err) => {
                // Environment without ping-socket permission.
                eprintln!("skipping: {err}");
            }
        }
    }
}
