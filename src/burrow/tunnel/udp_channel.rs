use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::burrow::packet::{self, IpPacket};
use crate::burrow::protocol::Traffic;
use crate::burrow::tunnel::channel::{
    ChannelEvent, ChannelKind, DatagramChannel, TrafficCounter,
};

const HEADER_LEN: usize = 8 + 8 + 1; // session id, sequence, flags
const FLAG_FROM_SERVER: u8 = 0x01;
const MAX_DATAGRAM: usize = 64 * 1024;

/// AEAD-sealed datagram channel over raw UDP: one per session.
///
/// Wire layout: `<8B session id BE><8B seq BE><1B flags><ciphertext>` where
/// the ciphertext seals one MTU-batch of IP packets under
/// SHA-256(session key) with the header as associated data. Out-of-order
/// and duplicate datagrams are accepted; the IP layer is idempotent.
pub struct UdpChannel {
    id: String,
    socket: Arc<UdpSocket>,
    cipher: ChaCha20Poly1305,
    session_id: u64,
    is_server: bool,
    send_seq: AtomicU64,
    /// Learned from the first authenticated datagram on the server side;
    /// fixed by `connect` on the client side.
    peer: std::sync::Mutex<Option<SocketAddr>>,
    traffic: TrafficCounter,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl UdpChannel {
    pub fn new(socket: UdpSocket, session_id: u64, session_key: &[u8], is_server: bool) -> Self {
        let key = Sha256::digest(session_key);
        Self {
            id: format!("udp:{session_id}"),
            socket: Arc::new(socket),
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            session_id,
            is_server,
            send_seq: AtomicU64::new(0),
            peer: std::sync::Mutex::new(None),
            traffic: TrafficCounter::default(),
            connected: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn set_peer(&self, peer: SocketAddr) {
        *self.peer.lock().unwrap() = Some(peer);
    }

    fn nonce(seq: u64, flags: u8) -> Nonce {
        let mut n = [0u8; 12];
        n[..8].copy_from_slice(&seq.to_be_bytes());
        n[11] = flags;
        *Nonce::from_slice(&n)
    }

    fn header(&self, seq: u64, flags: u8) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[..8].copy_from_slice(&self.session_id.to_be_bytes());
        h[8..16].copy_from_slice(&seq.to_be_bytes());
        h[16] = flags;
        h
    }

    fn seal(&self, plain: &[u8]) -> std::io::Result<Vec<u8>> {
        let seq = self.send_seq.fetch_add(1, Ordering::Relaxed);
        let flags = if self.is_server { FLAG_FROM_SERVER } else { 0 };
        let header = self.header(seq, flags);
        let sealed = self
            .cipher
            .encrypt(
                &Self::nonce(seq, flags),
                Payload {
                    msg: plain,
                    aad: &header,
                },
            )
            .map_err(|_| std::io::Error::other("seal failed"))?;

        let mut out = Vec::with_capacity(HEADER_LEN + sealed.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        if datagram.len() < HEADER_LEN {
            return None;
        }
        let (header, sealed) = datagram.split_at(HEADER_LEN);
        let session_id = u64::from_be_bytes(header[..8].try_into().unwrap());
        if session_id != self.session_id {
            return None;
        }
        let seq = u64::from_be_bytes(header[8..16].try_into().unwrap());
        let flags = header[16];
        let expected = if self.is_server { 0 } else { FLAG_FROM_SERVER };
        if flags & FLAG_FROM_SERVER != expected {
            return None;
        }
        self.cipher
            .decrypt(
                &Self::nonce(seq, flags),
                Payload {
                    msg: sealed,
                    aad: header,
                },
            )
            .ok()
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Udp
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn traffic(&self) -> Traffic {
        self.traffic.get()
    }

    async fn send_packets(&self, packets: &[IpPacket]) -> std::io::Result<()> {
        if !self.is_connected() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "channel closed",
            ));
        }
        let peer = self.peer.lock().unwrap().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "peer not learned yet")
        })?;

        let mut plain = Vec::with_capacity(packets.iter().map(|p| p.len()).sum());
        for p in packets {
            plain.extend_from_slice(p.as_bytes());
        }
        let datagram = self.seal(&plain)?;
        self.socket.send_to(&datagram, peer).await?;
        self.traffic.add_sent(datagram.len() as u64);
        Ok(())
    }

    async fn run(self: Arc<Self>, events: mpsc::Sender<ChannelEvent>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::debug!(channel = %self.id, err = %err, "channel: udp recv failed");
                        break;
                    }
                },
            };

            let Some(plain) = self.open(&buf[..len]) else {
                tracing::debug!(channel = %self.id, %from, "channel: dropped unauthenticated datagram");
                continue;
            };
            self.traffic.add_received(len as u64);

            if self.is_server {
                // Clients roam; the latest authenticated source wins.
                *self.peer.lock().unwrap() = Some(from);
            }

            match packet::split_packets(&plain) {
                Ok(packets) if !packets.is_empty() => {
                    let ev = ChannelEvent::Packets {
                        channel_id: self.id.clone(),
                        packets,
                    };
                    if events.send(ev).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(channel = %self.id, err = %err, "channel: dropped malformed datagram");
                }
            }
        }

        self.connected.store(false, Ordering::Release);
        let _ = events
            .send(ChannelEvent::Closed {
                channel_id: self.id.clone(),
            })
            .await;
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.cancel.cancel();
    }
}
