use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::burrow::packet::{self, IpPacket, IpVersion, TransportProtocol};
use crate::burrow::protocol::Traffic;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so
/// `AsyncRead + AsyncWrite` is wrapped into one trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Length-framed datagrams over a reliable stream.
    Stream,
    /// AEAD-sealed datagrams over raw UDP.
    Udp,
}

/// Per-channel byte counters, shared with the tunnel's accounting timer.
#[derive(Debug, Default)]
pub struct TrafficCounter {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TrafficCounter {
    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> Traffic {
        Traffic {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}

/// Delivered by a channel's read loop to the owning tunnel.
#[derive(Debug)]
pub enum ChannelEvent {
    Packets {
        channel_id: String,
        packets: Vec<IpPacket>,
    },
    Closed {
        channel_id: String,
    },
}

#[async_trait]
pub trait DatagramChannel: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> ChannelKind;
    fn is_connected(&self) -> bool;
    fn traffic(&self) -> Traffic;

    /// Sends a batch; the tunnel guarantees the cumulative size respects its
    /// MTU discipline.
    async fn send_packets(&self, packets: &[IpPacket]) -> std::io::Result<()>;

    /// Read loop. Runs until the peer closes, an error occurs, the lifespan
    /// elapses or [`DatagramChannel::close`] is called; emits
    /// [`ChannelEvent::Closed`] on exit.
    async fn run(self: Arc<Self>, events: mpsc::Sender<ChannelEvent>);

    fn close(&self);
}

/// Control-plane messages ride the datagram path as UDP packets between the
/// unspecified address/port pair; they are filtered out before user packets
/// are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Peer is rotating this datagram channel out; remove it without
    /// treating the close as an error.
    CloseChannel,
}

const CONTROL_ENDPOINT: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

pub fn build_control(msg: ControlMessage) -> IpPacket {
    let payload = serde_json::to_vec(&msg).expect("control message serializes");
    packet::build_udp(CONTROL_ENDPOINT, CONTROL_ENDPOINT, &payload)
        .expect("control envelope is a valid packet")
}

pub fn parse_control(p: &IpPacket) -> Option<ControlMessage> {
    if p.version() != IpVersion::V4
        || p.protocol() != TransportProtocol::Udp
        || p.source_endpoint() != Some(CONTROL_ENDPOINT)
        || p.destination_endpoint() != Some(CONTROL_ENDPOINT)
    {
        return None;
    }
    serde_json::from_slice(p.udp_payload()?).ok()
}

static CHANNEL_SEQ: AtomicU64 = AtomicU64::new(1);

pub fn next_channel_id(prefix: &str) -> String {
    let n = CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{n}")
}
