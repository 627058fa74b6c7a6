pub mod icmp;
pub mod udp;

use std::net::SocketAddr;

use crate::burrow::error::SessionResult;
use crate::burrow::packet::{IpPacket, TransportProtocol};

pub use icmp::IcmpProxyPool;
pub use udp::{UdpProxyPool, UdpProxyPoolEx};

/// Reply packets from proxy workers are queued here; the session forwards
/// them into its tunnel.
pub type PacketSink = tokio::sync::mpsc::Sender<IpPacket>;

/// Fired by the pools when a flow first touches a new remote destination or
/// when a new local socket is created. The session logs these and gets the
/// chance to veto the flow (net-scan enforcement).
pub trait EndpointObserver: Send + Sync {
    fn on_new_remote_endpoint(
        &self,
        protocol: TransportProtocol,
        destination: SocketAddr,
    ) -> SessionResult<()>;

    fn on_new_local_endpoint(&self, protocol: TransportProtocol, local: SocketAddr);
}

/// Observer that allows everything; used by the client-side proxy manager
/// and by tests.
pub struct AllowAll;

impl EndpointObserver for AllowAll {
    fn on_new_remote_endpoint(
        &self,
        _protocol: TransportProtocol,
        _destination: SocketAddr,
    ) -> SessionResult<()> {
        Ok(())
    }

    fn on_new_local_endpoint(&self, _protocol: TransportProtocol, _local: SocketAddr) {}
}
