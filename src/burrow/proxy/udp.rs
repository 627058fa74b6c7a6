use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::burrow::error::{ErrorCode, SessionError, SessionResult};
use crate::burrow::packet::{self, IpPacket, IpVersion, TransportProtocol};
use crate::burrow::proxy::{EndpointObserver, PacketSink};
use crate::burrow::util::net::{bind_udp, set_dont_fragment};
use crate::burrow::util::{EventReporter, TimeoutDictionary};

pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_DATAGRAM: usize = 64 * 1024;

fn any_addr(version: IpVersion) -> SocketAddr {
    match version {
        IpVersion::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpVersion::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

struct WorkerShared {
    socket: UdpSocket,
    sink: PacketSink,
    observer: Arc<dyn EndpointObserver>,
    /// Destinations this worker has already reported upward.
    seen_remotes: Mutex<HashSet<SocketAddr>>,
    df_state: AtomicBool,
    cancel: CancellationToken,
}

impl WorkerShared {
    async fn new(
        version: IpVersion,
        sink: PacketSink,
        observer: Arc<dyn EndpointObserver>,
        cancel: CancellationToken,
    ) -> std::io::Result<Arc<Self>> {
        let socket = bind_udp(any_addr(version))?;
        let local = socket.local_addr()?;
        observer.on_new_local_endpoint(TransportProtocol::Udp, local);
        Ok(Arc::new(Self {
            socket,
            sink,
            observer,
            seen_remotes: Mutex::new(HashSet::new()),
            df_state: AtomicBool::new(false),
            cancel: cancel.child_token(),
        }))
    }

    /// Forwards the tunneled payload to its destination, reporting the
    /// destination upward the first time it is seen.
    async fn forward(&self, packet: &IpPacket, destination: SocketAddr) -> SessionResult<()> {
        if self.seen_remotes.lock().unwrap().insert(destination) {
            self.observer
                .on_new_remote_endpoint(TransportProtocol::Udp, destination)?;
        }

        let df = packet.dont_fragment();
        if self.df_state.swap(df, Ordering::AcqRel) != df
            && let Err(err) = set_dont_fragment(&self.socket, df)
        {
            tracing::debug!(err = %err, "udp proxy: df propagation not available");
        }

        let payload = packet
            .udp_payload()
            .ok_or_else(|| SessionError::general("not a udp packet"))?;
        self.socket.send_to(payload, destination).await?;
        Ok(())
    }
}

struct Worker {
    shared: Arc<WorkerShared>,
    source: SocketAddr,
}

impl Worker {
    /// Reply loop: datagrams from the socket are wrapped back into IP
    /// packets addressed to the original tunneled source.
    fn spawn_reply_loop(&self) {
        let shared = self.shared.clone();
        let source = self.source;
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    r = shared.socket.recv_from(&mut buf) => match r {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::debug!(err = %err, "udp proxy: recv failed");
                            break;
                        }
                    },
                };
                match packet::build_udp(from, source, &buf[..len]) {
                    Ok(reply) => {
                        if shared.sink.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "udp proxy: could not wrap reply");
                    }
                }
            }
        });
    }
}

/// Simple pool: one local socket per unique tunneled source endpoint.
pub struct UdpProxyPool {
    sink: PacketSink,
    observer: Arc<dyn EndpointObserver>,
    workers: TimeoutDictionary<SocketAddr, Arc<WorkerShared>>,
    max_clients: usize,
    quota_reporter: EventReporter,
    cancel: CancellationToken,
}

impl UdpProxyPool {
    pub fn new(
        sink: PacketSink,
        observer: Arc<dyn EndpointObserver>,
        max_clients: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            sink,
            observer,
            workers: TimeoutDictionary::new(timeout),
            max_clients,
            quota_reporter: EventReporter::new("udp_client_quota", Duration::from_secs(10)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub async fn send_packet(&self, packet: IpPacket) -> SessionResult<()> {
        let source = packet
            .source_endpoint()
            .ok_or_else(|| SessionError::general("udp packet without ports"))?;
        let destination = packet
            .destination_endpoint()
            .ok_or_else(|| SessionError::general("udp packet without ports"))?;

        let shared = match self.workers.get(&source) {
            Some(w) => w,
            None => {
                self.workers.cleanup();
                if self.max_clients > 0 && self.workers.len() >= self.max_clients {
                    self.quota_reporter.raise("udp proxy: client quota reached");
                    return Err(SessionError::new(
                        ErrorCode::UdpClientQuota,
                        format!("maximum of {} udp flows reached", self.max_clients),
                    ));
                }
                let shared = WorkerShared::new(
                    packet.version(),
                    self.sink.clone(),
                    self.observer.clone(),
                    self.cancel.clone(),
                )
                .await?;
                Worker {
                    shared: shared.clone(),
                    source,
                }
                .spawn_reply_loop();
                self.workers.insert(source, shared.clone());
                shared
            }
        };

        shared.forward(&packet, destination).await
    }

    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

impl Drop for UdpProxyPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct WorkerEx {
    shared: Arc<WorkerShared>,
    /// destination -> tunneled source; a destination never serves two
    /// sources on the same socket or replies would be ambiguous.
    destinations: Arc<TimeoutDictionary<SocketAddr, SocketAddr>>,
}

impl WorkerEx {
    fn spawn_reply_loop(&self) {
        let shared = self.shared.clone();
        let destinations = self.destinations.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    r = shared.socket.recv_from(&mut buf) => match r {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::debug!(err = %err, "udp proxy: recv failed");
                            break;
                        }
                    },
                };
                let Some(source) = destinations.get(&from) else {
                    tracing::debug!(%from, "udp proxy: reply for expired flow");
                    continue;
                };
                match packet::build_udp(from, source, &buf[..len]) {
                    Ok(reply) => {
                        if shared.sink.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "udp proxy: could not wrap reply");
                    }
                }
            }
        });
    }
}

/// Port-efficient pool: workers are shared across sources; a worker serves a
/// connection as long as its destination map holds no conflicting entry for
/// that destination.
pub struct UdpProxyPoolEx {
    sink: PacketSink,
    observer: Arc<dyn EndpointObserver>,
    workers: Mutex<Vec<WorkerEx>>,
    max_local_endpoints: usize,
    timeout: Duration,
    quota_reporter: EventReporter,
    cancel: CancellationToken,
}

impl UdpProxyPoolEx {
    pub fn new(
        sink: PacketSink,
        observer: Arc<dyn EndpointObserver>,
        max_local_endpoints: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            sink,
            observer,
            workers: Mutex::new(Vec::new()),
            max_local_endpoints,
            timeout,
            quota_reporter: EventReporter::new("udp_endpoint_quota", Duration::from_secs(10)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub async fn send_packet(&self, packet: IpPacket) -> SessionResult<()> {
        let source = packet
            .source_endpoint()
            .ok_or_else(|| SessionError::general("udp packet without ports"))?;
        let destination = packet
            .destination_endpoint()
            .ok_or_else(|| SessionError::general("udp packet without ports"))?;

        let shared = self.pick_worker(packet.version(), source, destination).await?;
        shared.forward(&packet, destination).await
    }

    async fn pick_worker(
        &self,
        version: IpVersion,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> SessionResult<Arc<WorkerShared>> {
        {
            let workers = self.workers.lock().unwrap();
            for w in workers.iter() {
                match w.destinations.get(&destination) {
                    Some(owner) if owner == source => return Ok(w.shared.clone()),
                    Some(_) => continue, // destination owned by another source
                    None => {
                        w.destinations.insert(destination, source);
                        return Ok(w.shared.clone());
                    }
                }
            }
            if self.max_local_endpoints > 0 && workers.len() >= self.max_local_endpoints {
                self.quota_reporter
                    .raise("udp proxy: local endpoint quota reached");
                return Err(SessionError::new(
                    ErrorCode::UdpClientQuota,
                    format!(
                        "maximum of {} local udp endpoints reached",
                        self.max_local_endpoints
                    ),
                ));
            }
        }

        let shared = WorkerShared::new(
            version,
            self.sink.clone(),
            self.observer.clone(),
            self.cancel.clone(),
        )
        .await?;
        let worker = WorkerEx {
            shared: shared.clone(),
            destinations: Arc::new(TimeoutDictionary::new(self.timeout)),
        };
        worker.destinations.insert(destination, source);
        worker.spawn_reply_loop();
        self.workers.lock().unwrap().push(worker);
        Ok(shared)
    }

    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

impl Drop for UdpProxyPoolEx {
    fn drop(&mut self) {
        self.dispose();
    }
}
