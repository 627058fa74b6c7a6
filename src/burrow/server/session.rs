use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::burrow::access::{AccessError, AccessManager};
use crate::burrow::error::{ErrorCode, SessionError, SessionResult, SuppressType};
use crate::burrow::packet::{IpPacket, TransportProtocol};
use crate::burrow::protocol::{SessionResponse, Traffic};
use crate::burrow::proxy::{EndpointObserver, IcmpProxyPool, UdpProxyPoolEx};
use crate::burrow::server::net_filter::NetFilter;
use crate::burrow::server::net_scan::NetScanDetector;
use crate::burrow::tunnel::channel::{BoxedStream, next_channel_id};
use crate::burrow::tunnel::{
    StreamDatagramChannel, StreamProxyChannel, Tunnel, TunnelOptions, UdpChannel,
};
use crate::burrow::util::EventReporter;
use crate::burrow::util::net::{SocketBuffers, apply_tcp_options, bind_udp};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Idle sessions are closed after this.
    pub timeout: Duration,
    pub sync_interval: Duration,
    /// Unsynced delta that forces an early usage report.
    pub sync_cache_size: u64,
    pub max_datagram_channel_count: usize,
    pub max_tcp_channel_count: usize,
    pub max_tcp_connect_wait_count: usize,
    pub max_udp_client_count: usize,
    pub tcp_connect_timeout: Duration,
    pub tcp_graceful_timeout: Duration,
    pub tcp_buffers: SocketBuffers,
    pub udp_timeout: Duration,
    pub request_timeout: Duration,
    pub tcp_reuse_timeout: Duration,
    /// Stream datagram channels rotate within this range when set.
    pub datagram_channel_lifespan: Option<(Duration, Duration)>,
    pub mtu_no_fragment: usize,
    pub mtu_with_fragment: usize,
    /// 0 disables net-scan detection.
    pub net_scan_limit: usize,
    pub net_scan_window: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            sync_interval: Duration::from_secs(30),
            sync_cache_size: 10 * 1024 * 1024,
            max_datagram_channel_count: 8,
            max_tcp_channel_count: 128,
            max_tcp_connect_wait_count: 64,
            max_udp_client_count: 256,
            tcp_connect_timeout: Duration::from_secs(30),
            tcp_graceful_timeout: Duration::from_secs(10),
            tcp_buffers: SocketBuffers::default(),
            udp_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            tcp_reuse_timeout: Duration::from_secs(40),
            datagram_channel_lifespan: None,
            mtu_no_fragment: 1500,
            mtu_with_fragment: 8192,
            net_scan_limit: 0,
            net_scan_window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StatusInfo {
    error_code: ErrorCode,
    error_message: Option<String>,
    suppressed_by: SuppressType,
}

/// Net-scan gate and endpoint logging for the proxy pools.
struct SessionObserver {
    session_id: u64,
    net_scan: Arc<NetScanDetector>,
}

impl EndpointObserver for SessionObserver {
    fn on_new_remote_endpoint(
        &self,
        protocol: TransportProtocol,
        destination: SocketAddr,
    ) -> SessionResult<()> {
        if !self.net_scan.verify(destination) {
            tracing::warn!(
                session_id = self.session_id,
                %destination,
                "session: net scan detected"
            );
            return Err(SessionError::new(
                ErrorCode::NetScan,
                format!("too many distinct endpoints; last was {destination}"),
            ));
        }
        tracing::trace!(session_id = self.session_id, ?protocol, %destination, "session: new remote endpoint");
        Ok(())
    }

    fn on_new_local_endpoint(&self, protocol: TransportProtocol, local: SocketAddr) {
        tracing::trace!(session_id = self.session_id, ?protocol, %local, "session: new local endpoint");
    }
}

/// Server side of one client association: owns the tunnel and the proxy
/// pools, enforces limits, accounts traffic and reports it to the access
/// manager.
pub struct Session {
    session_id: u64,
    session_key: Vec<u8>,
    client_ip: Option<IpAddr>,
    host_end_point: SocketAddr,
    options: SessionOptions,
    access: Arc<dyn AccessManager>,
    net_filter: Arc<NetFilter>,
    net_scan: Arc<NetScanDetector>,
    tunnel: Tunnel,
    udp_pool: UdpProxyPoolEx,
    icmp_pool: IcmpProxyPool,
    status: std::sync::Mutex<StatusInfo>,
    /// Axis-flipped totals already reported; the lock also serializes syncs.
    synced: tokio::sync::Mutex<Traffic>,
    pending_tcp_connect: AtomicUsize,
    filter_reporter: EventReporter,
    udp_channel_endpoint: std::sync::Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        session_id: u64,
        session_key: Vec<u8>,
        client_ip: Option<IpAddr>,
        host_end_point: SocketAddr,
        access: Arc<dyn AccessManager>,
        net_filter: Arc<NetFilter>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (tunnel, delivery_rx) = Tunnel::new(TunnelOptions {
            max_datagram_channel_count: options.max_datagram_channel_count,
            mtu_no_fragment: options.mtu_no_fragment,
            mtu_with_fragment: options.mtu_with_fragment,
            ..TunnelOptions::default()
        });

        let (sink_tx, sink_rx) = mpsc::channel::<IpPacket>(256);
        let net_scan = Arc::new(NetScanDetector::new(
            options.net_scan_limit,
            options.net_scan_window,
        ));
        let observer: Arc<dyn EndpointObserver> = Arc::new(SessionObserver {
            session_id,
            net_scan: net_scan.clone(),
        });

        let udp_pool = UdpProxyPoolEx::new(
            sink_tx.clone(),
            observer.clone(),
            options.max_udp_client_count,
            options.udp_timeout,
        );
        let icmp_pool = IcmpProxyPool::new(sink_tx, observer, options.udp_timeout);

        let session = Arc::new(Self {
            session_id,
            session_key,
            client_ip,
            host_end_point,
            options,
            access,
            net_filter,
            net_scan,
            tunnel,
            udp_pool,
            icmp_pool,
            status: std::sync::Mutex::new(StatusInfo::default()),
            synced: tokio::sync::Mutex::new(Traffic::default()),
            pending_tcp_connect: AtomicUsize::new(0),
            filter_reporter: EventReporter::new("request_blocked", Duration::from_secs(10)),
            udp_channel_endpoint: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        tokio::spawn(Self::packet_loop(session.clone(), delivery_rx));
        tokio::spawn(Self::reply_loop(session.clone(), sink_rx));
        metrics::gauge!("burrow_sessions").increment(1.0);
        session
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    pub fn verify_key(&self, key: &[u8]) -> bool {
        !self.session_key.is_empty() && self.session_key == key
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> tokio::time::Instant {
        self.tunnel.last_activity()
    }

    pub fn tunnel_speed(&self) -> Traffic {
        self.tunnel.speed()
    }

    pub fn tcp_channel_count(&self) -> usize {
        self.tunnel.stream_proxy_channel_count()
    }

    pub fn udp_channel_endpoint(&self) -> Option<SocketAddr> {
        *self.udp_channel_endpoint.lock().unwrap()
    }

    /// Status snapshot sent on request responses.
    pub fn current_response(&self) -> SessionResponse {
        let st = self.status.lock().unwrap();
        SessionResponse {
            error_code: st.error_code,
            error_message: st.error_message.clone(),
            suppressed_by: st.suppressed_by,
            redirect_host_end_point: None,
            access_usage: None,
        }
    }

    fn set_status(&self, code: ErrorCode, message: Option<String>, suppressed_by: SuppressType) {
        let mut st = self.status.lock().unwrap();
        if st.error_code == ErrorCode::Ok {
            st.error_code = code;
            st.error_message = message;
            st.suppressed_by = suppressed_by;
        }
    }

    /// Tunneled packets fan out to the proxy pools; per-packet failures are
    /// logged and dropped, the session keeps serving.
    async fn packet_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<IpPacket>>) {
        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => break,
                b = rx.recv() => match b {
                    Some(b) => b,
                    None => break,
                },
            };
            for packet in batch {
                if let Err(err) = self.route_packet(packet).await {
                    tracing::debug!(session_id = self.session_id, err = %err, "session: packet dropped");
                }
            }
            // Opportunistic usage report once enough unsynced delta piles up.
            let _ = self.sync(false, false).await;
        }
    }

    async fn route_packet(&self, packet: IpPacket) -> SessionResult<()> {
        let check_point = match packet.protocol() {
            TransportProtocol::Udp => packet
                .destination_endpoint()
                .ok_or_else(|| SessionError::general("udp packet without ports"))?,
            TransportProtocol::Icmp | TransportProtocol::IcmpV6 => {
                SocketAddr::new(packet.destination(), 0)
            }
            other => {
                return Err(SessionError::general(format!(
                    "protocol {other:?} is not routed through the datagram path"
                )));
            }
        };

        if self.net_filter.process(check_point).is_none() {
            self.filter_reporter.raise("session: destination blocked");
            return Err(SessionError::new(
                ErrorCode::RequestBlocked,
                format!("destination {check_point} refused"),
            ));
        }

        match packet.protocol() {
            TransportProtocol::Udp => self.udp_pool.send_packet(packet).await,
            _ => self.icmp_pool.send_packet(packet).await,
        }
    }

    /// Proxy replies re-enter the tunnel toward the client.
    async fn reply_loop(self: Arc<Self>, mut rx: mpsc::Receiver<IpPacket>) {
        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => break,
                p = rx.recv() => match p {
                    Some(p) => p,
                    None => break,
                },
            };
            if let Err(err) = self.tunnel.send_packet(packet).await {
                tracing::debug!(session_id = self.session_id, err = %err, "session: reply dropped");
            }
        }
    }

    /// Adopts an authenticated request stream as a stream-datagram channel;
    /// implicitly leaves UDP mode by the tunnel's mutual-exclusion rule.
    pub fn add_stream_datagram_channel(&self, stream: BoxedStream) -> SessionResult<()> {
        let channel = Arc::new(StreamDatagramChannel::new(
            next_channel_id("tcp-datagram"),
            stream,
            self.options.datagram_channel_lifespan,
        ));
        *self.udp_channel_endpoint.lock().unwrap() = None;
        self.tunnel
            .add_datagram_channel(channel)
            .map_err(|e| SessionError::general(e.to_string()))
    }

    /// Creates the session's UDP channel and returns its local endpoint for
    /// the hello response.
    pub fn open_udp_channel(&self) -> SessionResult<SocketAddr> {
        let bind: SocketAddr = match self.host_end_point {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().expect("valid any addr"),
            SocketAddr::V6(_) => "[::]:0".parse().expect("valid any addr"),
        };
        let socket = bind_udp(bind)?;
        let channel = Arc::new(UdpChannel::new(
            socket,
            self.session_id,
            &self.session_key,
            true,
        ));
        let local = channel.local_addr()?;
        self.tunnel
            .add_datagram_channel(channel)
            .map_err(|e| SessionError::general(e.to_string()))?;
        *self.udp_channel_endpoint.lock().unwrap() = Some(local);
        Ok(local)
    }

    /// The four ordered checks plus the actual outbound connect for a
    /// stream-proxy request.
    pub async fn connect_stream_proxy(
        &self,
        destination: SocketAddr,
    ) -> SessionResult<tokio::net::TcpStream> {
        let destination = self.net_filter.process(destination).ok_or_else(|| {
            self.filter_reporter.raise("session: request blocked");
            SessionError::new(
                ErrorCode::RequestBlocked,
                format!("destination {destination} refused"),
            )
        })?;

        if !self.net_scan.verify(destination) {
            return Err(SessionError::new(
                ErrorCode::NetScan,
                format!("too many distinct endpoints; last was {destination}"),
            ));
        }

        if self.tcp_channel_count() >= self.options.max_tcp_channel_count {
            return Err(SessionError::new(
                ErrorCode::MaxTcpChannel,
                format!("session reached {} tcp channels", self.options.max_tcp_channel_count),
            ));
        }

        if self.pending_tcp_connect.load(Ordering::Acquire)
            >= self.options.max_tcp_connect_wait_count
        {
            return Err(SessionError::new(
                ErrorCode::MaxTcpConnectWait,
                format!(
                    "session has {} connects in flight",
                    self.options.max_tcp_connect_wait_count
                ),
            ));
        }

        self.pending_tcp_connect.fetch_add(1, Ordering::AcqRel);
        let connect = tokio::time::timeout(
            self.options.tcp_connect_timeout,
            tokio::net::TcpStream::connect(destination),
        )
        .await;
        self.pending_tcp_connect.fetch_sub(1, Ordering::AcqRel);

        let stream = match connect {
            Ok(Ok(s)) => s,
            Ok(Err(err)) => {
                return Err(SessionError::general(format!(
                    "connect to {destination} failed: {err}"
                )));
            }
            Err(_) => {
                return Err(SessionError::general(format!(
                    "connect to {destination} timed out"
                )));
            }
        };
        if let Err(err) = apply_tcp_options(&stream, self.options.tcp_buffers) {
            tracing::debug!(err = %err, "session: tcp options not applied");
        }
        Ok(stream)
    }

    pub fn attach_stream_proxy(
        &self,
        tunnel_stream: BoxedStream,
        host_stream: tokio::net::TcpStream,
    ) -> SessionResult<()> {
        let channel = Arc::new(StreamProxyChannel::new(
            next_channel_id("proxy"),
            tunnel_stream,
            Box::new(host_stream),
        ));
        self.tunnel
            .add_stream_proxy_channel(channel)
            .map_err(|e| SessionError::general(e.to_string()))
    }

    /// Reports the unsynced delta to the access manager. The per-session
    /// mutex makes concurrent calls collapse into one in-flight RPC; the
    /// axes are flipped because bytes sent from the tunnel were received by
    /// the client.
    pub async fn sync(&self, force: bool, close: bool) -> SessionResult<()> {
        let mut synced = self.synced.lock().await;
        let total = self.tunnel.traffic().flip();
        let delta = total - *synced;

        if !force && !close && delta.total() < self.options.sync_cache_size {
            return Ok(());
        }

        match self.access.add_usage(self.session_id, delta, close).await {
            Ok(response) => {
                *synced = total;
                drop(synced);
                if response.error_code != ErrorCode::Ok {
                    tracing::info!(
                        session_id = self.session_id,
                        code = %response.error_code,
                        "session: access manager ended session"
                    );
                    self.set_status(
                        response.error_code,
                        response.error_message.clone(),
                        response.suppressed_by,
                    );
                    self.dispose();
                }
                Ok(())
            }
            Err(AccessError::NotFound) => {
                drop(synced);
                self.set_status(
                    ErrorCode::AccessError,
                    Some("session is unknown to the access manager".into()),
                    SuppressType::None,
                );
                self.dispose();
                Err(SessionError::new(ErrorCode::AccessError, "session not found"))
            }
            Err(err) => {
                // Network trouble: keep serving, retry at the next interval.
                tracing::warn!(session_id = self.session_id, err = %err, "session: usage sync failed");
                Ok(())
            }
        }
    }

    /// Graceful close: final sync+bye inside the graceful window, then
    /// teardown.
    pub async fn close(&self) {
        if self.is_disposed() {
            return;
        }
        let _ = tokio::time::timeout(self.options.tcp_graceful_timeout, self.sync(true, true))
            .await;
        self.set_status(
            ErrorCode::SessionClosed,
            Some("session closed".into()),
            SuppressType::None,
        );
        self.dispose();
    }

    /// Idempotent teardown; after this no packet is delivered for the
    /// session again.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_status(ErrorCode::SessionClosed, None, SuppressType::None);
        self.cancel.cancel();
        self.tunnel.dispose();
        self.udp_pool.dispose();
        self.icmp_pool.dispose();
        metrics::gauge!("burrow_sessions").decrement(1.0);
        tracing::info!(session_id = self.session_id, "session: disposed");
    }

    pub async fn send_to_client(&self, packets: Vec<IpPacket>) -> SessionResult<()> {
        self.tunnel
            .send_packets(packets)
            .await
            .map_err(|e| SessionError::general(e.to_string()))
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burrow::access::{
        ServerCommand, ServerConfig, ServerInfo, ServerStatus, SessionRequestEx, SessionResponseEx,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingAccess {
        usage_calls: AtomicUsize,
        respond_with: std::sync::Mutex<SessionResponse>,
        gate: tokio::sync::Semaphore,
    }

    impl CountingAccess {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                usage_calls: AtomicUsize::new(0),
                respond_with: std::sync::Mutex::new(SessionResponse::ok()),
                gate: tokio::sync::Semaphore::new(0),
            })
        }
    }

    #[async_trait]
    impl AccessManager for CountingAccess {
        async fn server_configure(
            &self,
            _info: ServerInfo,
        ) -> Result<ServerConfig, AccessError> {
            Ok(ServerConfig::default())
        }
        async fn server_status(
            &self,
            _status: ServerStatus,
        ) -> Result<ServerCommand, AccessError> {
            Ok(ServerCommand::default())
        }
        async fn session_create(
            &self,
            _request: SessionRequestEx,
        ) -> Result<SessionResponseEx, AccessError> {
            unimplemented!("not used by these tests")
        }
        async fn session_get(
            &self,
            _session_id: u64,
            _host_end_point: SocketAddr,
            _client_ip: Option<IpAddr>,
        ) -> Result<SessionResponseEx, AccessError> {
            Err(AccessError::NotFound)
        }
        async fn add_usage(
            &self,
            _session_id: u64,
            _traffic: Traffic,
            _close: bool,
        ) -> Result<SessionResponse, AccessError> {
            self.usage_calls.fetch_add(1, Ordering::SeqCst);
            // Hold every caller until the test opens the gate, proving how
            // many RPCs were actually in flight.
            let _ = self.gate.acquire().await;
            Ok(self.respond_with.lock().unwrap().clone())
        }
        async fn certificate_get(
            &self,
            _host_end_point: SocketAddr,
        ) -> Result<Vec<u8>, AccessError> {
            Err(AccessError::NotFound)
        }
    }

    fn make_session(access: Arc<dyn AccessManager>, options: SessionOptions) -> Arc<Session> {
        Session::new(
            7,
            vec![1u8; 16],
            Some("192.0.2.1".parse().unwrap()),
            "127.0.0.1:443".parse().unwrap(),
            access,
            Arc::new(NetFilter::default()),
            options,
        )
    }

    #[tokio::test]
    async fn concurrent_syncs_collapse_to_one_rpc() {
        let access = CountingAccess::new();
        let session = make_session(access.clone(), SessionOptions::default());

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let s = session.clone();
            tasks.push(tokio::spawn(async move { s.sync(true, false).await }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Only the first call reached the manager; the rest are parked on
        // the per-session mutex.
        assert_eq!(access.usage_calls.load(Ordering::SeqCst), 1);

        access.gate.add_permits(64);
        for t in tasks {
            t.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn fatal_sync_response_disposes_session() {
        let access = CountingAccess::new();
        *access.respond_with.lock().unwrap() =
            SessionResponse::from_error(ErrorCode::AccessTrafficOverflow, "quota");
        access.gate.add_permits(64);

        let session = make_session(access.clone(), SessionOptions::default());
        session.sync(true, false).await.unwrap();
        assert!(session.is_disposed());
        assert_eq!(
            session.current_response().error_code,
            ErrorCode::AccessTrafficOverflow
        );
    }

    #[tokio::test]
    async fn session_not_found_closes_as_access_error() {
        struct NotFoundAccess;
        #[async_trait]
        impl AccessManager for NotFoundAccess {
            async fn server_configure(
                &self,
                _i: ServerInfo,
            ) -> Result<ServerConfig, AccessError> {
                Ok(ServerConfig::default())
            }
            async fn server_status(
                &self,
                _s: ServerStatus,
            ) -> Result<ServerCommand, AccessError> {
                Ok(ServerCommand::default())
            }
            async fn session_create(
                &self,
                _r: SessionRequestEx,
            ) -> Result<SessionResponseEx, AccessError> {
                Err(AccessError::NotFound)
            }
            async fn session_get(
                &self,
                _id: u64,
                _h: SocketAddr,
                _c: Option<IpAddr>,
            ) -> Result<SessionResponseEx, AccessError> {
                Err(AccessError::NotFound)
            }
            async fn add_usage(
                &self,
                _id: u64,
                _t: Traffic,
                _c: bool,
            ) -> Result<SessionResponse, AccessError> {
                Err(AccessError::NotFound)
            }
            async fn certificate_get(
                &self,
                _h: SocketAddr,
            ) -> Result<Vec<u8>, AccessError> {
                Err(AccessError::NotFound)
            }
        }

        let session = make_session(Arc::new(NotFoundAccess), SessionOptions::default());
        assert!(session.sync(true, false).await.is_err());
        assert!(session.is_disposed());
        assert_eq!(session.current_response().error_code, ErrorCode::AccessError);
    }

    #[tokio::test]
    async fn stream_proxy_checks_are_ordered() {
        let access = CountingAccess::new();
        access.gate.add_permits(64);
        let session = make_session(
            access,
            SessionOptions {
                max_tcp_channel_count: 0,
                ..SessionOptions::default()
            },
        );

        // Blocked destination wins over channel limit.
        let err = session
            .connect_stream_proxy("127.0.0.1:80".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::RequestBlocked);

        // Channel limit fires for an allowed destination.
        let err = session
            .connect_stream_proxy("93.184.216.34:80".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::MaxTcpChannel);
    }

    #[tokio::test]
    async fn connect_wait_limit() {
        let access = CountingAccess::new();
        access.gate.add_permits(64);
        let session = make_session(
            access,
            SessionOptions {
                max_tcp_connect_wait_count: 0,
                ..SessionOptions::default()
            },
        );
        let err = session
            .connect_stream_proxy("93.184.216.34:80".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::MaxTcpConnectWait);
    }

    #[tokio::test]
    async fn proxies_real_tcp_connect() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = ln.accept().await;
        });

        let access = CountingAccess::new();
        access.gate.add_permits(64);
        let session = Session::new(
            9,
            vec![2u8; 16],
            None,
            "127.0.0.1:443".parse().unwrap(),
            access,
            Arc::new(NetFilter::with_loopback_allowed(Vec::new(), Vec::new())),
            SessionOptions::default(),
        );
        let stream = session.connect_stream_proxy(addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);

        // The default filter would have refused the same destination.
        let strict = NetFilter::default();
        assert!(strict.process(addr).is_none());
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let access = CountingAccess::new();
        access.gate.add_permits(64);
        let session = make_session(access, SessionOptions::default());
        session.dispose();
        session.dispose();
        assert!(session.is_disposed());
        let p = crate::burrow::packet::build_udp(
            "10.0.0.1:1".parse().unwrap(),
            "1.2.3.4:2".parse().unwrap(),
            b"x",
        )
        .unwrap();
        assert!(session.send_to_client(vec![p]).await.is_err());
    }
}
