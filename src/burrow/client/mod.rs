pub mod capture;
pub mod connector;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ipnet::IpNet;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::burrow::error::{ErrorCode, SessionError, SessionResult, SuppressType};
use crate::burrow::nat::NatTable;
use crate::burrow::packet::{IpPacket, TransportProtocol};
use crate::burrow::protocol::{
    ClientInfo, ClientRequest, HelloRequest, HelloResponse, PROTOCOL_VERSION, SessionRequest,
    SessionResponse, StreamProxyChannelRequest, Traffic,
};
use crate::burrow::proxy::{AllowAll, UdpProxyPool};
use crate::burrow::token::Token;
use crate::burrow::tunnel::channel::next_channel_id;
use crate::burrow::tunnel::{
    ChannelKind, StreamDatagramChannel, StreamProxyChannel, Tunnel, TunnelOptions, UdpChannel,
};
use crate::burrow::util::TimeoutDictionary;
use crate::burrow::util::net::bind_udp;

pub use capture::{MemoryPacketCapture, PacketCapture};
pub use connector::Connector;

const CATCHER_FLOW_TIMEOUT: Duration = Duration::from_secs(600);
const CHANNEL_MANAGER_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub token: Token,
    pub client_id: uuid::Uuid,
    pub use_udp_channel: bool,
    /// Tunnel out-of-range UDP through local sockets instead of dropping.
    pub drop_udp: bool,
    /// Upstream used when the platform exposes no DNS configuration.
    pub dns_upstream: Option<IpAddr>,
    /// Client-side ranges, intersected with what the server advertises.
    pub include_ip_ranges: Vec<IpNet>,
    pub connect_timeout: Duration,
    pub client_version: String,
    pub user_agent: String,
}

impl ClientOptions {
    pub fn new(token: Token) -> Self {
        Self {
            token,
            client_id: uuid::Uuid::new_v4(),
            use_udp_channel: false,
            drop_udp: false,
            dns_upstream: None,
            include_ip_ranges: Vec::new(),
            connect_timeout: Duration::from_secs(30),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            user_agent: format!("burrow/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
    pub suppressed_by: SuppressType,
}

struct SessionInfo {
    session_id: u64,
    session_key: Vec<u8>,
    host_end_point: SocketAddr,
    udp_end_point: Option<SocketAddr>,
    max_datagram_channel_count: usize,
    include_ip_ranges: Vec<IpNet>,
}

/// Mirror of the server session on the device side: captures host packets,
/// classifies them, and feeds the tunnel or a local proxy.
pub struct BurrowClient {
    options: ClientOptions,
    capture: Arc<dyn PacketCapture>,
    connector: Connector,
    session: SessionInfo,
    tunnel: Tunnel,
    nat: Arc<NatTable>,
    status: std::sync::Mutex<SessionStatus>,
    /// App source port -> original destination of a redirected TCP flow.
    catcher_flows: Arc<TimeoutDictionary<u16, SocketAddr>>,
    catcher_end_point: SocketAddr,
    /// Out-of-range UDP when the platform cannot pass traffic through.
    local_udp: UdpProxyPool,
    channel_permit: Semaphore,
    use_udp: AtomicBool,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl std::fmt::Debug for BurrowClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BurrowClient").finish_non_exhaustive()
    }
}

impl BurrowClient {
    /// Performs the hello exchange (following one redirect) and starts the
    /// datapath loops.
    pub async fn connect(
        capture: Arc<dyn PacketCapture>,
        options: ClientOptions,
    ) -> SessionResult<Arc<Self>> {
        let connector = Connector::new(
            options.token.host_name.clone(),
            options.token.certificate_hash.clone(),
            options.connect_timeout,
        );

        let first = *options
            .token
            .host_end_points
            .first()
            .ok_or_else(|| SessionError::general("token has no host endpoints"))?;

        let (hello, host_end_point) = {
            let response = Self::hello(&connector, &options, first).await?;
            if response.response.error_code == ErrorCode::RedirectHost {
                let target = response
                    .response
                    .redirect_host_end_point
                    .ok_or_else(|| SessionError::general("redirect without endpoint"))?;
                tracing::info!(%target, "client: redirected by access manager");
                let response = Self::hello(&connector, &options, target).await?;
                if response.response.error_code == ErrorCode::RedirectHost {
                    return Err(SessionError::new(
                        ErrorCode::UnsupportedServer,
                        "server redirected twice",
                    ));
                }
                (response, target)
            } else {
                (response, first)
            }
        };

        if hello.response.error_code != ErrorCode::Ok {
            return Err(SessionError::new(
                hello.response.error_code,
                hello
                    .response
                    .error_message
                    .unwrap_or_else(|| "hello refused".into()),
            ));
        }
        if hello.server_protocol_version < PROTOCOL_VERSION {
            return Err(SessionError::new(
                ErrorCode::UnsupportedServer,
                format!(
                    "server speaks protocol {}, need {}",
                    hello.server_protocol_version, PROTOCOL_VERSION
                ),
            ));
        }

        // The effective tunneled ranges are the intersection of both sides.
        let include_ip_ranges =
            intersect_ranges(&options.include_ip_ranges, &hello.packet_capture_include_ip_ranges);

        let (tunnel, delivery_rx) = Tunnel::new(TunnelOptions {
            max_datagram_channel_count: hello.max_datagram_channel_count.max(1),
            ..TunnelOptions::default()
        });

        // Loopback catcher for redirected TCP flows.
        let catcher = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(SessionError::from)?;
        let catcher_end_point = catcher.local_addr().map_err(SessionError::from)?;

        let (local_sink_tx, local_sink_rx) = mpsc::channel::<IpPacket>(256);
        let local_udp = UdpProxyPool::new(
            local_sink_tx,
            Arc::new(AllowAll),
            0,
            Duration::from_secs(120),
        );

        capture.start().map_err(SessionError::from)?;

        let client = Arc::new(Self {
            connector,
            session: SessionInfo {
                session_id: hello.session_id,
                session_key: hello.session_key.clone(),
                host_end_point,
                udp_end_point: hello.udp_end_points.first().copied(),
                max_datagram_channel_count: hello.max_datagram_channel_count.max(1),
                include_ip_ranges,
            },
            options,
            capture,
            tunnel,
            nat: Arc::new(NatTable::new(Duration::from_secs(60))),
            status: std::sync::Mutex::new(SessionStatus::default()),
            catcher_flows: Arc::new(TimeoutDictionary::new(CATCHER_FLOW_TIMEOUT)),
            catcher_end_point,
            local_udp,
            channel_permit: Semaphore::new(1),
            use_udp: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });
        client
            .use_udp
            .store(client.options.use_udp_channel, Ordering::Release);

        let captured_rx = client
            .capture
            .take_captured_receiver()
            .ok_or_else(|| SessionError::general("capture receiver already taken"))?;
        tokio::spawn(Self::capture_loop(client.clone(), captured_rx));
        tokio::spawn(Self::delivery_loop(client.clone(), delivery_rx));
        tokio::spawn(Self::local_proxy_loop(client.clone(), local_sink_rx));
        tokio::spawn(Self::catcher_loop(client.clone(), catcher));
        tokio::spawn(Self::channel_manager_loop(client.clone()));

        tracing::info!(
            session_id = client.session.session_id,
            server = %host_end_point,
            udp = client.session.udp_end_point.is_some(),
            "client: connected"
        );
        Ok(client)
    }

    async fn hello(
        connector: &Connector,
        options: &ClientOptions,
        end_point: SocketAddr,
    ) -> SessionResult<HelloResponse> {
        let request = ClientRequest::Hello(HelloRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            token_id: options.token.token_id,
            client_info: ClientInfo {
                client_id: options.client_id,
                protocol_version: PROTOCOL_VERSION,
                client_version: options.client_version.clone(),
                user_agent: options.user_agent.clone(),
            },
            encrypted_client_id: options
                .token
                .encrypt_client_id(options.client_id)
                .map_err(|e| SessionError::general(e.to_string()))?,
            use_udp_channel: options.use_udp_channel,
        });
        let (response, _stream) = connector
            .request::<HelloResponse>(end_point, &request)
            .await?;
        Ok(response)
    }

    pub fn session_id(&self) -> u64 {
        self.session.session_id
    }

    pub fn session_status(&self) -> SessionStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    pub fn traffic(&self) -> Traffic {
        self.tunnel.traffic()
    }

    pub fn catcher_end_point(&self) -> SocketAddr {
        self.catcher_end_point
    }

    /// Switches between the UDP channel and stream-datagram mode; the
    /// channel manager converges on the next tick and the tunnel's
    /// mutual-exclusion rule evicts the other kind.
    pub fn set_use_udp_channel(&self, enabled: bool) {
        self.use_udp.store(enabled, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn in_range(&self, ip: IpAddr) -> bool {
        self.session.include_ip_ranges.is_empty()
            || self.session.include_ip_ranges.iter().any(|n| n.contains(&ip))
    }

    fn apply_response(&self, response: &SessionResponse) {
        if response.error_code == ErrorCode::Ok {
            return;
        }
        {
            let mut st = self.status.lock().unwrap();
            if st.error_code == ErrorCode::Ok {
                st.error_code = response.error_code;
                st.error_message = response.error_message.clone();
                st.suppressed_by = response.suppressed_by;
            }
        }
        if response.error_code.is_fatal() {
            tracing::info!(code = %response.error_code, "client: session ended by server");
            self.dispose();
        }
    }

    /// Classification of captured device packets (the client-side mirror of
    /// the server's packet routing).
    async fn capture_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<IpPacket>>) {
        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => break,
                b = rx.recv() => match b {
                    Some(b) => b,
                    None => break,
                },
            };
            let mut to_tunnel = Vec::new();
            let mut to_device = Vec::new();
            let mut passthrough = Vec::new();
            for packet in batch {
                if let Err(err) = self
                    .classify(packet, &mut to_tunnel, &mut to_device, &mut passthrough)
                    .await
                {
                    tracing::debug!(err = %err, "client: packet dropped");
                }
            }
            if !to_device.is_empty() {
                self.capture.send_to_inbound(to_device);
            }
            if !passthrough.is_empty() {
                self.capture.send_to_outbound(passthrough);
            }
            if !to_tunnel.is_empty()
                && let Err(err) = self.tunnel.send_packets(to_tunnel).await
            {
                tracing::debug!(err = %err, "client: tunnel send failed");
            }
        }
    }

    async fn classify(
        &self,
        mut packet: IpPacket,
        to_tunnel: &mut Vec<IpPacket>,
        to_device: &mut Vec<IpPacket>,
        passthrough: &mut Vec<IpPacket>,
    ) -> SessionResult<()> {
        if packet.is_ipv6_discovery() {
            return Ok(());
        }

        match packet.protocol() {
            TransportProtocol::Udp => {
                let dst = packet
                    .destination_endpoint()
                    .ok_or_else(|| SessionError::general("udp without ports"))?;

                // DNS always tunnels; rewrite to the upstream when the
                // platform hides its resolvers.
                if dst.port() == 53 {
                    if self.capture.dns_servers().is_none()
                        && let Some(upstream) = self.options.dns_upstream
                        && dst.ip() != upstream
                    {
                        let item = self
                            .nat
                            .get_or_add(&packet)
                            .map_err(|e| SessionError::general(e.to_string()))?;
                        packet
                            .set_source_port(item.replacement_id)
                            .map_err(|e| SessionError::general(e.to_string()))?;
                        packet
                            .set_destination(upstream)
                            .map_err(|e| SessionError::general(e.to_string()))?;
                    }
                    to_tunnel.push(packet);
                    return Ok(());
                }

                if self.in_range(dst.ip()) {
                    if self.options.drop_udp {
                        return Ok(());
                    }
                    to_tunnel.push(packet);
                } else if self.capture.can_send_to_outbound() {
                    passthrough.push(packet);
                } else if !self.options.drop_udp {
                    self.local_udp.send_packet(packet).await?;
                }
                Ok(())
            }

            TransportProtocol::Tcp => {
                let src = packet
                    .source_endpoint()
                    .ok_or_else(|| SessionError::general("tcp without ports"))?;
                let dst = packet
                    .destination_endpoint()
                    .ok_or_else(|| SessionError::general("tcp without ports"))?;

                if src == self.catcher_end_point {
                    // Reply from the catcher back to the app: restore the
                    // original destination as the source.
                    if let Some(original) = self.catcher_flows.get(&dst.port()) {
                        packet
                            .set_source(original.ip())
                            .map_err(|e| SessionError::general(e.to_string()))?;
                        packet
                            .set_source_port(original.port())
                            .map_err(|e| SessionError::general(e.to_string()))?;
                        to_device.push(packet);
                    }
                    return Ok(());
                }

                if self.in_range(dst.ip()) {
                    // Redirect into the loopback catcher; it recovers the
                    // destination from the flow table on accept.
                    self.catcher_flows.insert(src.port(), dst);
                    packet
                        .set_destination(self.catcher_end_point.ip())
                        .map_err(|e| SessionError::general(e.to_string()))?;
                    packet
                        .set_destination_port(self.catcher_end_point.port())
                        .map_err(|e| SessionError::general(e.to_string()))?;
                    to_device.push(packet);
                } else if self.capture.can_send_to_outbound() {
                    passthrough.push(packet);
                }
                Ok(())
            }

            TransportProtocol::Icmp | TransportProtocol::IcmpV6 => {
                if packet.is_icmp_echo_request() {
                    to_tunnel.push(packet);
                } else if self.capture.can_send_to_outbound() {
                    passthrough.push(packet);
                }
                Ok(())
            }

            TransportProtocol::Other(_) => {
                if self.capture.can_send_to_outbound() {
                    passthrough.push(packet);
                }
                Ok(())
            }
        }
    }

    /// Packets arriving from the tunnel go to the device, undoing the DNS
    /// rewrite on the way.
    async fn delivery_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<IpPacket>>) {
        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => break,
                b = rx.recv() => match b {
                    Some(b) => b,
                    None => break,
                },
            };
            let mut out = Vec::with_capacity(batch.len());
            for mut packet in batch {
                if packet.protocol() == TransportProtocol::Udp
                    && packet.source_port() == Some(53)
                    && let Some(reply_port) = packet.destination_port()
                    && let Some(item) =
                        self.nat
                            .resolve(packet.version(), TransportProtocol::Udp, reply_port)
                {
                    let _ = packet.set_destination_port(item.source_id);
                    let _ = packet.set_source(item.destination_address);
                }
                out.push(packet);
            }
            if !out.is_empty() {
                self.capture.send_to_inbound(out);
            }
        }
    }

    /// Replies from the local UDP pass-through proxy re-enter the device.
    async fn local_proxy_loop(self: Arc<Self>, mut rx: mpsc::Receiver<IpPacket>) {
        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => break,
                p = rx.recv() => match p {
                    Some(p) => p,
                    None => break,
                },
            };
            self.capture.send_to_inbound(vec![packet]);
        }
    }

    /// Accepts redirected TCP flows and bridges each over a stream-proxy
    /// request to the server.
    async fn catcher_loop(self: Arc<Self>, listener: tokio::net::TcpListener) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err = %err, "client: catcher accept failed");
                        continue;
                    }
                },
            };
            let Some(destination) = self.catcher_flows.get(&peer.port()) else {
                tracing::debug!(%peer, "client: catcher connection without flow entry");
                continue;
            };
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(err) = client.open_stream_proxy(stream, destination).await {
                    tracing::debug!(err = %err, %destination, "client: stream proxy failed");
                }
            });
        }
    }

    async fn open_stream_proxy(
        &self,
        app_stream: tokio::net::TcpStream,
        destination: SocketAddr,
    ) -> SessionResult<()> {
        let request = ClientRequest::StreamProxyChannel(StreamProxyChannelRequest {
            session: self.session_request(),
            destination,
        });
        let (response, server_stream) = self
            .connector
            .request::<SessionResponse>(self.session.host_end_point, &request)
            .await?;
        self.apply_response(&response);
        if response.error_code != ErrorCode::Ok {
            return Err(SessionError::new(
                response.error_code,
                response.error_message.unwrap_or_default(),
            ));
        }

        let channel = Arc::new(StreamProxyChannel::new(
            next_channel_id("proxy"),
            server_stream,
            Box::new(app_stream),
        ));
        self.tunnel
            .add_stream_proxy_channel(channel)
            .map_err(|e| SessionError::general(e.to_string()))
    }

    fn session_request(&self) -> SessionRequest {
        SessionRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: self.session.session_id,
            session_key: self.session.session_key.clone(),
        }
    }

    /// Keeps the tunnel stocked with the right datagram channels; a single
    /// permit guards creation so only one add proceeds at a time.
    async fn channel_manager_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(CHANNEL_MANAGER_TICK) => {}
            }
            if self.is_disposed() {
                break;
            }

            let Ok(_permit) = self.channel_permit.try_acquire() else {
                continue;
            };

            let result = if self.use_udp.load(Ordering::Acquire)
                && self.session.udp_end_point.is_some()
            {
                self.ensure_udp_channel().await
            } else {
                self.ensure_stream_channels().await
            };
            if let Err(err) = result {
                tracing::debug!(err = %err, "client: channel maintenance failed");
            }
        }
    }

    async fn ensure_udp_channel(&self) -> SessionResult<()> {
        if self.tunnel.datagram_channel_kind() == Some(ChannelKind::Udp) {
            return Ok(());
        }
        let server = self
            .session
            .udp_end_point
            .ok_or_else(|| SessionError::general("server offered no udp endpoint"))?;
        let bind: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid any addr")
        } else {
            "[::]:0".parse().expect("valid any addr")
        };
        let socket = bind_udp(bind)?;
        self.capture
            .protect_socket(socket2::SockRef::from(&socket))
            .map_err(SessionError::from)?;

        let channel = Arc::new(UdpChannel::new(
            socket,
            self.session.session_id,
            &self.session.session_key,
            false,
        ));
        channel.set_peer(server);
        self.tunnel
            .add_datagram_channel(channel)
            .map_err(|e| SessionError::general(e.to_string()))?;
        tracing::info!(%server, "client: udp channel ready");
        Ok(())
    }

    async fn ensure_stream_channels(&self) -> SessionResult<()> {
        let count = match self.tunnel.datagram_channel_kind() {
            Some(ChannelKind::Udp) => 0, // stream request will displace it
            _ => self.tunnel.datagram_channel_count(),
        };
        // Lazily opened: the first channel immediately, more only when
        // packets are actually waiting.
        let wanted = count == 0
            || (self.tunnel.pending_packets() > 0
                && count < self.session.max_datagram_channel_count);
        if !wanted {
            return Ok(());
        }

        let request = ClientRequest::TcpDatagramChannel(self.session_request());
        let (response, stream) = self
            .connector
            .request::<SessionResponse>(self.session.host_end_point, &request)
            .await?;
        self.apply_response(&response);
        if response.error_code != ErrorCode::Ok {
            return Err(SessionError::new(
                response.error_code,
                response.error_message.unwrap_or_default(),
            ));
        }

        let channel = Arc::new(StreamDatagramChannel::new(
            next_channel_id("tcp-datagram"),
            stream,
            None,
        ));
        self.tunnel
            .add_datagram_channel(channel)
            .map_err(|e| SessionError::general(e.to_string()))?;
        tracing::debug!("client: stream datagram channel added");
        Ok(())
    }

    /// Sends bye and tears the datapath down.
    pub async fn disconnect(&self) {
        if self.is_disposed() {
            return;
        }
        let request = ClientRequest::Bye(self.session_request());
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            self.connector
                .request::<SessionResponse>(self.session.host_end_point, &request),
        )
        .await;
        self.dispose();
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.tunnel.dispose();
        self.local_udp.dispose();
        self.capture.stop();
        {
            let mut st = self.status.lock().unwrap();
            if st.error_code == ErrorCode::Ok {
                st.error_code = ErrorCode::SessionClosed;
            }
        }
        tracing::info!(session_id = self.session.session_id, "client: disposed");
    }
}

impl Drop for BurrowClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn intersect_ranges(ours: &[IpNet], theirs: &[IpNet]) -> Vec<IpNet> {
    match (ours.is_empty(), theirs.is_empty()) {
        (true, _) => theirs.to_vec(),
        (_, true) => ours.to_vec(),
        _ => ours
            .iter()
            .filter(|n| theirs.iter().any(|t| t.contains(&n.network()) || n.contains(&t.network())))
            .copied()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_intersection() {
        let ours: Vec<IpNet> = vec!["10.0.0.0/8".parse().unwrap()];
        let theirs: Vec<IpNet> = vec!["10.1.0.0/16".parse().unwrap()];
        let both = intersect_ranges(&ours, &theirs);
        assert_eq!(both.len(), 1);

        assert_eq!(intersect_ranges(&[], &theirs), theirs);
        assert_eq!(intersect_ranges(&ours, &[]), ours);

        let disjoint: Vec<IpNet> = vec!["172.16.0.0/12".parse().unwrap()];
        assert!(intersect_ranges(&ours, &disjoint).is_empty());
    }
}
