pub mod manager;
pub mod net_filter;
pub mod net_scan;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::burrow::access::{AccessManager, ServerInfo, ServerStatus};
use crate::burrow::error::{ErrorCode, SessionError};
use crate::burrow::protocol::{
    self, ClientRequest, HelloResponse, PROTOCOL_VERSION, SessionResponse,
};
use crate::burrow::tunnel::channel::BoxedStream;

pub use manager::SessionManager;
pub use net_filter::NetFilter;
pub use net_scan::NetScanDetector;
pub use session::{Session, SessionOptions};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub tcp_listen: Vec<SocketAddr>,
    /// Endpoints advertised to clients; defaults to the bound listeners.
    pub public_end_points: Vec<SocketAddr>,
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
    pub session: SessionOptions,
    pub include_ip_ranges: Vec<ipnet::IpNet>,
    pub exclude_ip_ranges: Vec<ipnet::IpNet>,
    /// Admit loopback destinations; test servers only.
    pub allow_loopback: bool,
    pub server_id: uuid::Uuid,
    pub server_version: String,
    pub configure_retry: Duration,
    pub status_interval: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tcp_listen: vec!["0.0.0.0:443".parse().expect("valid default listen")],
            public_end_points: Vec::new(),
            certificate_pem: Vec::new(),
            private_key_pem: Vec::new(),
            session: SessionOptions::default(),
            include_ip_ranges: Vec::new(),
            exclude_ip_ranges: Vec::new(),
            allow_loopback: false,
            server_id: uuid::Uuid::new_v4(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            configure_retry: Duration::from_secs(30),
            status_interval: Duration::from_secs(60),
        }
    }
}

struct HelloContext {
    server_secret: Vec<u8>,
    ga_measurement_id: Option<String>,
    public_end_points: Vec<SocketAddr>,
    include_ip_ranges: Vec<ipnet::IpNet>,
}

struct ActiveConnGuard;

impl ActiveConnGuard {
    fn new() -> Self {
        metrics::counter!("burrow_connections_total").increment(1);
        metrics::gauge!("burrow_active_connections").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("burrow_active_connections").decrement(1.0);
    }
}

/// VPN server: configure against the access manager, accept TLS requests,
/// dispatch them onto sessions.
pub struct BurrowServer {
    access: Arc<dyn AccessManager>,
    options: ServerOptions,
}

impl BurrowServer {
    pub fn new(access: Arc<dyn AccessManager>, options: ServerOptions) -> Self {
        Self { access, options }
    }

    /// Runs until the shutdown signal flips. Configure failures keep the
    /// server in `Waiting` and retried; only a successful configure starts
    /// the listeners.
    pub async fn run(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let info = ServerInfo {
            server_id: self.options.server_id,
            version: self.options.server_version.clone(),
            machine_name: std::env::var("HOSTNAME").unwrap_or_default(),
            last_error: None,
        };

        let config = loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.access.server_configure(info.clone()).await {
                Ok(cfg) => break cfg,
                Err(err) => {
                    tracing::warn!(
                        err = %err,
                        retry = %humantime::format_duration(self.options.configure_retry),
                        "server: configure failed; waiting"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.options.configure_retry) => {}
                    }
                }
            }
        };

        // The access manager's knobs win over the local configuration.
        let mut session_options = self.options.session.clone();
        let patch = &config.session_options;
        if let Some(v) = patch.timeout_ms {
            session_options.timeout = Duration::from_millis(v);
        }
        if let Some(v) = patch.sync_interval_ms {
            session_options.sync_interval = Duration::from_millis(v);
        }
        if let Some(v) = patch.sync_cache_size {
            session_options.sync_cache_size = v;
        }
        if let Some(v) = patch.max_datagram_channel_count {
            session_options.max_datagram_channel_count = v;
        }
        if let Some(v) = patch.max_tcp_channel_count {
            session_options.max_tcp_channel_count = v;
        }
        if let Some(v) = patch.max_tcp_connect_wait_count {
            session_options.max_tcp_connect_wait_count = v;
        }
        if let Some(v) = patch.max_udp_client_count {
            session_options.max_udp_client_count = v;
        }
        if let Some(v) = patch.net_scan_limit {
            session_options.net_scan_limit = v;
        }
        if let Some(v) = patch.net_scan_window_ms {
            session_options.net_scan_window = Duration::from_millis(v);
        }

        let net_filter = if self.options.allow_loopback {
            NetFilter::with_loopback_allowed(
                self.options.include_ip_ranges.clone(),
                self.options.exclude_ip_ranges.clone(),
            )
        } else {
            NetFilter::new(
                self.options.include_ip_ranges.clone(),
                self.options.exclude_ip_ranges.clone(),
            )
        };
        let net_filter = Arc::new(net_filter);
        let manager = SessionManager::new(
            self.access.clone(),
            net_filter.clone(),
            session_options.clone(),
        );

        let acceptor = make_acceptor(&self.options.certificate_pem, &self.options.private_key_pem)
            .context("server: build tls acceptor")?;

        let mut tasks = JoinSet::new();
        let mut bound = Vec::new();
        for addr in &self.options.tcp_listen {
            let ln = TcpListener::bind(addr)
                .await
                .with_context(|| format!("server: bind {addr}"))?;
            let local = ln.local_addr()?;
            bound.push(local);
            tracing::info!(addr = %local, "server: listening");

            let acceptor = acceptor.clone();
            let manager = manager.clone();
            let hello = Arc::new(HelloContext {
                server_secret: config.server_secret.clone(),
                ga_measurement_id: config.tracking_options.ga_measurement_id.clone(),
                public_end_points: if self.options.public_end_points.is_empty() {
                    if config.tcp_end_points.is_empty() {
                        vec![local]
                    } else {
                        config.tcp_end_points.clone()
                    }
                } else {
                    self.options.public_end_points.clone()
                },
                include_ip_ranges: net_filter.include_ranges().to_vec(),
            });
            let version = self.options.server_version.clone();
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        accepted = ln.accept() => {
                            let (stream, peer) = match accepted {
                                Ok(v) => v,
                                Err(err) => {
                                    tracing::warn!(err = %err, "server: accept failed");
                                    continue;
                                }
                            };
                            let acceptor = acceptor.clone();
                            let manager = manager.clone();
                            let hello = hello.clone();
                            let version = version.clone();
                            tokio::spawn(async move {
                                let _guard = ActiveConnGuard::new();
                                if let Err(err) = handle_connection(
                                    stream, peer, local, acceptor, manager, hello, version,
                                )
                                .await
                                {
                                    tracing::debug!(%peer, err = %err, "server: connection ended");
                                }
                            });
                        }
                    }
                }
                Ok::<(), anyhow::Error>(())
            });
        }

        // Status heartbeat; a config-code mismatch re-runs configure on the
        // next beat.
        {
            let access = self.access.clone();
            let manager = manager.clone();
            let interval = self.options.status_interval;
            let config_code = config.config_code.clone();
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(interval) => {
                            let status = ServerStatus {
                                session_count: manager.session_count(),
                                tcp_channel_count: manager.tcp_channel_count(),
                                udp_client_count: 0,
                                tunnel_speed: Default::default(),
                                config_code: config_code.clone(),
                            };
                            match access.server_status(status).await {
                                Ok(cmd) if cmd.config_code != config_code => {
                                    tracing::info!(
                                        "server: access manager pushed a new config code; reconfigure on restart"
                                    );
                                }
                                Ok(_) => {}
                                Err(err) => {
                                    tracing::warn!(err = %err, "server: status report failed");
                                }
                            }
                        }
                    }
                }
                Ok::<(), anyhow::Error>(())
            });
        }

        tracing::info!(
            listeners = bound.len(),
            sessions_sync = %humantime::format_duration(session_options.sync_interval),
            "server: ready"
        );

        // Wait for shutdown, then close sessions gracefully.
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        manager.close_all().await;
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

pub fn make_acceptor(cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("parse certificate pem")?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("parse private key pem")?
        .context("no private key in pem")?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build rustls config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    host_end_point: SocketAddr,
    acceptor: TlsAcceptor,
    manager: Arc<SessionManager>,
    hello: Arc<HelloContext>,
    server_version: String,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let request_timeout = manager.options().request_timeout;

    let tls = tokio::time::timeout(request_timeout, acceptor.accept(stream))
        .await
        .context("tls handshake timed out")??;
    let mut stream: BoxedStream = Box::new(tls);

    let request = tokio::time::timeout(request_timeout, protocol::read_request(&mut stream))
        .await
        .context("request read timed out")??;
    let request_id = request.request_id().to_string();

    let result = dispatch(request, stream, peer, host_end_point, manager, hello, server_version)
        .await;
    match result {
        Ok(()) => Ok(()),
        Err(DispatchOutcome { error, stream }) => {
            tracing::debug!(%peer, request_id = %request_id, code = %error.error_code, "server: request refused");
            if let Some(mut stream) = stream {
                let response = SessionResponse::from_error(error.error_code, error.message);
                let _ = protocol::write_frame(&mut stream, &response).await;
            }
            Ok(())
        }
    }
}

/// A failed dispatch hands the stream back (when still usable) so the error
/// code travels to the client as a response instead of a dropped socket.
struct DispatchOutcome {
    error: SessionError,
    stream: Option<BoxedStream>,
}

async fn dispatch(
    request: ClientRequest,
    mut stream: BoxedStream,
    peer: SocketAddr,
    host_end_point: SocketAddr,
    manager: Arc<SessionManager>,
    hello_ctx: Arc<HelloContext>,
    server_version: String,
) -> Result<(), DispatchOutcome> {
    let client_ip = Some(peer.ip());

    match request {
        ClientRequest::Hello(hello) => {
            let created = manager
                .create_session(&hello, client_ip, host_end_point)
                .await;
            let (session, response) = match created {
                Ok(v) => v,
                Err(error) => {
                    return Err(DispatchOutcome {
                        error,
                        stream: Some(stream),
                    });
                }
            };

            let options = manager.options();
            let mut out = HelloResponse {
                response: response.response.clone(),
                session_id: response.session_id,
                session_key: response.session_key.clone(),
                server_secret: hello_ctx.server_secret.clone(),
                server_protocol_version: PROTOCOL_VERSION,
                server_version,
                request_timeout_ms: options.request_timeout.as_millis() as u64,
                tcp_reuse_timeout_ms: options.tcp_reuse_timeout.as_millis() as u64,
                tcp_end_points: hello_ctx.public_end_points.clone(),
                udp_end_points: Vec::new(),
                max_datagram_channel_count: options.max_datagram_channel_count,
                include_ip_ranges: hello_ctx.include_ip_ranges.clone(),
                packet_capture_include_ip_ranges: hello_ctx.include_ip_ranges.clone(),
                is_ip_v6_supported: host_end_point.is_ipv6(),
                access_usage: response.response.access_usage,
                ga_measurement_id: hello_ctx.ga_measurement_id.clone(),
            };

            if let Some(session) = &session
                && hello.use_udp_channel
            {
                match session.open_udp_channel() {
                    Ok(local) => {
                        let ip = if host_end_point.ip().is_unspecified() {
                            hello_ctx
                                .public_end_points
                                .first()
                                .map(|e| e.ip())
                                .unwrap_or_else(|| host_end_point.ip())
                        } else {
                            host_end_point.ip()
                        };
                        out.udp_end_points = vec![SocketAddr::new(ip, local.port())];
                    }
                    Err(err) => {
                        tracing::warn!(err = %err, "server: udp channel not available");
                    }
                }
            }

            tracing::info!(
                %peer,
                session_id = out.session_id,
                code = %out.response.error_code,
                "server: hello"
            );
            protocol::write_frame(&mut stream, &out)
                .await
                .map_err(|e| DispatchOutcome {
                    error: SessionError::general(e.to_string()),
                    stream: None,
                })?;
            Ok(())
        }

        ClientRequest::TcpDatagramChannel(req) => {
            let session = authorize(&manager, req.session_id, &req.session_key, client_ip, host_end_point, stream).await?;
            let (session, mut stream) = session;
            let response = session.current_response();
            protocol::write_frame(&mut stream, &response)
                .await
                .map_err(|e| DispatchOutcome {
                    error: SessionError::general(e.to_string()),
                    stream: None,
                })?;
            session
                .add_stream_datagram_channel(stream)
                .map_err(|error| DispatchOutcome {
                    error,
                    stream: None,
                })?;
            Ok(())
        }

        ClientRequest::StreamProxyChannel(req) => {
            let session = authorize(
                &manager,
                req.session.session_id,
                &req.session.session_key,
                client_ip,
                host_end_point,
                stream,
            )
            .await?;
            let (session, mut stream) = session;

            let host = match session.connect_stream_proxy(req.destination).await {
                Ok(host) => host,
                Err(error) => {
                    return Err(DispatchOutcome {
                        error,
                        stream: Some(stream),
                    });
                }
            };
            protocol::write_frame(&mut stream, &SessionResponse::ok())
                .await
                .map_err(|e| DispatchOutcome {
                    error: SessionError::general(e.to_string()),
                    stream: None,
                })?;
            session
                .attach_stream_proxy(stream, host)
                .map_err(|error| DispatchOutcome {
                    error,
                    stream: None,
                })?;
            Ok(())
        }

        ClientRequest::UdpPacket(_req) => {
            // Reserved request code.
            Err(DispatchOutcome {
                error: SessionError::general("UdpPacket requests are not implemented"),
                stream: Some(stream),
            })
        }

        ClientRequest::Bye(req) => {
            let session = manager.get(req.session_id);
            let response = match session {
                Some(session) if session.verify_key(&req.session_key) => {
                    manager.close_session(req.session_id).await;
                    SessionResponse {
                        error_code: ErrorCode::SessionClosed,
                        ..SessionResponse::default()
                    }
                }
                _ => SessionResponse::from_error(ErrorCode::AccessError, "unknown session"),
            };
            let _ = protocol::write_frame(&mut stream, &response).await;
            Ok(())
        }
    }
}

async fn authorize(
    manager: &Arc<SessionManager>,
    session_id: u64,
    session_key: &[u8],
    client_ip: Option<std::net::IpAddr>,
    host_end_point: SocketAddr,
    stream: BoxedStream,
) -> Result<(Arc<Session>, BoxedStream), DispatchOutcome> {
    match manager
        .get_or_recover(session_id, session_key, client_ip, host_end_point)
        .await
    {
        Ok(session) => Ok((session, stream)),
        Err(error) => Err(DispatchOutcome {
            error,
            stream: Some(stream),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptor_from_generated_pem() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let acceptor = make_acceptor(
            cert.pem().as_bytes(),
            key_pair.serialize_pem().as_bytes(),
        );
        assert!(acceptor.is_ok());
    }

    #[test]
    fn default_options_sane() {
        let o = ServerOptions::default();
        assert!(!o.tcp_listen.is_empty());
        assert!(o.configure_retry > Duration::from_secs(0));
        assert!(!o.allow_loopback);
    }
}
