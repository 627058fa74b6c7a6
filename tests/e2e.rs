//! End-to-end scenarios over a real TLS server, the file access manager and
//! the in-memory packet capture.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use burrow::access::file::FileAccessManagerOptions;
use burrow::access::{
    AccessError, AccessManager, FileAccessManager, ServerCommand, ServerConfig, ServerInfo,
    ServerStatus, SessionRequestEx, SessionResponseEx,
};
use burrow::client::{BurrowClient, ClientOptions, MemoryPacketCapture};
use burrow::error::{ErrorCode, SuppressType};
use burrow::packet::IpPacket;
use burrow::protocol::{SessionResponse, Traffic};
use burrow::server::{BurrowServer, ServerOptions, SessionOptions};
use burrow::token::Token;
use burrow::tunnel::ChannelKind;

fn free_port() -> SocketAddr {
    let ln = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    ln.local_addr().unwrap()
}

fn test_session_options() -> SessionOptions {
    SessionOptions {
        sync_interval: Duration::from_millis(200),
        sync_cache_size: u64::MAX,
        request_timeout: Duration::from_secs(10),
        tcp_graceful_timeout: Duration::from_secs(2),
        ..SessionOptions::default()
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    access: Arc<FileAccessManager>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    certificate_hash: Vec<u8>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let access = FileAccessManager::new(
            dir.path().join("storage"),
            FileAccessManagerOptions {
                host_name: "burrow.test".into(),
                tcp_end_points: Vec::new(),
                udp_end_points: Vec::new(),
                ga_measurement_id: None,
            },
        )
        .unwrap();
        let (cert_pem, key_pem) = access.load_or_create_certificate().unwrap();
        let der = rustls_pemfile::certs(&mut &cert_pem[..])
            .next()
            .unwrap()
            .unwrap();
        let certificate_hash = Sha256::digest(der.as_ref()).to_vec();
        Self {
            _dir: dir,
            access: Arc::new(access),
            cert_pem,
            key_pem,
            certificate_hash,
        }
    }

    fn server_options(&self, addr: SocketAddr) -> ServerOptions {
        ServerOptions {
            tcp_listen: vec![addr],
            public_end_points: vec![addr],
            certificate_pem: self.cert_pem.clone(),
            private_key_pem: self.key_pem.clone(),
            session: test_session_options(),
            allow_loopback: true,
            status_interval: Duration::from_secs(600),
            ..ServerOptions::default()
        }
    }

    fn start_server(
        &self,
        access: Arc<dyn AccessManager>,
        addr: SocketAddr,
    ) -> (tokio::sync::watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let options = self.server_options(addr);
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move {
            let server = BurrowServer::new(access, options);
            if let Err(err) = server.run(rx).await {
                eprintln!("server ended: {err:#}");
            }
        });
        (tx, handle)
    }

    fn token(&self, addr: SocketAddr, max_clients: u32, max_traffic: u64) -> Token {
        let mut item = self
            .access
            .create_token("e2e", max_clients, max_traffic)
            .unwrap();
        item.token.host_end_points = vec![addr];
        item.token.certificate_hash = self.certificate_hash.clone();
        self.access.write_token(&item).unwrap();
        item.token
    }
}

async fn udp_echo_server() -> SocketAddr {
    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = sock.recv_from(&mut buf).await {
            let _ = sock.send_to(&buf[..n], from).await;
        }
    });
    addr
}

fn udp_packet(src: &str, dst: SocketAddr, payload: &[u8]) -> IpPacket {
    burrow::packet::build_udp(src.parse().unwrap(), dst, payload).unwrap()
}

async fn connect_client(
    token: Token,
    use_udp: bool,
) -> (
    Arc<BurrowClient>,
    Arc<MemoryPacketCapture>,
    mpsc::Receiver<Vec<IpPacket>>,
) {
    let capture = Arc::new(MemoryPacketCapture::new(Vec::new()));
    let inbound = capture.take_inbound_receiver().unwrap();
    let mut options = ClientOptions::new(token);
    options.use_udp_channel = use_udp;
    options.connect_timeout = Duration::from_secs(10);
    let client = BurrowClient::connect(capture.clone(), options).await.unwrap();
    (client, capture, inbound)
}

/// Waits for a UDP reply among delivered batches; panics on timeout.
async fn expect_udp_reply(
    inbound: &mut mpsc::Receiver<Vec<IpPacket>>,
    payload: &[u8],
) -> IpPacket {
    let deadline = Duration::from_secs(15);
    let reply = tokio::time::timeout(deadline, async {
        loop {
            let batch = inbound.recv().await.expect("capture closed");
            for p in batch {
                if p.udp_payload() == Some(payload) {
                    return p;
                }
            }
        }
    })
    .await;
    reply.expect("no tunneled reply arrived in time")
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Duration::from_secs(15);
    let ok = tokio::time::timeout(deadline, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    ok.unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn hello_happy_path_echoes_udp() {
    let fx = Fixture::new();
    let addr = free_port();
    let (_stop, _h) = fx.start_server(fx.access.clone(), addr);
    let echo = udp_echo_server().await;

    let (client, capture, mut inbound) = connect_client(fx.token(addr, 0, 0), false).await;
    assert_ne!(client.session_id(), 0);
    assert_eq!(client.session_status().error_code, ErrorCode::Ok);

    let payload = [0x42u8; 64];
    capture
        .inject(vec![udp_packet("10.0.0.2:40000", echo, &payload)])
        .await;

    let reply = expect_udp_reply(&mut inbound, &payload).await;
    assert_eq!(reply.source_endpoint(), Some(echo));
    assert_eq!(
        reply.destination_endpoint().unwrap().to_string(),
        "10.0.0.2:40000"
    );

    client.disconnect().await;
}

#[tokio::test]
async fn redirected_tcp_flow_hits_loopback_catcher() {
    let fx = Fixture::new();
    let addr = free_port();
    let (_stop, _h) = fx.start_server(fx.access.clone(), addr);

    let (client, capture, mut inbound) = connect_client(fx.token(addr, 0, 0), false).await;

    // A raw SYN toward an in-range destination.
    let mut buf = vec![0u8; 40];
    buf[0] = 0x45;
    buf[2..4].copy_from_slice(&40u16.to_be_bytes());
    buf[8] = 64;
    buf[9] = 6; // tcp
    buf[12..16].copy_from_slice(&[10, 0, 0, 2]);
    buf[16..20].copy_from_slice(&[93, 184, 216, 34]);
    buf[20..22].copy_from_slice(&44123u16.to_be_bytes()); // sport
    buf[22..24].copy_from_slice(&443u16.to_be_bytes()); // dport
    buf[32] = 0x50; // data offset
    buf[33] = 0x02; // syn
    let syn = IpPacket::parse(&buf[..]).unwrap();
    capture.inject(vec![syn]).await;

    let redirected = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("no redirected packet")
        .unwrap();
    let catcher = client.catcher_end_point();
    assert_eq!(redirected[0].destination_endpoint(), Some(catcher));
    assert_eq!(redirected[0].source_port(), Some(44123));

    client.disconnect().await;
}

#[tokio::test]
async fn quota_exceeded_mid_session() {
    let fx = Fixture::new();
    let addr = free_port();
    let (_stop, _h) = fx.start_server(fx.access.clone(), addr);
    let echo = udp_echo_server().await;

    let token = fx.token(addr, 0, 50);
    let (client, capture, mut inbound) = connect_client(token.clone(), false).await;

    // Push more than 50 bytes through the tunnel.
    let payload = [0x7au8; 200];
    capture
        .inject(vec![udp_packet("10.0.0.2:41000", echo, &payload)])
        .await;
    expect_udp_reply(&mut inbound, &payload).await;

    // Within a sync interval the server learns the overflow and ends the
    // session; the client observes it on its next request.
    wait_for("client sees quota overflow", || {
        client.session_status().error_code == ErrorCode::AccessTrafficOverflow
    })
    .await;

    // A fresh hello with the same token now fails with the same code.
    let capture2 = Arc::new(MemoryPacketCapture::new(Vec::new()));
    let err = BurrowClient::connect(capture2, ClientOptions::new(token))
        .await
        .unwrap_err();
    assert_eq!(err.error_code, ErrorCode::AccessTrafficOverflow);
}

#[tokio::test]
async fn suppression_displaces_oldest_client() {
    let fx = Fixture::new();
    let addr = free_port();
    let (_stop, _h) = fx.start_server(fx.access.clone(), addr);

    let token = fx.token(addr, 2, 0);
    let (c1, _cap1, _in1) = connect_client(token.clone(), false).await;
    let (c2, _cap2, _in2) = connect_client(token.clone(), false).await;
    let (c3, _cap3, _in3) = connect_client(token.clone(), false).await;

    wait_for("c1 suppressed", || {
        c1.session_status().error_code == ErrorCode::SessionSuppressedByOther
    })
    .await;
    assert_eq!(c1.session_status().suppressed_by, SuppressType::Other);

    // The newer clients keep working.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(c2.session_status().error_code, ErrorCode::Ok);
    assert_eq!(c3.session_status().error_code, ErrorCode::Ok);
}

/// Counts `session_get` calls so the restart test can prove single-flight
/// recovery.
struct CountingAccess {
    inner: Arc<FileAccessManager>,
    gets: AtomicUsize,
}

#[async_trait::async_trait]
impl AccessManager for CountingAccess {
    async fn server_configure(&self, i: ServerInfo) -> Result<ServerConfig, AccessError> {
        self.inner.server_configure(i).await
    }
    async fn server_status(&self, s: ServerStatus) -> Result<ServerCommand, AccessError> {
        self.inner.server_status(s).await
    }
    async fn session_create(
        &self,
        r: SessionRequestEx,
    ) -> Result<SessionResponseEx, AccessError> {
        self.inner.session_create(r).await
    }
    async fn session_get(
        &self,
        id: u64,
        h: SocketAddr,
        c: Option<IpAddr>,
    ) -> Result<SessionResponseEx, AccessError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.session_get(id, h, c).await
    }
    async fn add_usage(
        &self,
        id: u64,
        t: Traffic,
        c: bool,
    ) -> Result<SessionResponse, AccessError> {
        self.inner.add_usage(id, t, c).await
    }
    async fn certificate_get(&self, h: SocketAddr) -> Result<Vec<u8>, AccessError> {
        self.inner.certificate_get(h).await
    }
}

#[tokio::test]
async fn server_restart_recovers_session() {
    let fx = Fixture::new();
    let addr = free_port();
    let counting = Arc::new(CountingAccess {
        inner: fx.access.clone(),
        gets: AtomicUsize::new(0),
    });

    let (_stop1, handle1) = fx.start_server(counting.clone(), addr);
    let echo = udp_echo_server().await;

    let (client, capture, mut inbound) = connect_client(fx.token(addr, 0, 0), false).await;
    let payload = [1u8; 32];
    capture
        .inject(vec![udp_packet("10.0.0.2:42000", echo, &payload)])
        .await;
    expect_udp_reply(&mut inbound, &payload).await;

    // Hard restart: the first server never gets to say goodbye.
    handle1.abort();
    let _ = handle1.await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (_stop2, _handle2) = fx.start_server(counting.clone(), addr);

    // The client's channel died with the server; its next channel request
    // makes the new server recover the session from the access manager.
    let payload2 = [2u8; 32];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        capture
            .inject(vec![udp_packet("10.0.0.2:42000", echo, &payload2)])
            .await;
        let got = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let batch = inbound.recv().await.expect("capture closed");
                if batch.iter().any(|p| p.udp_payload() == Some(&payload2[..])) {
                    return;
                }
            }
        })
        .await;
        if got.is_ok() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session did not resume after restart"
        );
    }

    assert_eq!(counting.gets.load(Ordering::SeqCst), 1, "exactly one recovery call");
    assert_eq!(client.session_status().error_code, ErrorCode::Ok);
}

/// First create is answered with a redirect to the second server.
struct RedirectingAccess {
    inner: Arc<FileAccessManager>,
    redirect_to: SocketAddr,
    redirected: AtomicBool,
}

#[async_trait::async_trait]
impl AccessManager for RedirectingAccess {
    async fn server_configure(&self, i: ServerInfo) -> Result<ServerConfig, AccessError> {
        self.inner.server_configure(i).await
    }
    async fn server_status(&self, s: ServerStatus) -> Result<ServerCommand, AccessError> {
        self.inner.server_status(s).await
    }
    async fn session_create(
        &self,
        r: SessionRequestEx,
    ) -> Result<SessionResponseEx, AccessError> {
        if !self.redirected.swap(true, Ordering::SeqCst) {
            return Ok(SessionResponseEx::error(SessionResponse {
                error_code: ErrorCode::RedirectHost,
                error_message: Some("use the other endpoint".into()),
                redirect_host_end_point: Some(self.redirect_to),
                ..SessionResponse::default()
            }));
        }
        self.inner.session_create(r).await
    }
    async fn session_get(
        &self,
        id: u64,
        h: SocketAddr,
        c: Option<IpAddr>,
    ) -> Result<SessionResponseEx, AccessError> {
        self.inner.session_get(id, h, c).await
    }
    async fn add_usage(
        &self,
        id: u64,
        t: Traffic,
        c: bool,
    ) -> Result<SessionResponse, AccessError> {
        self.inner.add_usage(id, t, c).await
    }
    async fn certificate_get(&self, h: SocketAddr) -> Result<Vec<u8>, AccessError> {
        self.inner.certificate_get(h).await
    }
}

#[tokio::test]
async fn redirect_host_moves_client_once() {
    let fx = Fixture::new();
    let addr1 = free_port();
    let addr2 = free_port();

    let redirecting = Arc::new(RedirectingAccess {
        inner: fx.access.clone(),
        redirect_to: addr2,
        redirected: AtomicBool::new(false),
    });
    let (_s1, _h1) = fx.start_server(redirecting.clone(), addr1);
    let (_s2, _h2) = fx.start_server(redirecting.clone(), addr2);

    let (client, _capture, _inbound) = connect_client(fx.token(addr1, 0, 0), false).await;
    assert_eq!(client.session_status().error_code, ErrorCode::Ok);
    assert_ne!(client.session_id(), 0);
    assert!(redirecting.redirected.load(Ordering::SeqCst));
}

#[tokio::test]
async fn udp_channel_switches_to_stream_mode() {
    let fx = Fixture::new();
    let addr = free_port();
    let (_stop, _h) = fx.start_server(fx.access.clone(), addr);
    let echo = udp_echo_server().await;

    let (client, capture, mut inbound) = connect_client(fx.token(addr, 0, 0), true).await;

    wait_for("udp channel up", || {
        client.tunnel().datagram_channel_kind() == Some(ChannelKind::Udp)
            && client.tunnel().datagram_channel_count() == 1
    })
    .await;

    // Traffic flows over the encrypted UDP channel.
    let payload = [9u8; 48];
    capture
        .inject(vec![udp_packet("10.0.0.2:43000", echo, &payload)])
        .await;
    expect_udp_reply(&mut inbound, &payload).await;

    // Flipping to stream mode displaces the UDP channel.
    client.set_use_udp_channel(false);
    wait_for("stream mode", || {
        client.tunnel().datagram_channel_kind() == Some(ChannelKind::Stream)
    })
    .await;
    assert_eq!(client.tunnel().datagram_channel_count(), 1);

    let payload2 = [8u8; 48];
    capture
        .inject(vec![udp_packet("10.0.0.2:43000", echo, &payload2)])
        .await;
    expect_udp_reply(&mut inbound, &payload2).await;
}
