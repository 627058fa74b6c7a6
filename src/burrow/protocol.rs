use std::net::{IpAddr, SocketAddr};
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::burrow::error::{ErrorCode, SuppressType};
use crate::burrow::util::serde_b64;

/// Hard cap for a single length-prefixed JSON frame (request or response).
pub const MAX_FRAME_JSON_BYTES: u32 = 1 << 16; // 64 KiB

/// Stream-datagram channels frame packets as `<u16 BE length><payload>`,
/// so a tunneled packet can never exceed this.
pub const MAX_STREAM_DATAGRAM_BYTES: usize = u16::MAX as usize;

pub const PROTOCOL_VERSION: i32 = 2;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0}")]
    FrameTooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Byte counters of one direction pair. `sent`/`received` are always from
/// the owner's point of view; [`Traffic::flip`] swaps the axes when the
/// server reports "sent from tunnel" as "received by client".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub sent: u64,
    pub received: u64,
}

impl Traffic {
    pub fn new(sent: u64, received: u64) -> Self {
        Self { sent, received }
    }

    pub fn total(&self) -> u64 {
        self.sent + self.received
    }

    pub fn flip(&self) -> Self {
        Self {
            sent: self.received,
            received: self.sent,
        }
    }
}

impl Add for Traffic {
    type Output = Traffic;
    fn add(self, rhs: Traffic) -> Traffic {
        Traffic {
            sent: self.sent + rhs.sent,
            received: self.received + rhs.received,
        }
    }
}

impl AddAssign for Traffic {
    fn add_assign(&mut self, rhs: Traffic) {
        self.sent += rhs.sent;
        self.received += rhs.received;
    }
}

impl Sub for Traffic {
    type Output = Traffic;
    fn sub(self, rhs: Traffic) -> Traffic {
        Traffic {
            sent: self.sent.saturating_sub(rhs.sent),
            received: self.received.saturating_sub(rhs.received),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: uuid::Uuid,
    pub protocol_version: i32,
    #[serde(default)]
    pub client_version: String,
    #[serde(default)]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub request_id: String,
    pub token_id: uuid::Uuid,
    pub client_info: ClientInfo,
    /// AES block of the client id under the token secret; proves token
    /// possession without sending the secret.
    #[serde(with = "serde_b64")]
    pub encrypted_client_id: Vec<u8>,
    /// Ask the server to open a UDP channel for this session right away.
    #[serde(default)]
    pub use_udp_channel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub request_id: String,
    pub session_id: u64,
    #[serde(with = "serde_b64")]
    pub session_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProxyChannelRequest {
    #[serde(flatten)]
    pub session: SessionRequest,
    pub destination: SocketAddr,
}

/// One request per TCP/TLS connection, dispatched by `request_code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request_code")]
pub enum ClientRequest {
    Hello(HelloRequest),
    TcpDatagramChannel(SessionRequest),
    StreamProxyChannel(StreamProxyChannelRequest),
    /// Reserved; servers answer with `GeneralError`.
    UdpPacket(SessionRequest),
    Bye(SessionRequest),
}

impl ClientRequest {
    pub fn request_id(&self) -> &str {
        match self {
            ClientRequest::Hello(r) => &r.request_id,
            ClientRequest::TcpDatagramChannel(r)
            | ClientRequest::UdpPacket(r)
            | ClientRequest::Bye(r) => &r.request_id,
            ClientRequest::StreamProxyChannel(r) => &r.session.request_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessUsage {
    pub used_traffic: Traffic,
    /// 0 = unlimited.
    pub max_traffic: u64,
    /// Unix millis; None = never.
    pub expiration_time: Option<u64>,
    /// 0 = suppression disabled.
    pub max_client_count: u32,
    pub active_client_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionResponse {
    pub error_code: ErrorCode,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub suppressed_by: SuppressType,
    #[serde(default)]
    pub redirect_host_end_point: Option<SocketAddr>,
    #[serde(default)]
    pub access_usage: Option<AccessUsage>,
}

impl SessionResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn from_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    #[serde(flatten)]
    pub response: SessionResponse,
    // Everything below is meaningful only when `error_code` is `Ok`; error
    // responses may omit it all.
    #[serde(default)]
    pub session_id: u64,
    #[serde(default, with = "serde_b64")]
    pub session_key: Vec<u8>,
    #[serde(default, with = "serde_b64")]
    pub server_secret: Vec<u8>,
    #[serde(default)]
    pub server_protocol_version: i32,
    #[serde(default)]
    pub server_version: String,
    #[serde(default)]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub tcp_reuse_timeout_ms: u64,
    #[serde(default)]
    pub tcp_end_points: Vec<SocketAddr>,
    #[serde(default)]
    pub udp_end_points: Vec<SocketAddr>,
    #[serde(default)]
    pub max_datagram_channel_count: usize,
    /// Ranges the client should route into the tunnel; intersected with the
    /// client's own configuration.
    #[serde(default)]
    pub include_ip_ranges: Vec<ipnet::IpNet>,
    #[serde(default)]
    pub packet_capture_include_ip_ranges: Vec<ipnet::IpNet>,
    #[serde(default)]
    pub is_ip_v6_supported: bool,
    #[serde(default)]
    pub access_usage: Option<AccessUsage>,
    #[serde(default)]
    pub ga_measurement_id: Option<String>,
}

pub async fn write_frame<W, T>(w: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let b = serde_json::to_vec(value)?;
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_FRAME_JSON_BYTES {
        return Err(ProtocolError::FrameTooLarge(n));
    }
    w.write_u32(n).await?;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(r: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let n = r.read_u32().await?;
    if n > MAX_FRAME_JSON_BYTES {
        return Err(ProtocolError::FrameTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &ClientRequest,
) -> Result<(), ProtocolError> {
    write_frame(w, req).await
}

pub async fn read_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ClientRequest, ProtocolError> {
    read_frame(r).await
}

/// Host endpoint pair advertised to clients in the hello response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndPoint {
    pub address: IpAddr,
    pub port: u16,
}

impl From<SocketAddr> for HostEndPoint {
    fn from(a: SocketAddr) -> Self {
        Self {
            address: a.ip(),
            port: a.port(),
        }
    }
}

impl From<HostEndPoint> for SocketAddr {
    fn from(h: HostEndPoint) -> Self {
        SocketAddr::new(h.address, h.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_request() -> ClientRequest {
        ClientRequest::Hello(HelloRequest {
            request_id: "req-1".into(),
            token_id: uuid::Uuid::new_v4(),
            client_info: ClientInfo {
                client_id: uuid::Uuid::new_v4(),
                protocol_version: PROTOCOL_VERSION,
                client_version: "0.1.0".into(),
                user_agent: "test".into(),
            },
            encrypted_client_id: vec![7u8; 16],
            use_udp_channel: false,
        })
    }

    #[tokio::test]
    async fn request_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let req = hello_request();
        let sent = req.clone();
        let w = tokio::spawn(async move { write_request(&mut a, &sent).await });
        let got = read_request(&mut b).await.unwrap();
        w.await.unwrap().unwrap();

        match (req, got) {
            (ClientRequest::Hello(x), ClientRequest::Hello(y)) => {
                assert_eq!(x.request_id, y.request_id);
                assert_eq!(x.token_id, y.token_id);
                assert_eq!(x.encrypted_client_id, y.encrypted_client_id);
            }
            other => panic!("unexpected variant pair: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_u32(MAX_FRAME_JSON_BYTES + 1).await.unwrap();
        });

        let err = read_request(&mut b).await.unwrap_err();
        match err {
            ProtocolError::FrameTooLarge(n) => assert!(n > MAX_FRAME_JSON_BYTES),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn traffic_flip_and_sub() {
        let t = Traffic::new(10, 4);
        assert_eq!(t.flip(), Traffic::new(4, 10));
        assert_eq!(t - Traffic::new(3, 1), Traffic::new(7, 3));
        // Subtraction saturates rather than wrapping.
        assert_eq!(Traffic::new(1, 1) - Traffic::new(5, 5), Traffic::default());
        assert_eq!(t.total(), 14);
    }

    #[test]
    fn session_response_defaults() {
        let r: SessionResponse = serde_json::from_str("{\"error_code\":\"Ok\"}").unwrap();
        assert_eq!(r.error_code, ErrorCode::Ok);
        assert_eq!(r.suppressed_by, SuppressType::None);
        assert!(r.access_usage.is_none());
    }
}
