pub mod file;
pub mod http;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::burrow::protocol::{ClientInfo, SessionResponse, Traffic};
use crate::burrow::util::serde_b64;

pub use file::FileAccessManager;
pub use http::HttpAccessManager;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("session or token not found")]
    NotFound,
    #[error("access manager is in maintenance mode")]
    Maintenance,
    #[error("api error {status}: {error}")]
    Api { status: u16, error: ApiError },
    #[error("network: {0}")]
    Network(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON error envelope of the HTTP access-manager API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub exception_type_name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.exception_type_name, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: uuid::Uuid,
    pub version: String,
    #[serde(default)]
    pub machine_name: String,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Session knobs the access manager may override; unset fields keep the
/// server's local configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptionsPatch {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub sync_interval_ms: Option<u64>,
    #[serde(default)]
    pub sync_cache_size: Option<u64>,
    #[serde(default)]
    pub max_datagram_channel_count: Option<usize>,
    #[serde(default)]
    pub max_tcp_channel_count: Option<usize>,
    #[serde(default)]
    pub max_tcp_connect_wait_count: Option<usize>,
    #[serde(default)]
    pub max_udp_client_count: Option<usize>,
    #[serde(default)]
    pub net_scan_limit: Option<usize>,
    #[serde(default)]
    pub net_scan_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingOptions {
    #[serde(default)]
    pub ga_measurement_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub tcp_end_points: Vec<SocketAddr>,
    #[serde(default)]
    pub udp_end_points: Vec<SocketAddr>,
    #[serde(default)]
    pub session_options: SessionOptionsPatch,
    #[serde(default)]
    pub tracking_options: TrackingOptions,
    #[serde(default, with = "serde_b64")]
    pub server_secret: Vec<u8>,
    /// Opaque config version; echoed in status so the manager can request a
    /// re-configure.
    #[serde(default)]
    pub config_code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStatus {
    pub session_count: usize,
    pub tcp_channel_count: usize,
    pub udp_client_count: usize,
    pub tunnel_speed: Traffic,
    #[serde(default)]
    pub config_code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCommand {
    #[serde(default)]
    pub config_code: String,
}

/// What the server sends to create a session on behalf of a hello request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequestEx {
    pub token_id: uuid::Uuid,
    pub client_info: ClientInfo,
    #[serde(with = "serde_b64")]
    pub encrypted_client_id: Vec<u8>,
    pub client_ip: Option<IpAddr>,
    pub host_end_point: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponseEx {
    #[serde(flatten)]
    pub response: SessionResponse,
    pub session_id: u64,
    #[serde(default, with = "serde_b64")]
    pub session_key: Vec<u8>,
    #[serde(default)]
    pub extra_data: Option<String>,
}

impl SessionResponseEx {
    pub fn error(response: SessionResponse) -> Self {
        Self {
            response,
            session_id: 0,
            session_key: Vec::new(),
            extra_data: None,
        }
    }
}

/// External authority for tokens, sessions and usage. Shared across
/// sessions; all methods are safe to call concurrently.
#[async_trait]
pub trait AccessManager: Send + Sync {
    async fn server_configure(&self, info: ServerInfo) -> Result<ServerConfig, AccessError>;

    async fn server_status(&self, status: ServerStatus) -> Result<ServerCommand, AccessError>;

    async fn session_create(
        &self,
        request: SessionRequestEx,
    ) -> Result<SessionResponseEx, AccessError>;

    async fn session_get(
        &self,
        session_id: u64,
        host_end_point: SocketAddr,
        client_ip: Option<IpAddr>,
    ) -> Result<SessionResponseEx, AccessError>;

    /// Records a usage delta; `close` also finalizes the session. Returns
    /// the session's current status, which may carry a fatal code.
    async fn add_usage(
        &self,
        session_id: u64,
        traffic: Traffic,
        close: bool,
    ) -> Result<SessionResponse, AccessError>;

    /// Raw certificate bytes for the given listener endpoint.
    async fn certificate_get(&self, host_end_point: SocketAddr) -> Result<Vec<u8>, AccessError>;
}
