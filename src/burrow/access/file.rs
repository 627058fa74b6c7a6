use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::burrow::access::{
    AccessError, AccessManager, ServerCommand, ServerConfig, ServerInfo, ServerStatus,
    SessionRequestEx, SessionResponseEx,
};
use crate::burrow::error::{ErrorCode, SuppressType};
use crate::burrow::protocol::{AccessUsage, SessionResponse, Traffic};
use crate::burrow::token::Token;

const SERVER_ID_FILE: &str = "server-id";
const SERVER_KEY_FILE: &str = "server-key";
const LAST_CONFIG_FILE: &str = "last-config.json";
const CERT_DIR: &str = "certificates";
const CERT_FILE: &str = "default.pem";
const CERT_KEY_FILE: &str = "secret";

/// A token plus the quotas the server enforces for it. Persisted as
/// `<token-id>.token`; live byte counters live next to it in
/// `<token-id>.usage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessItem {
    pub token: Token,
    /// 0 disables suppression entirely.
    pub max_client_count: u32,
    /// 0 = unlimited bytes.
    pub max_traffic: u64,
    /// Unix millis; None = never expires.
    pub expiration_time: Option<u64>,
}

struct LiveSession {
    token_id: uuid::Uuid,
    client_id: uuid::Uuid,
    client_ip: Option<IpAddr>,
    session_key: Vec<u8>,
    error_code: ErrorCode,
    error_message: Option<String>,
    suppressed_by: SuppressType,
    closed: bool,
}

#[derive(Debug, Clone)]
pub struct FileAccessManagerOptions {
    pub host_name: String,
    pub tcp_end_points: Vec<SocketAddr>,
    pub udp_end_points: Vec<SocketAddr>,
    pub ga_measurement_id: Option<String>,
}

/// Access manager backed by the working directory: good enough to run a
/// standalone server and to drive the end-to-end tests.
pub struct FileAccessManager {
    storage_dir: PathBuf,
    options: FileAccessManagerOptions,
    sessions: DashMap<u64, LiveSession>,
    next_session_id: AtomicU64,
}

impl FileAccessManager {
    pub fn new(storage_dir: impl Into<PathBuf>, options: FileAccessManagerOptions) -> anyhow::Result<Self> {
        let storage_dir = storage_dir.into();
        std::fs::create_dir_all(&storage_dir)
            .with_context(|| format!("storage: mkdir {}", storage_dir.display()))?;
        std::fs::create_dir_all(storage_dir.join(CERT_DIR))
            .with_context(|| format!("storage: mkdir {}", storage_dir.join(CERT_DIR).display()))?;
        Ok(Self {
            storage_dir,
            options,
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1000 + u64::from(rand::random::<u16>())),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn token_path(&self, token_id: uuid::Uuid) -> PathBuf {
        self.storage_dir.join(format!("{token_id}.token"))
    }

    fn usage_path(&self, token_id: uuid::Uuid) -> PathBuf {
        self.storage_dir.join(format!("{token_id}.usage"))
    }

    /// Creates and persists a token bound to this manager's endpoints.
    pub fn create_token(
        &self,
        name: &str,
        max_client_count: u32,
        max_traffic: u64,
    ) -> anyhow::Result<AccessItem> {
        let mut secret = vec![0u8; 16];
        rand::rng().fill_bytes(&mut secret);
        let item = AccessItem {
            token: Token {
                token_id: uuid::Uuid::new_v4(),
                secret,
                name: name.to_string(),
                host_name: self.options.host_name.clone(),
                host_end_points: self.options.tcp_end_points.clone(),
                certificate_hash: Vec::new(),
                url: None,
                supported_protocol_version: None,
            },
            max_client_count,
            max_traffic,
            expiration_time: None,
        };
        self.write_token(&item)?;
        Ok(item)
    }

    pub fn write_token(&self, item: &AccessItem) -> anyhow::Result<()> {
        let path = self.token_path(item.token.token_id);
        std::fs::write(&path, serde_json::to_vec_pretty(item)?)
            .with_context(|| format!("storage: write {}", path.display()))?;
        Ok(())
    }

    pub fn get_token(&self, token_id: uuid::Uuid) -> Option<AccessItem> {
        let bytes = std::fs::read(self.token_path(token_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn list_tokens(&self) -> Vec<AccessItem> {
        let Ok(entries) = std::fs::read_dir(&self.storage_dir) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("token")
                && let Ok(bytes) = std::fs::read(&path)
                && let Ok(item) = serde_json::from_slice::<AccessItem>(&bytes)
            {
                out.push(item);
            }
        }
        out
    }

    pub fn delete_token(&self, token_id: uuid::Uuid) -> anyhow::Result<()> {
        let path = self.token_path(token_id);
        std::fs::remove_file(&path)
            .with_context(|| format!("storage: remove {}", path.display()))?;
        let _ = std::fs::remove_file(self.usage_path(token_id));
        Ok(())
    }

    pub fn read_usage(&self, token_id: uuid::Uuid) -> Traffic {
        std::fs::read(self.usage_path(token_id))
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default()
    }

    fn write_usage(&self, token_id: uuid::Uuid, usage: Traffic) -> Result<(), AccessError> {
        std::fs::write(
            self.usage_path(token_id),
            serde_json::to_vec(&usage)?,
        )?;
        Ok(())
    }

    pub fn server_id(&self) -> anyhow::Result<uuid::Uuid> {
        let path = self.storage_dir.join(SERVER_ID_FILE);
        if let Ok(text) = std::fs::read_to_string(&path)
            && let Ok(id) = text.trim().parse()
        {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4();
        std::fs::write(&path, id.to_string())
            .with_context(|| format!("storage: write {}", path.display()))?;
        Ok(id)
    }

    pub fn server_key(&self) -> anyhow::Result<Vec<u8>> {
        let path = self.storage_dir.join(SERVER_KEY_FILE);
        if let Ok(text) = std::fs::read_to_string(&path)
            && let Ok(key) = BASE64.decode(text.trim())
            && key.len() == 16
        {
            return Ok(key);
        }
        let mut key = vec![0u8; 16];
        rand::rng().fill_bytes(&mut key);
        std::fs::write(&path, BASE64.encode(&key))
            .with_context(|| format!("storage: write {}", path.display()))?;
        Ok(key)
    }

    /// Returns (certificate PEM, private key PEM), generating a self-signed
    /// pair on first use.
    pub fn load_or_create_certificate(&self) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
        let cert_path = self.storage_dir.join(CERT_DIR).join(CERT_FILE);
        let key_path = self.storage_dir.join(CERT_DIR).join(CERT_KEY_FILE);
        if let (Ok(cert), Ok(key)) = (std::fs::read(&cert_path), std::fs::read(&key_path)) {
            return Ok((cert, key));
        }

        let host = if self.options.host_name.trim().is_empty() {
            "localhost".to_string()
        } else {
            self.options.host_name.clone()
        };
        let key_pair = rcgen::KeyPair::generate().context("certificate: generate key")?;
        let params = rcgen::CertificateParams::new(vec![host])
            .context("certificate: params")?;
        let cert = params
            .self_signed(&key_pair)
            .context("certificate: self-sign")?;

        let cert_pem = cert.pem().into_bytes();
        let key_pem = key_pair.serialize_pem().into_bytes();
        std::fs::write(&cert_path, &cert_pem)
            .with_context(|| format!("storage: write {}", cert_path.display()))?;
        std::fs::write(&key_path, &key_pem)
            .with_context(|| format!("storage: write {}", key_path.display()))?;
        Ok((cert_pem, key_pem))
    }

    fn access_usage(&self, item: &AccessItem) -> AccessUsage {
        let active = self
            .sessions
            .iter()
            .filter(|s| s.token_id == item.token.token_id && !s.closed && s.error_code == ErrorCode::Ok)
            .count();
        AccessUsage {
            used_traffic: self.read_usage(item.token.token_id),
            max_traffic: item.max_traffic,
            expiration_time: item.expiration_time,
            max_client_count: item.max_client_count,
            active_client_count: active as u32,
        }
    }

    /// Quota and expiry verdict for a token.
    fn evaluate(&self, item: &AccessItem) -> (ErrorCode, Option<String>) {
        if let Some(expiration) = item.expiration_time {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            if now >= expiration {
                return (ErrorCode::AccessExpired, Some("token has expired".into()));
            }
        }
        if item.max_traffic > 0 && self.read_usage(item.token.token_id).total() >= item.max_traffic
        {
            return (
                ErrorCode::AccessTrafficOverflow,
                Some("traffic quota exceeded".into()),
            );
        }
        (ErrorCode::Ok, None)
    }

    /// Marks the oldest surplus sessions of the token as suppressed.
    fn suppress_surplus(&self, item: &AccessItem, new_client_id: uuid::Uuid) {
        if item.max_client_count == 0 {
            return;
        }
        let mut live: Vec<u64> = self
            .sessions
            .iter()
            .filter(|s| {
                s.token_id == item.token.token_id && !s.closed && s.error_code == ErrorCode::Ok
            })
            .map(|s| *s.key())
            .collect();
        live.sort_unstable();

        let surplus = live
            .len()
            .saturating_sub(item.max_client_count.saturating_sub(1) as usize);
        for session_id in live.into_iter().take(surplus) {
            if let Some(mut s) = self.sessions.get_mut(&session_id) {
                let by_self = s.client_id == new_client_id;
                s.suppressed_by = if by_self {
                    SuppressType::YourSelf
                } else {
                    SuppressType::Other
                };
                s.error_code = if by_self {
                    ErrorCode::SessionSuppressedBySelf
                } else {
                    ErrorCode::SessionSuppressedByOther
                };
                s.error_message = Some("session displaced by a newer client".into());
                tracing::info!(session_id, by_self, "access: session suppressed");
            }
        }
    }

    fn session_response(&self, session: &LiveSession) -> SessionResponse {
        let access_usage = self
            .get_token(session.token_id)
            .map(|item| self.access_usage(&item));
        SessionResponse {
            error_code: session.error_code,
            error_message: session.error_message.clone(),
            suppressed_by: session.suppressed_by,
            redirect_host_end_point: None,
            access_usage,
        }
    }
}

#[async_trait]
impl AccessManager for FileAccessManager {
    async fn server_configure(&self, info: ServerInfo) -> Result<ServerConfig, AccessError> {
        let server_secret = self
            .server_key()
            .map_err(|e| AccessError::Network(e.to_string()))?;
        let config = ServerConfig {
            tcp_end_points: self.options.tcp_end_points.clone(),
            udp_end_points: self.options.udp_end_points.clone(),
            session_options: Default::default(),
            tracking_options: crate::burrow::access::TrackingOptions {
                ga_measurement_id: self.options.ga_measurement_id.clone(),
            },
            server_secret,
            config_code: info.server_id.to_string(),
        };
        std::fs::write(
            self.storage_dir.join(LAST_CONFIG_FILE),
            serde_json::to_vec_pretty(&config)?,
        )?;
        Ok(config)
    }

    async fn server_status(&self, status: ServerStatus) -> Result<ServerCommand, AccessError> {
        Ok(ServerCommand {
            config_code: status.config_code,
        })
    }

    async fn session_create(
        &self,
        request: SessionRequestEx,
    ) -> Result<SessionResponseEx, AccessError> {
        let Some(item) = self.get_token(request.token_id) else {
            return Err(AccessError::NotFound);
        };

        let proof = item
            .token
            .decrypt_client_id(&request.encrypted_client_id)
            .ok()
            .flatten();
        if proof != Some(request.client_info.client_id) {
            return Ok(SessionResponseEx::error(SessionResponse::from_error(
                ErrorCode::AccessError,
                "client id proof mismatch",
            )));
        }

        let (code, message) = self.evaluate(&item);
        if code != ErrorCode::Ok {
            return Ok(SessionResponseEx::error(SessionResponse {
                error_code: code,
                error_message: message,
                ..SessionResponse::default()
            }));
        }

        self.suppress_surplus(&item, request.client_info.client_id);

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let mut session_key = vec![0u8; 16];
        rand::rng().fill_bytes(&mut session_key);
        self.sessions.insert(
            session_id,
            LiveSession {
                token_id: request.token_id,
                client_id: request.client_info.client_id,
                client_ip: request.client_ip,
                session_key: session_key.clone(),
                error_code: ErrorCode::Ok,
                error_message: None,
                suppressed_by: SuppressType::None,
                closed: false,
            },
        );
        tracing::info!(
            session_id,
            token_id = %request.token_id,
            client_ip = ?request.client_ip,
            "access: session created"
        );

        Ok(SessionResponseEx {
            response: SessionResponse {
                access_usage: Some(self.access_usage(&item)),
                ..SessionResponse::ok()
            },
            session_id,
            session_key,
            extra_data: None,
        })
    }

    async fn session_get(
        &self,
        session_id: u64,
        _host_end_point: SocketAddr,
        client_ip: Option<IpAddr>,
    ) -> Result<SessionResponseEx, AccessError> {
        let Some(session) = self.sessions.get(&session_id) else {
            return Err(AccessError::NotFound);
        };
        tracing::debug!(
            session_id,
            created_from = ?session.client_ip,
            queried_from = ?client_ip,
            "access: session recovered"
        );
        Ok(SessionResponseEx {
            response: self.session_response(&session),
            session_id,
            session_key: session.session_key.clone(),
            extra_data: None,
        })
    }

    async fn add_usage(
        &self,
        session_id: u64,
        traffic: Traffic,
        close: bool,
    ) -> Result<SessionResponse, AccessError> {
        let token_id = {
            let Some(session) = self.sessions.get(&session_id) else {
                return Err(AccessError::NotFound);
            };
            session.token_id
        };

        let mut usage = self.read_usage(token_id);
        usage += traffic;
        self.write_usage(token_id, usage)?;

        let item = self.get_token(token_id).ok_or(AccessError::NotFound)?;
        let (code, message) = self.evaluate(&item);

        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(AccessError::NotFound)?;
        if session.error_code == ErrorCode::Ok && code != ErrorCode::Ok {
            session.error_code = code;
            session.error_message = message;
        }
        if close && !session.closed {
            session.closed = true;
            if session.error_code == ErrorCode::Ok {
                session.error_code = ErrorCode::SessionClosed;
                session.error_message = Some("session closed by peer".into());
            }
        }
        Ok(self.session_response(&session))
    }

    async fn certificate_get(&self, _host_end_point: SocketAddr) -> Result<Vec<u8>, AccessError> {
        let path = self.storage_dir.join(CERT_DIR).join(CERT_FILE);
        Ok(std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burrow::protocol::ClientInfo;

    fn manager() -> (tempfile::TempDir, FileAccessManager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileAccessManager::new(
            dir.path().join("storage"),
            FileAccessManagerOptions {
                host_name: "test.burrow".into(),
                tcp_end_points: vec!["127.0.0.1:443".parse().unwrap()],
                udp_end_points: vec![],
                ga_measurement_id: None,
            },
        )
        .unwrap();
        (dir, mgr)
    }

    fn hello_for(item: &AccessItem, client_id: uuid::Uuid) -> SessionRequestEx {
        SessionRequestEx {
            token_id: item.token.token_id,
            client_info: ClientInfo {
                client_id,
                protocol_version: 2,
                client_version: "0.1.0".into(),
                user_agent: "test".into(),
            },
            encrypted_client_id: item.token.encrypt_client_id(client_id).unwrap(),
            client_ip: Some("192.0.2.5".parse().unwrap()),
            host_end_point: "127.0.0.1:443".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn create_and_recover_session() {
        let (_dir, mgr) = manager();
        let item = mgr.create_token("t", 0, 0).unwrap();
        let client_id = uuid::Uuid::new_v4();

        let created = mgr.session_create(hello_for(&item, client_id)).await.unwrap();
        assert_eq!(created.response.error_code, ErrorCode::Ok);
        assert_ne!(created.session_id, 0);
        assert_eq!(created.session_key.len(), 16);

        let got = mgr
            .session_get(created.session_id, "127.0.0.1:443".parse().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(got.session_key, created.session_key);

        assert!(matches!(
            mgr.session_get(created.session_id + 999, "127.0.0.1:443".parse().unwrap(), None)
                .await,
            Err(AccessError::NotFound)
        ));
    }

    #[tokio::test]
    async fn bad_proof_rejected() {
        let (_dir, mgr) = manager();
        let item = mgr.create_token("t", 0, 0).unwrap();
        let mut req = hello_for(&item, uuid::Uuid::new_v4());
        req.encrypted_client_id = vec![0u8; 16];
        let resp = mgr.session_create(req).await.unwrap();
        assert_eq!(resp.response.error_code, ErrorCode::AccessError);
        assert_eq!(resp.session_id, 0);
    }

    #[tokio::test]
    async fn quota_flips_session_and_future_hellos() {
        let (_dir, mgr) = manager();
        let item = mgr.create_token("t", 0, 50).unwrap();
        let created = mgr
            .session_create(hello_for(&item, uuid::Uuid::new_v4()))
            .await
            .unwrap();

        let resp = mgr
            .add_usage(created.session_id, Traffic::new(40, 30), false)
            .await
            .unwrap();
        assert_eq!(resp.error_code, ErrorCode::AccessTrafficOverflow);

        // The same token can no longer create sessions.
        let resp = mgr
            .session_create(hello_for(&item, uuid::Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(resp.response.error_code, ErrorCode::AccessTrafficOverflow);
    }

    #[tokio::test]
    async fn suppression_respects_max_clients() {
        let (_dir, mgr) = manager();
        let item = mgr.create_token("t", 2, 0).unwrap();

        let c1 = mgr
            .session_create(hello_for(&item, uuid::Uuid::new_v4()))
            .await
            .unwrap();
        let _c2 = mgr
            .session_create(hello_for(&item, uuid::Uuid::new_v4()))
            .await
            .unwrap();
        let _c3 = mgr
            .session_create(hello_for(&item, uuid::Uuid::new_v4()))
            .await
            .unwrap();

        let s1 = mgr
            .add_usage(c1.session_id, Traffic::default(), false)
            .await
            .unwrap();
        assert_eq!(s1.error_code, ErrorCode::SessionSuppressedByOther);
        assert_eq!(s1.suppressed_by, SuppressType::Other);
    }

    #[tokio::test]
    async fn zero_max_clients_disables_suppression() {
        let (_dir, mgr) = manager();
        let item = mgr.create_token("t", 0, 0).unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let r = mgr
                .session_create(hello_for(&item, uuid::Uuid::new_v4()))
                .await
                .unwrap();
            ids.push(r.session_id);
        }
        for id in ids {
            let s = mgr.add_usage(id, Traffic::default(), false).await.unwrap();
            assert_eq!(s.error_code, ErrorCode::Ok);
        }
    }

    #[tokio::test]
    async fn close_marks_session_closed() {
        let (_dir, mgr) = manager();
        let item = mgr.create_token("t", 0, 0).unwrap();
        let created = mgr
            .session_create(hello_for(&item, uuid::Uuid::new_v4()))
            .await
            .unwrap();
        let resp = mgr
            .add_usage(created.session_id, Traffic::new(1, 1), true)
            .await
            .unwrap();
        assert_eq!(resp.error_code, ErrorCode::SessionClosed);
    }

    #[tokio::test]
    async fn usage_persists_per_token() {
        let (_dir, mgr) = manager();
        let item = mgr.create_token("t", 0, 0).unwrap();
        let created = mgr
            .session_create(hello_for(&item, uuid::Uuid::new_v4()))
            .await
            .unwrap();
        mgr.add_usage(created.session_id, Traffic::new(10, 20), false)
            .await
            .unwrap();
        mgr.add_usage(created.session_id, Traffic::new(1, 2), false)
            .await
            .unwrap();
        assert_eq!(mgr.read_usage(item.token.token_id), Traffic::new(11, 22));
    }

    #[test]
    fn server_identity_is_stable() {
        let (_dir, mgr) = manager();
        assert_eq!(mgr.server_id().unwrap(), mgr.server_id().unwrap());
        assert_eq!(mgr.server_key().unwrap(), mgr.server_key().unwrap());
        assert_eq!(mgr.server_key().unwrap().len(), 16);
    }

    #[test]
    fn certificate_created_once() {
        let (_dir, mgr) = manager();
        let (cert1, key1) = mgr.load_or_create_certificate().unwrap();
        let (cert2, key2) = mgr.load_or_create_certificate().unwrap();
        assert_eq!(cert1, cert2);
        assert_eq!(key1, key2);
        assert!(String::from_utf8_lossy(&cert1).contains("BEGIN CERTIFICATE"));
    }
}
