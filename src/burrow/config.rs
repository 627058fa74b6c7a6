use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::burrow::server::{ServerOptions, SessionOptions};
use crate::burrow::util::net::SocketBuffers;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// text | json
    pub format: String,
    /// stderr | stdout | discard | <file path>
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// file | http
    pub kind: String,
    pub url: String,
    pub auth_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout_ms: Option<u64>,
    pub sync_interval_ms: Option<u64>,
    pub sync_cache_size: Option<u64>,
    pub max_datagram_channel_count: Option<usize>,
    pub max_tcp_channel_count: Option<usize>,
    pub max_tcp_connect_wait_count: Option<usize>,
    pub max_udp_client_count: Option<usize>,
    pub tcp_connect_timeout_ms: Option<u64>,
    pub tcp_graceful_timeout_ms: Option<u64>,
    pub udp_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub tcp_reuse_timeout_ms: Option<u64>,
    pub tcp_send_buffer: Option<usize>,
    pub tcp_recv_buffer: Option<usize>,
    pub mtu_no_fragment: Option<usize>,
    pub mtu_with_fragment: Option<usize>,
    pub net_scan_limit: Option<usize>,
    pub net_scan_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host_name: String,
    pub tcp_listen: Vec<SocketAddr>,
    /// Endpoints written into tokens and hello responses; defaults to the
    /// listeners.
    pub public_end_points: Vec<SocketAddr>,
    pub include_ip_ranges: Vec<ipnet::IpNet>,
    pub exclude_ip_ranges: Vec<ipnet::IpNet>,
    pub certificate_file: String,
    pub private_key_file: String,
    pub configure_retry_ms: u64,
    pub status_interval_ms: u64,
    pub ga_measurement_id: Option<String>,
    pub access: AccessConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            tcp_listen: vec!["0.0.0.0:443".parse().expect("valid default listen")],
            public_end_points: Vec::new(),
            include_ip_ranges: Vec::new(),
            exclude_ip_ranges: Vec::new(),
            certificate_file: String::new(),
            private_key_file: String::new(),
            configure_retry_ms: 30_000,
            status_interval_ms: 60_000,
            ga_measurement_id: None,
            access: AccessConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn session_options(&self) -> SessionOptions {
        let mut o = SessionOptions::default();
        let s = &self.session;
        if let Some(v) = s.timeout_ms {
            o.timeout = Duration::from_millis(v);
        }
        if let Some(v) = s.sync_interval_ms {
            o.sync_interval = Duration::from_millis(v);
        }
        if let Some(v) = s.sync_cache_size {
            o.sync_cache_size = v;
        }
        if let Some(v) = s.max_datagram_channel_count {
            o.max_datagram_channel_count = v;
        }
        if let Some(v) = s.max_tcp_channel_count {
            o.max_tcp_channel_count = v;
        }
        if let Some(v) = s.max_tcp_connect_wait_count {
            o.max_tcp_connect_wait_count = v;
        }
        if let Some(v) = s.max_udp_client_count {
            o.max_udp_client_count = v;
        }
        if let Some(v) = s.tcp_connect_timeout_ms {
            o.tcp_connect_timeout = Duration::from_millis(v);
        }
        if let Some(v) = s.tcp_graceful_timeout_ms {
            o.tcp_graceful_timeout = Duration::from_millis(v);
        }
        if let Some(v) = s.udp_timeout_ms {
            o.udp_timeout = Duration::from_millis(v);
        }
        if let Some(v) = s.request_timeout_ms {
            o.request_timeout = Duration::from_millis(v);
        }
        if let Some(v) = s.tcp_reuse_timeout_ms {
            o.tcp_reuse_timeout = Duration::from_millis(v);
        }
        o.tcp_buffers = SocketBuffers {
            send: s.tcp_send_buffer.unwrap_or(0),
            recv: s.tcp_recv_buffer.unwrap_or(0),
        };
        if let Some(v) = s.mtu_no_fragment {
            o.mtu_no_fragment = v;
        }
        if let Some(v) = s.mtu_with_fragment {
            o.mtu_with_fragment = v;
        }
        if let Some(v) = s.net_scan_limit {
            o.net_scan_limit = v;
        }
        if let Some(v) = s.net_scan_window_ms {
            o.net_scan_window = Duration::from_millis(v);
        }
        o
    }

    pub fn server_options(&self, server_id: uuid::Uuid) -> ServerOptions {
        ServerOptions {
            tcp_listen: self.tcp_listen.clone(),
            public_end_points: self.public_end_points.clone(),
            certificate_pem: Vec::new(),
            private_key_pem: Vec::new(),
            session: self.session_options(),
            include_ip_ranges: self.include_ip_ranges.clone(),
            exclude_ip_ranges: self.exclude_ip_ranges.clone(),
            allow_loopback: false,
            server_id,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            configure_retry: Duration::from_millis(self.configure_retry_ms),
            status_interval: Duration::from_millis(self.status_interval_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Cwd,
    Workdir,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Workdir => write!(f, "workdir"),
        }
    }
}

/// Flag (clap also maps BURROW_CONFIG into it) > burrow.toml in CWD >
/// burrow.toml in the working directory.
pub fn resolve_config_path(
    explicit: Option<PathBuf>,
    workdir: &Path,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    let cwd = Path::new("burrow.toml");
    if cwd.is_file() {
        return Ok(ResolvedConfigPath {
            path: cwd.to_path_buf(),
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: workdir.join("burrow.toml"),
        source: ConfigPathSource::Workdir,
    })
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Burrow server configuration.

# Public name clients put in their TLS handshake; also the certificate CN.
host_name = ""

tcp_listen = ["0.0.0.0:443"]

# Endpoints written into tokens; defaults to tcp_listen.
public_end_points = []

[access]
# "file" stores tokens under <workdir>/storage; "http" talks to a remote
# access manager.
kind = "file"
url = ""
auth_token = ""

[session]
# All durations in milliseconds; unset values use built-in defaults.
# sync_interval_ms = 30000
# net_scan_limit = 0

[logging]
level = "info"
format = "text"
output = "stderr"
"#;

/// Creates the config file with the commented template when missing.
/// Returns true when it was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match std::fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("config: stat {}", path.display()));
        }
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("config: create {}", path.display()))?;
    Ok(true)
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("config: read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&text).with_context(|| format!("config: parse {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_parses() {
        let cfg: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(cfg.access.kind, "file");
        assert_eq!(cfg.tcp_listen.len(), 1);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn session_overrides_apply() {
        let cfg: Config = toml::from_str(
            r#"
            [session]
            sync_interval_ms = 500
            sync_cache_size = 10
            net_scan_limit = 7
            "#,
        )
        .unwrap();
        let o = cfg.session_options();
        assert_eq!(o.sync_interval, Duration::from_millis(500));
        assert_eq!(o.sync_cache_size, 10);
        assert_eq!(o.net_scan_limit, 7);
        // Untouched knobs keep defaults.
        assert_eq!(o.max_tcp_channel_count, SessionOptions::default().max_tcp_channel_count);
    }

    #[test]
    fn ensure_creates_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/burrow.toml");
        assert!(ensure_config_file(&path).unwrap());
        assert!(!ensure_config_file(&path).unwrap());
        assert!(load_config(&path).is_ok());
    }

    #[test]
    fn resolve_prefers_flag() {
        let r = resolve_config_path(Some(PathBuf::from("/tmp/x.toml")), Path::new("/var/lib"))
            .unwrap();
        assert_eq!(r.path, PathBuf::from("/tmp/x.toml"));
        assert!(matches!(r.source, ConfigPathSource::Flag));
    }
}
