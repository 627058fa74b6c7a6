use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;

use crate::burrow::access::file::FileAccessManagerOptions;
use crate::burrow::access::{AccessManager, FileAccessManager, HttpAccessManager};
use crate::burrow::access::http::HttpAccessManagerOptions;
use crate::burrow::config::{self, Config};
use crate::burrow::logging;
use crate::burrow::server::{BurrowServer, ServerOptions};

const STORAGE_DIR: &str = "storage";
const LOCK_FILE: &str = "server.lock";
const COMMAND_FILE: &str = "command";
const COMMAND_POLL: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum TokenCommand {
    Create {
        name: String,
        max_clients: u32,
        max_traffic: u64,
    },
    List,
    Show { token_id: String },
    Delete { token_id: String },
}

fn resolve_workdir(workdir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match workdir {
        Some(p) => Ok(p),
        None => std::env::current_dir().context("resolve working directory"),
    }
}

fn storage_dir(workdir: &Path) -> PathBuf {
    workdir.join(STORAGE_DIR)
}

/// Single-instance guard: refuse to start while another live server owns
/// the lock file; stale locks from a crashed process are reclaimed.
struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    fn acquire(storage: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(storage)
            .with_context(|| format!("storage: mkdir {}", storage.display()))?;
        let path = storage.join(LOCK_FILE);

        if let Ok(text) = std::fs::read_to_string(&path)
            && let Ok(pid) = text.trim().parse::<i32>()
            && process_alive(pid)
        {
            anyhow::bail!("another server (pid {pid}) already runs in this working directory");
        }

        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("storage: write {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    pid > 0 && unsafe { libc::kill(pid, 0) } == 0
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

/// `burrow stop`: drop a command file for the running server to pick up.
pub fn send_stop_command(workdir: Option<PathBuf>) -> anyhow::Result<()> {
    let workdir = resolve_workdir(workdir)?;
    let storage = storage_dir(&workdir);
    let lock = storage.join(LOCK_FILE);
    if !lock.is_file() {
        anyhow::bail!("no running server found in {}", workdir.display());
    }
    let path = storage.join(COMMAND_FILE);
    std::fs::write(&path, "stop").with_context(|| format!("write {}", path.display()))?;
    println!("stop command sent");
    Ok(())
}

fn build_file_manager(cfg: &Config, storage: &Path) -> anyhow::Result<FileAccessManager> {
    let public = if cfg.public_end_points.is_empty() {
        cfg.tcp_listen.clone()
    } else {
        cfg.public_end_points.clone()
    };
    FileAccessManager::new(
        storage,
        FileAccessManagerOptions {
            host_name: cfg.host_name.clone(),
            tcp_end_points: public,
            udp_end_points: Vec::new(),
            ga_measurement_id: cfg.ga_measurement_id.clone(),
        },
    )
}

fn certificate_sha256(cert_pem: &[u8]) -> anyhow::Result<Vec<u8>> {
    let der = rustls_pemfile::certs(&mut &cert_pem[..])
        .next()
        .context("certificate pem is empty")?
        .context("certificate pem is invalid")?;
    Ok(Sha256::digest(der.as_ref()).to_vec())
}

pub async fn run(config_path: Option<PathBuf>, workdir: Option<PathBuf>) -> anyhow::Result<()> {
    let workdir = resolve_workdir(workdir)?;
    let storage = storage_dir(&workdir);

    let resolved = config::resolve_config_path(config_path, &workdir)?;
    let created = config::ensure_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let _lock = InstanceLock::acquire(&storage)?;

    // Access manager + certificate material.
    let kind = cfg.access.kind.trim().to_ascii_lowercase();
    let (access, cert_pem, key_pem, server_id): (Arc<dyn AccessManager>, Vec<u8>, Vec<u8>, uuid::Uuid) =
        match kind.as_str() {
            "" | "file" => {
                let manager = build_file_manager(&cfg, &storage)?;
                let (cert, key) = manager.load_or_create_certificate()?;
                let server_id = manager.server_id()?;
                (Arc::new(manager), cert, key, server_id)
            }
            "http" => {
                if cfg.certificate_file.trim().is_empty() || cfg.private_key_file.trim().is_empty()
                {
                    anyhow::bail!(
                        "config: access.kind = \"http\" needs certificate_file and private_key_file"
                    );
                }
                let cert = std::fs::read(&cfg.certificate_file)
                    .with_context(|| format!("read {}", cfg.certificate_file))?;
                let key = std::fs::read(&cfg.private_key_file)
                    .with_context(|| format!("read {}", cfg.private_key_file))?;
                let manager = HttpAccessManager::new(HttpAccessManagerOptions {
                    base_url: cfg.access.url.clone(),
                    auth_token: cfg.access.auth_token.clone(),
                    request_timeout: Duration::from_secs(30),
                })
                .map_err(|e| anyhow::anyhow!("access manager: {e}"))?;
                // Server identity is still file-backed so it survives restarts.
                let id_store = build_file_manager(&cfg, &storage)?;
                let server_id = id_store.server_id()?;
                (Arc::new(manager), cert, key, server_id)
            }
            other => anyhow::bail!("config: unknown access.kind {other:?}"),
        };

    let mut options: ServerOptions = cfg.server_options(server_id);
    options.certificate_pem = cert_pem;
    options.private_key_pem = key_pem;

    tracing::info!(
        config = %resolved.path.display(),
        workdir = %workdir.display(),
        access = %kind,
        listeners = options.tcp_listen.len(),
        "burrow: starting"
    );

    let server = BurrowServer::new(access, options);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    // Stop-file IPC: `burrow stop` in the same working directory.
    {
        let command_path = storage.join(COMMAND_FILE);
        let shutdown_tx = shutdown_tx.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(COMMAND_POLL) => {
                        if let Ok(text) = std::fs::read_to_string(&command_path) {
                            let _ = std::fs::remove_file(&command_path);
                            if text.trim() == "stop" {
                                tracing::info!("burrow: stop command received");
                                let _ = shutdown_tx.send(true);
                                break;
                            }
                        }
                    }
                }
            }
            Ok::<(), anyhow::Error>(())
        });
    }

    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.run(shutdown).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("burrow: shutdown signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                let _ = shutdown_tx.send(true);
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(15), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Token CRUD against the local file storage; prints results for humans.
pub async fn run_token_command(
    config_path: Option<PathBuf>,
    workdir: Option<PathBuf>,
    command: TokenCommand,
) -> anyhow::Result<()> {
    let workdir = resolve_workdir(workdir)?;
    let storage = storage_dir(&workdir);
    let resolved = config::resolve_config_path(config_path, &workdir)?;
    config::ensure_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)?;

    let manager = build_file_manager(&cfg, &storage)?;

    match command {
        TokenCommand::Create {
            name,
            max_clients,
            max_traffic,
        } => {
            let (cert_pem, _key) = manager.load_or_create_certificate()?;
            let mut item = manager.create_token(&name, max_clients, max_traffic)?;
            item.token.certificate_hash = certificate_sha256(&cert_pem)?;
            manager.write_token(&item)?;
            println!("token {} created", item.token.token_id);
            println!("{}", item.token.to_access_key());
        }
        TokenCommand::List => {
            for item in manager.list_tokens() {
                let usage = manager.read_usage(item.token.token_id);
                println!(
                    "{}  name={:?} clients={} traffic={}/{}",
                    item.token.token_id,
                    item.token.name,
                    item.max_client_count,
                    usage.total(),
                    item.max_traffic,
                );
            }
        }
        TokenCommand::Show { token_id } => {
            let id: uuid::Uuid = token_id.parse().context("token id is not a uuid")?;
            let item = manager
                .get_token(id)
                .with_context(|| format!("token {id} not found"))?;
            println!("{}", item.token.to_access_key());
        }
        TokenCommand::Delete { token_id } => {
            let id: uuid::Uuid = token_id.parse().context("token id is not a uuid")?;
            manager.delete_token(id)?;
            println!("token {id} deleted");
        }
    }
    Ok(())
}
