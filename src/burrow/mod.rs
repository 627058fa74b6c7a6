pub mod access;
pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod nat;
pub mod packet;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod token;
pub mod tunnel;
pub mod util;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    workdir: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    app::run(config_path, workdir).await
}
