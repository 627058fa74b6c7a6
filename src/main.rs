use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "burrow",
    version,
    about = "Burrow - circumvention VPN server and client core"
)]
struct Cli {
    /// Path to the Burrow config file (.toml). If omitted, uses BURROW_CONFIG;
    /// then auto-detects burrow.toml from CWD; then falls back to <workdir>/burrow.toml.
    #[arg(long, env = "BURROW_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Working directory (runtime state). Storage lives in "<workdir>/storage".
    #[arg(long, env = "BURROW_WORKDIR")]
    workdir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server (default when no subcommand is given).
    Start,
    /// Ask a running server in the same working directory to stop.
    Stop,
    /// Manage access tokens in the local file storage.
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
}

#[derive(Debug, Subcommand)]
enum TokenCommand {
    /// Create a new token and print its access key.
    Create {
        /// Human-readable token name.
        #[arg(long, default_value = "")]
        name: String,
        /// Maximum concurrent clients (0 disables suppression).
        #[arg(long, default_value_t = 0)]
        max_clients: u32,
        /// Traffic quota in bytes (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        max_traffic: u64,
    },
    /// List stored tokens.
    List,
    /// Print the access key of a stored token.
    Show { token_id: String },
    /// Delete a stored token and its usage records.
    Delete { token_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        None | Some(Command::Start) => burrow::run(cli.config, cli.workdir).await,
        Some(Command::Stop) => burrow::app::send_stop_command(cli.workdir),
        Some(Command::Token { command }) => {
            let cmd = match command {
                TokenCommand::Create {
                    name,
                    max_clients,
                    max_traffic,
                } => burrow::app::TokenCommand::Create {
                    name,
                    max_clients,
                    max_traffic,
                },
                TokenCommand::List => burrow::app::TokenCommand::List,
                TokenCommand::Show { token_id } => burrow::app::TokenCommand::Show { token_id },
                TokenCommand::Delete { token_id } => burrow::app::TokenCommand::Delete { token_id },
            };
            burrow::app::run_token_command(cli.config, cli.workdir, cmd).await
        }
    }
}
