//! Undertow CLI - Command-line interface
//!
//! Fetches torrent metadata and single pieces directly from known peers.

mod commands;

use clap::Parser;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "Fetch torrent metadata and pieces straight from peers")]
struct Cli {
    /// Console log level; the full trace always goes to logs/
    #[arg(long, global = true, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_level.as_tracing_level(), None) {
        anyhow::bail!("failed to initialize logging: {e}");
    }

    if let Err(e) = commands::handle_command(cli.command).await {
        if e.is_user_error() {
            anyhow::bail!(e.user_message());
        }
        return Err(e.into());
    }

    Ok(())
}
