//! Lily gateway — the main entry point.
//!
//! Loads configuration (defaults, then environment, then the JSON
//! config file), initializes tracing, and serves until SIGINT/SIGTERM.
//! Exit code 0 on clean shutdown; startup failures surface as errors.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "lily",
    about = "Lily — conversational AI gateway",
    version,
    author
)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "lily-config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = Arc::new(lily_config::ConfigStore::bootstrap(cli.config));
    lily_gateway::start(config).await?;

    Ok(())
}
