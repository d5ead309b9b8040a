use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use stubber::{config::Config, logging, proxy};

const DEFAULT_CONFIG_PATH: &str = "stubber.toml";

#[derive(Debug, Parser)]
#[command(name = "stubber")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the stub server.
    Serve {
        /// Path to config TOML. Defaults to `stubber.toml` in the working
        /// directory.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config_path = config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
            let config = Config::from_path(&config_path)?;
            logging::init(&config, log_level.as_deref())?;

            let handle = proxy::serve(&config).await?;
            tracing::info!(addr = %handle.listen_addr, "stubber listening");

            tokio::signal::ctrl_c()
                .await
                .context("wait for shutdown signal")?;
            tracing::info!("shutting down");
            handle.shutdown().await;
            Ok(())
        }
    }
}
