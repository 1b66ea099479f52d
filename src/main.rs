//! cell-sandbox daemon
//!
//! Minimal MCP server that runs each submitted cell in a fresh `docker run --rm`
//! container. Configuration comes from `CELL_SANDBOX_CONFIG` and friends; see
//! `config.rs`.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cell_sandbox::{backend::DockerBackend, config::Config, executor::Executor, mcp};

#[derive(Parser, Debug)]
#[command(name = "cell-sandbox")]
#[command(about = "MCP server that runs code cells in throwaway Docker containers")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Execution image (overrides configuration)
    #[arg(long)]
    image: Option<String>,

    /// Default timeout in seconds (overrides configuration)
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(image) = args.image {
        config.image = image;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_seconds = timeout;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        image = %config.image,
        runtime = %config.runtime,
        timeout_seconds = config.timeout_seconds,
        "Loaded configuration"
    );

    let backend = DockerBackend::new(config.runtime.clone());
    let executor = Executor::new(config, backend);

    if args.stdio {
        mcp::serve_stdio(executor).await?;
    } else {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    Ok(())
}
