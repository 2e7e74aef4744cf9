//! burrow: the client binary of the burrow reverse-tunneling proxy.
//!
//! Reads the `[client]` config, connects to the server, and keeps the
//! configured tunnels alive until interrupted.

use anyhow::Context as _;
use burrow_client::config::{self, LogSection};
use burrow_client::Client;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

/// burrow — expose local services through a burrow tunnel server
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about = "burrow tunnel client")]
struct Cli {
    /// Config file path (default: $HOME/.burrow.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Config file format (toml, json)
    #[arg(short = 't', long = "type", default_value = "toml")]
    config_type: String,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // The failure may predate logging init; plain stderr always works.
        eprintln!("burrow: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(config::default_config_path);
    let cfg = config::load(&path, &cli.config_type)
        .with_context(|| format!("failed to load config {}", path.display()))?;

    init_logging(&cfg.log);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        server = %cfg.client.server_addr,
        "starting burrow"
    );

    let client = Client::new(cfg.client);

    let runner = client.clone();
    tokio::select! {
        result = runner.run() => {
            result.context("client gave up")?;
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            client.exit().await;
        }
    }

    info!("burrow stopped");
    Ok(())
}

/// Initialize tracing from the `[log]` config section. RUST_LOG still wins
/// when set.
fn init_logging(log: &LogSection) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let to_stderr = log.outputs.first().map(|o| o == "stderr").unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match (log.format.as_str(), to_stderr) {
        ("json", true) => builder.json().with_writer(std::io::stderr).init(),
        ("json", false) => builder.json().init(),
        (_, true) => builder.with_writer(std::io::stderr).init(),
        _ => builder.init(),
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
