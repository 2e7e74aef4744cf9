//! burrow-server: public endpoint of the burrow reverse-tunneling proxy.

use burrow_server::config::{self, LogSection};
use burrow_server::Server;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// burrow-server — reverse-tunneling proxy server
#[derive(Parser, Debug)]
#[command(name = "burrow-server", version, about = "burrow tunnel server")]
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
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(config::default_config_path);
    let cfg = match config::load(&path, &cli.config_type) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config {}: {e}", path.display());
            std::process::exit(1);
        }
    };

    init_logging(&cfg.log);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        "starting burrow-server"
    );

    let server = Arc::new(Server::new(cfg.server));

    let mut runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = &mut runner => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "server error");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "server task failed");
                    std::process::exit(1);
                }
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            server.exit().await;
            let _ = (&mut runner).await;
        }
    }

    info!("burrow-server stopped");
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
