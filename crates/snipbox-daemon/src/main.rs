//! snipbox-daemon - serves sandboxed snippet execution over a Unix socket
//!
//! - One short-lived, resource-limited interpreter per execution
//! - Per-user sandboxes reclaimed after the session timeout
//! - All sandboxes removed on SIGTERM/SIGINT

use anyhow::Result;
use clap::Parser;
use futures::stream::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use snipbox_core::Snipbox;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing_subscriber::EnvFilter;

mod config;
mod server;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "snipbox-daemon")]
#[command(author, version, about = "Sandboxed Python snippet execution daemon")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "SNIPBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Socket path, overriding the configuration
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("snipbox=info".parse()?))
        .init();

    let args = Args::parse();
    tracing::info!("snipbox-daemon starting");

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    tracing::info!(
        socket = ?config.socket_path,
        reap_interval_secs = config.reap_interval_secs,
        "configuration loaded"
    );

    let snipbox = Arc::new(Snipbox::new(&config.sandbox_config)?);

    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Remove a socket left behind by a previous run
    let _ = std::fs::remove_file(&config.socket_path);

    let listener = UnixListener::bind(&config.socket_path)?;
    std::fs::set_permissions(
        &config.socket_path,
        std::fs::Permissions::from_mode(config.socket_mode),
    )?;
    tracing::info!(socket = ?config.socket_path, "listening");

    let reaper = tokio::spawn(server::reap_loop(Arc::clone(&snipbox), config.reap_interval()));

    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    let handle = signals.handle();

    let outcome = tokio::select! {
        result = server::run(listener, Arc::clone(&snipbox)) => {
            result.map_err(|e| anyhow::anyhow!("{e}"))
        }
        Some(signal) = signals.next() => {
            tracing::info!(signal, "shutdown requested");
            Ok(())
        }
    };

    handle.close();
    reaper.abort();

    let sweep = Arc::clone(&snipbox);
    let destroyed = tokio::task::spawn_blocking(move || sweep.shutdown()).await?;
    let _ = std::fs::remove_file(&config.socket_path);
    tracing::info!(destroyed, "snipbox-daemon stopped");

    outcome
}
