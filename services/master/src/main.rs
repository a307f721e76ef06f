// aft-master: deployment master for a fixed set of fault-tolerant workers.

use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(master::config::DEFAULT_CONFIG_PATH));

    let cfg = match master::load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        node_count = cfg.node_count,
        "master starting"
    );

    let Some(launch) = cfg.child.clone() else {
        eprintln!("FATAL: config has no [child] section; nothing to spawn");
        std::process::exit(1);
    };

    let (exit_tx, exit_rx) = tokio::sync::mpsc::unbounded_channel();
    let host = master::ChildProcessHost::new(launch, exit_tx);

    let handle = match master::start(cfg, host, exit_rx).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("FATAL: failed to start: {e}");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    info!("shutdown signal received");
    match handle.shutdown().await {
        Ok(()) => info!("master shut down gracefully"),
        Err(e) => {
            error!(error = %e, "master aborted");
            std::process::exit(1);
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
