//! Oldscape Game Server
//!
//! A Rust implementation of a revision-225 (May 2004) game server.

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use oldscape_server::config::ServerConfig;
use oldscape_server::net::server::GameServer;
use oldscape_server::{REVISION, VERSION};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging();

    info!("Oldscape game server v{VERSION} (revision {REVISION})");

    let config = ServerConfig::load()?;
    info!(
        server_name = %config.server_name,
        port = config.port,
        data_path = %config.data_path.display(),
        "configuration loaded"
    );

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(wait_for_shutdown(shutdown_tx));

    let mut server = GameServer::init(config).await?;
    server.run(&mut shutdown_rx).await;

    info!("server shutdown complete");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,oldscape_server=debug"));

    fmt().with_env_filter(filter).with_target(true).init();
}

/// Wait for Ctrl+C or SIGTERM, then signal the main loop
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
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
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        }
    }

    let _ = shutdown_tx.send(());
}
