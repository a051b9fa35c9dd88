pub mod commands;
pub mod crm;
pub mod db;
pub mod error;
pub mod helpers;
mod migrations;
pub mod server;
pub mod state;
pub mod sync;
pub mod types;

use std::sync::Arc;

use state::AppState;

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl+C, shutting down"),
        _ = terminate => log::info!("Received SIGTERM, shutting down"),
    }
}

/// Load configuration, open the member database and serve the HTTP API
/// until a shutdown signal arrives. An in-flight sync run is cancelled on
/// shutdown so it can record itself before the process exits.
pub async fn serve() -> std::io::Result<()> {
    let state = Arc::new(AppState::new());
    let bind_addr = state.config().server.bind_addr;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    log::info!("memberdir listening on {}", listener.local_addr()?);

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            if let Some(run_id) = shutdown_state.cancel_active_run() {
                log::info!("Cancelled sync run {run_id} for shutdown");
            }
        })
        .await?;

    log::info!("Server shutdown complete");
    Ok(())
}
