//! Process signal handling for graceful shutdown.

use tokio::signal;
use tracing::{error, info};

/// Resolve when the process is asked to stop: Ctrl+C, or SIGTERM on unix.
///
/// Handed to `axum::serve(...).with_graceful_shutdown(...)`; once this future
/// completes the server stops accepting connections and drains in-flight
/// requests, after which [`crate::state::AppState::shutdown`] stops the
/// background sweeps.
///
/// A handler that cannot be installed is logged and its arm parked, leaving
/// the other signal as the shutdown path. The server keeps serving either
/// way.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Ctrl+C received, draining connections"),
        _ = terminate => info!("SIGTERM received, draining connections"),
    }
}
