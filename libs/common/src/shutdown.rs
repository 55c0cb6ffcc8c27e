//! Shutdown signal for binaries driving a bus

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Token cancelled on Ctrl+C, or SIGTERM on unix
///
/// The watcher task exits as soon as the token is cancelled by either side.
/// Must be called from within a Tokio runtime.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let watched = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            signal = next_signal() => {
                info!("{} received, shutting down", signal);
                watched.cancel();
            },
            _ = watched.cancelled() => {},
        }
    });
    token
}

#[cfg(unix)]
async fn next_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("SIGTERM handler unavailable ({}), only Ctrl+C stops the process", e);
            return ctrl_c().await;
        },
    };
    tokio::select! {
        signal = ctrl_c() => signal,
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn next_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl+C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
    "Ctrl+C"
}
