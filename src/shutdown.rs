use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. The API server, the orchestrator loops and workers all watch
/// this token and stop gracefully.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}
