use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Create a `CancellationToken` and spawn a task that cancels it on
/// SIGINT or SIGTERM.  Returns the token so callers can pass clones
/// to every spawned task.
pub fn create_shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        token_clone.cancel();
    });

    token
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
///
/// A handler that cannot be installed is logged and never fires; the
/// other one still does.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
