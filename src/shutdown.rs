use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal forces an immediate exit.
const FORCED_EXIT: i32 = 130;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// The first signal cancels the returned token: running jobs get their grace
/// period and the run still produces a report. A second signal exits at once.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, cancelling build matrix");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, cancelling build matrix");
            }
        }
        token_clone.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second signal received, exiting without waiting for jobs");
        std::process::exit(FORCED_EXIT);
    });

    token
}
