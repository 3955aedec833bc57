use std::future::Future;
use tracing::warn;

/// Resolves on SIGINT or SIGTERM (Ctrl-C only off unix).
///
/// The SIGTERM handler is installed when this is called, not when the future
/// is first polled, so a signal arriving in between is not lost. Must be
/// called inside a tokio runtime.
pub fn termination_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let term = {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(term) => Some(term),
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
                None
            }
        }
    };

    async move {
        #[cfg(unix)]
        {
            if let Some(mut term) = term {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}
