use tokio::sync::broadcast;
use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Finish the current iteration, then stop
    Graceful,
}

/// Create the broadcast channel every long-lived loop subscribes to
pub fn shutdown_channel() -> broadcast::Sender<ShutdownSignal> {
    let (shutdown_tx, _) = broadcast::channel(16);
    shutdown_tx
}

/// Setup signal handlers for the process
///
/// Returns a join handle for the signal task. SIGTERM and SIGINT both
/// broadcast a graceful shutdown on `shutdown_tx`.
#[cfg(unix)]
pub fn setup_signal_handlers(
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to setup signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown");
            }
        }
        let _ = shutdown_tx.send(ShutdownSignal::Graceful);
    })
}

/// Windows placeholder - only Ctrl+C is supported
#[cfg(not(unix))]
pub fn setup_signal_handlers(
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, initiating shutdown");
                let _ = shutdown_tx.send(ShutdownSignal::Graceful);
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
    })
}

/// Non-blocking check used between iterations of a loop.
///
/// A closed or lagged channel counts as a shutdown request.
pub fn shutdown_requested(rx: &mut broadcast::Receiver<ShutdownSignal>) -> bool {
    match rx.try_recv() {
        Ok(_) => true,
        Err(broadcast::error::TryRecvError::Empty) => false,
        Err(broadcast::error::TryRecvError::Closed) => true,
        Err(broadcast::error::TryRecvError::Lagged(_)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setup_signal_handlers() {
        let shutdown_tx = shutdown_channel();
        let _handle = setup_signal_handlers(shutdown_tx.clone());

        let mut rx = shutdown_tx.subscribe();
        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, ShutdownSignal::Graceful);
    }

    #[test]
    fn test_shutdown_requested() {
        let shutdown_tx = shutdown_channel();
        let mut rx = shutdown_tx.subscribe();
        assert!(!shutdown_requested(&mut rx));

        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        assert!(shutdown_requested(&mut rx));
    }

    #[test]
    fn test_closed_channel_counts_as_shutdown() {
        let shutdown_tx = shutdown_channel();
        let mut rx = shutdown_tx.subscribe();
        drop(shutdown_tx);
        assert!(shutdown_requested(&mut rx));
    }
}
