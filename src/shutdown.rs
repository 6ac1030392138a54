//! Shutdown signalling shared by the pipeline and the metrics exporter.

use std::future::Future;
use std::io;
use tokio::sync::watch;
use tracing::{error, info, warn};

const TARGET_SHUTDOWN: &str = "shutdown";

/// Exit status after a forced quit, as for SIGINT
const FORCED_EXIT_CODE: i32 = 130;

/// Resolve once shutdown has been requested.
///
/// A dropped sender counts as a request, so tasks never outlive their owner.
pub async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
}

/// Flip `tx` to `true` on the first Ctrl+C; exit the process on the second.
pub fn spawn_ctrl_c_handler(tx: watch::Sender<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if relay_interrupts(&tx, tokio::signal::ctrl_c).await {
            warn!(
                target: TARGET_SHUTDOWN,
                "Received second Ctrl+C, exiting without waiting for in-flight events"
            );
            std::process::exit(FORCED_EXIT_CODE);
        }
        // Dropping `tx` would read as a shutdown request
        std::future::pending::<()>().await;
    })
}

/// Send `true` on the first interrupt, then wait for another.
///
/// Returns `true` once a second interrupt arrives and `false` if listening
/// fails.
async fn relay_interrupts<F, Fut>(tx: &watch::Sender<bool>, mut interrupt: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if let Err(err) = interrupt().await {
        error!(target: TARGET_SHUTDOWN, error = %err, "Failed to listen for Ctrl+C");
        return false;
    }
    info!(target: TARGET_SHUTDOWN, "Received Ctrl+C signal, press Ctrl+C again to force quit");
    let _ = tx.send(true);

    match interrupt().await {
        Ok(()) => true,
        Err(err) => {
            error!(target: TARGET_SHUTDOWN, error = %err, "Failed to listen for Ctrl+C");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_resolves_on_signal() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_for_shutdown(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolves_when_already_set_or_dropped() {
        let (tx, rx) = watch::channel(true);
        wait_for_shutdown(rx).await;
        drop(tx);

        let (tx, rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_without_signal() {
        let (_tx, rx) = watch::channel(false);
        let waited = tokio::time::timeout(Duration::from_millis(50), wait_for_shutdown(rx)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_second_interrupt_forces_quit() {
        let signals = Arc::new(Notify::new());
        let (tx, rx) = watch::channel(false);

        let source = Arc::clone(&signals);
        let relay = tokio::spawn(async move {
            relay_interrupts(&tx, move || {
                let source = Arc::clone(&source);
                async move {
                    source.notified().await;
                    Ok::<(), io::Error>(())
                }
            })
            .await
        });

        signals.notify_one();
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(rx))
            .await
            .unwrap();
        assert!(!relay.is_finished());

        signals.notify_one();
        let forced = tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
        assert!(forced);
    }

    #[tokio::test]
    async fn test_failed_listener_requests_nothing() {
        let (tx, rx) = watch::channel(false);
        let forced = relay_interrupts(&tx, || async {
            Err::<(), io::Error>(io::Error::other("no signal handler"))
        })
        .await;
        assert!(!forced);
        assert!(!*rx.borrow());
    }
}
