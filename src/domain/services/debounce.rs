#[cfg(test)]
#[path = "debounce_test.rs"]
mod tests;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Trailing-edge debounce. Every `trigger` restarts the window, and a tick
/// is delivered on the receiver once the window passes quietly.
#[derive(Clone)]
pub struct Debouncer {
    delay: Duration,
    pending: Arc<Mutex<Option<CancellationToken>>>,
    tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> (Debouncer, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let debouncer = Debouncer {
            delay,
            pending: Arc::new(Mutex::new(None)),
            tx,
        };

        return (debouncer, rx);
    }

    pub fn trigger(&self) {
        let token = CancellationToken::new();
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let delay = self.delay;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(());
                }
            }
        });
    }

    /// Drops a pending tick without delivering it.
    pub fn cancel(&self) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = pending {
            token.cancel();
        }
    }
}
