// ABOUTME: Cooperative cancellation for parallel host deployments.
// ABOUTME: A sibling failure trips the handle; deployers observe it at phase boundaries.

use tokio::sync::watch;

/// Trips cancellation for every associated token.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observes cooperative cancellation.
///
/// Cancellation changes observable timing, not correctness: a host that has
/// already performed a side effect before observing the signal keeps it, so
/// exactly-once side effects on cancelled hosts are not guaranteed.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    // keeps a never-cancelling token's sender alive
    _keepalive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        let tx = std::sync::Arc::new(tx);
        (
            CancelHandle { tx: tx.clone() },
            CancelToken {
                rx,
                _keepalive: Some(tx),
            },
        )
    }

    /// A token that never cancels, for single-host invocations.
    pub fn never() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        CancelToken {
            rx,
            _keepalive: Some(std::sync::Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // sender gone without cancelling - never resolves
                std::future::pending::<()>().await;
            }
        }
    }
}
