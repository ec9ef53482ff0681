//! One-shot completion signals.

use std::sync::Arc;

use futures::future::{select_all, FutureExt};
use tokio::sync::watch;

/// A one-shot completion flag shared between tasks.
///
/// Enabling is idempotent, and waiting on an already enabled signal returns
/// immediately. Clones observe the same flag.
#[derive(Debug, Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Enables the signal, waking every waiter.
    ///
    /// Returns `true` only for the call that actually flipped the flag.
    pub fn enable(&self) -> bool {
        self.tx.send_if_modified(|enabled| {
            if *enabled {
                false
            } else {
                *enabled = true;
                true
            }
        })
    }

    pub fn is_enabled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the signal is enabled.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this can only return once enabled
        let _ = rx.wait_for(|enabled| *enabled).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits until any of `signals` is enabled and returns its index.
///
/// Returns `None` immediately for an empty set.
pub async fn wait_any(signals: &[Signal]) -> Option<usize> {
    if signals.is_empty() {
        return None;
    }
    let waits = signals.iter().map(|s| s.wait().boxed());
    let (_, index, _) = select_all(waits).await;
    Some(index)
}
