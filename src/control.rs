//! Run-level cooperative cancellation.
//!
//! A [`CancelHandle`]/[`CancelToken`] pair is created per pipeline run. The
//! token is cloned into every stage input; all I/O inside a stage races
//! against it, so one signal stops the whole run. Cancelled stages persist
//! a `cancelled` slot and never emit a completion event.

use tokio::sync::watch;

use crate::errors::{NexusError, Severity};

/// Code carried by the error surfaced from a cancelled run.
pub const CODE_CANCELLED: &str = "NEXUS_PIPELINE_CANCELLED";

/// Create a linked cancellation pair.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Owner side: signals cancellation to every clone of the token.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side, cheap to clone into stage inputs.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that can never fire (for tests and detached work).
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(tx);
        Self { rx }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation fires (or the handle is dropped).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling: park forever, the
                // surrounding select! owns the other branch.
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }

    /// The error a cancelled run surfaces.
    #[must_use]
    pub fn cancellation_error(stage: &str) -> NexusError {
        NexusError::new(CODE_CANCELLED, Severity::Critical, "pipeline run cancelled")
            .with_stage(stage)
    }
}
