//! Alert fanout: the async tail that must not block the pipeline.
//!
//! Stage progress never waits on Discord or email. Alerts go onto a bounded
//! flume channel consumed by a single worker task that talks to the
//! [`Notifier`] collaborator; [`AlertHub::flush`] and [`AlertHub::shutdown`]
//! guarantee everything enqueued is delivered before the process exits;
//! nothing is fire-and-forgotten silently.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::collaborators::{AlertMessage, Notifier};

// ── Alert types ────────────────────────────────────────────────────────

/// Routing key for an alert; which channel each kind lands on is the
/// notifier's routing-table decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    PipelineFailure,
    BufferDeployed,
    BufferStockLow,
    BudgetWarning,
    BudgetCritical,
    IncidentDigest,
    QuotaExceeded,
}

impl AlertKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PipelineFailure => "pipeline-failure",
            Self::BufferDeployed => "buffer-deployed",
            Self::BufferStockLow => "buffer-stock-low",
            Self::BudgetWarning => "budget-warning",
            Self::BudgetCritical => "budget-critical",
            Self::IncidentDigest => "incident-digest",
            Self::QuotaExceeded => "quota-exceeded",
        }
    }
}

/// One queued alert.
#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: AlertMessage,
    /// Critical alerts use the notifier's escalation path.
    pub critical: bool,
}

impl Alert {
    #[must_use]
    pub fn routine(kind: AlertKind, message: AlertMessage) -> Self {
        Self {
            kind,
            message,
            critical: false,
        }
    }

    #[must_use]
    pub fn critical(kind: AlertKind, message: AlertMessage) -> Self {
        Self {
            kind,
            message,
            critical: true,
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Diagnostic)]
pub enum AlertError {
    #[error("alert channel full; alert dropped: {kind}")]
    #[diagnostic(
        code(nexus::alerts::channel_full),
        help("The notifier is not draining; raise the channel capacity or fix delivery.")
    )]
    ChannelFull { kind: &'static str },

    #[error("alert hub already shut down")]
    #[diagnostic(code(nexus::alerts::closed))]
    Closed,
}

// ── Hub ────────────────────────────────────────────────────────────────

enum Envelope {
    Alert(Alert),
    Flush(oneshot::Sender<()>),
}

/// Bounded alert queue with a single delivery worker.
pub struct AlertHub {
    tx: flume::Sender<Envelope>,
    worker: JoinHandle<()>,
}

impl AlertHub {
    /// Spawn the delivery worker over `notifier`.
    #[must_use]
    pub fn start(notifier: Arc<dyn Notifier>, capacity: usize) -> Self {
        let (tx, rx) = flume::bounded::<Envelope>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Ok(envelope) = rx.recv_async().await {
                match envelope {
                    Envelope::Alert(alert) => {
                        let result = if alert.critical {
                            notifier.send_critical_alert(alert.message.clone()).await
                        } else {
                            notifier
                                .route_alert(alert.kind.as_str(), alert.message.clone())
                                .await
                        };
                        match result {
                            Ok(()) => debug!(kind = alert.kind.as_str(), "alert delivered"),
                            Err(err) => warn!(
                                kind = alert.kind.as_str(),
                                error = %err,
                                "alert delivery failed"
                            ),
                        }
                    }
                    Envelope::Flush(ack) => {
                        // Channel is FIFO: reaching this envelope means
                        // everything enqueued before it was delivered.
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self { tx, worker }
    }

    /// Enqueue without blocking pipeline progress.
    pub fn emit(&self, alert: Alert) -> Result<(), AlertError> {
        let kind = alert.kind.as_str();
        self.tx
            .try_send(Envelope::Alert(alert))
            .map_err(|err| match err {
                flume::TrySendError::Full(_) => AlertError::ChannelFull { kind },
                flume::TrySendError::Disconnected(_) => AlertError::Closed,
            })
    }

    /// Wait until everything enqueued so far has been handed to the
    /// notifier.
    pub async fn flush(&self) -> Result<(), AlertError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send_async(Envelope::Flush(ack_tx))
            .await
            .map_err(|_| AlertError::Closed)?;
        ack_rx.await.map_err(|_| AlertError::Closed)
    }

    /// Drain and stop the worker. Call on process exit.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(err) = self.worker.await {
            warn!(error = %err, "alert worker ended abnormally");
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
