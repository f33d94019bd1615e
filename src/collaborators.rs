//! Interface contracts for the orchestrator's external collaborators.
//!
//! The core never talks to cloud SDKs directly. Everything it needs from the
//! outside world (object storage, secrets, notification fanout, wall-clock
//! time) comes in through the traits here, so tests can swap in scripted
//! implementations and the production wiring stays in the embedding layer.
//!
//! The document database has its own, richer contract in [`crate::store`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use std::sync::Mutex;
use thiserror::Error;

// ── Clock ──────────────────────────────────────────────────────────────

/// Injectable time source.
///
/// All time-dependent logic (TTL caches, incident durations, buffer
/// retention, cost timestamps) reads through this trait.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advance the clock by `duration`.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += duration;
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().expect("clock lock") = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

// ── ObjectStore ────────────────────────────────────────────────────────

/// Errors surfaced by [`ObjectStore`] implementations.
#[derive(Debug, Error, Diagnostic)]
pub enum ObjectStoreError {
    #[error("object not found: {url}")]
    #[diagnostic(code(nexus::object_store::not_found))]
    NotFound { url: String },

    #[error("object store backend error: {message}")]
    #[diagnostic(
        code(nexus::object_store::backend),
        help("Check bucket connectivity and credentials.")
    )]
    Backend { message: String },
}

/// Content-addressed blob storage for rendered artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Upload bytes to `path`, returning the stored object's URL.
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, ObjectStoreError>;

    /// Upload a chunk stream to `path` (large renders don't fit in memory).
    async fn upload_stream(
        &self,
        path: &str,
        chunks: futures_util::stream::BoxStream<'static, Vec<u8>>,
        content_type: &str,
    ) -> Result<String, ObjectStoreError>;

    async fn exists(&self, path: &str) -> Result<bool, ObjectStoreError>;

    /// Public URL for a stored path, without touching the backend.
    fn public_url(&self, path: &str) -> String;
}

// ── SecretStore ────────────────────────────────────────────────────────

/// Errors surfaced by [`SecretStore`] implementations.
#[derive(Debug, Error, Diagnostic)]
pub enum SecretStoreError {
    #[error("secret not found: {name}")]
    #[diagnostic(code(nexus::secret_store::not_found))]
    NotFound { name: String },

    #[error("secret store backend error: {message}")]
    #[diagnostic(code(nexus::secret_store::backend))]
    Backend { message: String },
}

/// Named secret lookup (API keys, signing tokens).
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<String, SecretStoreError>;
}

// ── Notifier ───────────────────────────────────────────────────────────

/// Errors surfaced by [`Notifier`] implementations.
#[derive(Debug, Error, Diagnostic)]
pub enum NotifyError {
    #[error("notification delivery failed: {message}")]
    #[diagnostic(code(nexus::notifier::delivery))]
    Delivery { message: String },
}

/// A rendered alert ready for channel routing.
///
/// Which channel a given `kind` lands on (Discord, email, pager) is a
/// routing-table decision owned by the implementation, opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub title: String,
    pub description: String,
    /// Ordered key/value pairs rendered as fields in the target channel.
    pub fields: Vec<(String, String)>,
}

impl AlertMessage {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }
}

/// Outbound alert fanout.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Route an alert of the given kind to its configured channels.
    async fn route_alert(&self, kind: &str, message: AlertMessage) -> Result<(), NotifyError>;

    /// Deliver a critical alert on every escalation channel.
    async fn send_critical_alert(&self, message: AlertMessage) -> Result<(), NotifyError>;
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 1, 22, 6, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), start + chrono::Duration::minutes(5));

        let later = Utc.with_ymd_and_hms(2026, 1, 23, 0, 0, 0).unwrap();
        clock.set(later);
        assert_eq!(clock.now(), later);
    }

    #[test]
    fn alert_message_builder() {
        let msg = AlertMessage::new("Pipeline failed", "stage tts aborted")
            .with_field("pipeline", "2026-01-22")
            .with_field("stage", "tts");
        assert_eq!(msg.fields.len(), 2);
        assert_eq!(msg.fields[0].0, "pipeline");
    }
}
