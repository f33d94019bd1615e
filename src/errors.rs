//! Severity-tagged error model for the orchestrator.
//!
//! Every failure that crosses a stage boundary is a [`NexusError`]: a coded,
//! severity-tagged, serializable record with an optional cause ladder. The
//! [`Severity`] discriminator is the single knob the stage executor and
//! pipeline runner read when deciding how to recover:
//!
//! | Severity | Recovery policy |
//! |---|---|
//! | `Retryable` | Retry with backoff inside the current provider |
//! | `Fallback` | Abandon the provider, try the next in the cascade |
//! | `Degraded` | Accept the result, mark the stage degraded |
//! | `Recoverable` | Fail the stage, keep the pipeline alive |
//! | `Critical` | Abort the pipeline, deploy a buffer video |
//!
//! Errors that arrive untyped (panic payloads, collaborator errors that were
//! never classified) are wrapped as `Critical` with code
//! `NEXUS_UNKNOWN_ERROR`, preserving the original message as the cause.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

// ── Severity ───────────────────────────────────────────────────────────

/// Recovery severity attached to every [`NexusError`].
///
/// Ordered from mildest to most severe so comparisons like
/// `severity >= Severity::Recoverable` read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Transient upstream failure; retry with backoff.
    Retryable,
    /// Provider-specific failure; cascade to the next provider.
    Fallback,
    /// Result is usable but quality-impaired; record and continue.
    Degraded,
    /// Stage failed; skip it and keep the pipeline alive.
    Recoverable,
    /// Abort the pipeline and trigger the buffer fallback.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable => write!(f, "RETRYABLE"),
            Self::Fallback => write!(f, "FALLBACK"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Recoverable => write!(f, "RECOVERABLE"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

// ── Error codes ────────────────────────────────────────────────────────

/// Code carried by wrapped, previously-unclassified errors.
pub const CODE_UNKNOWN: &str = "NEXUS_UNKNOWN_ERROR";
/// Code raised when the retry engine exhausts its attempts.
pub const CODE_RETRY_EXHAUSTED: &str = "NEXUS_RETRY_EXHAUSTED";
/// Code raised when the fallback cascade runs out of providers.
pub const CODE_FALLBACK_EXHAUSTED: &str = "NEXUS_FALLBACK_EXHAUSTED";
/// Code raised when no deployable buffer video exists.
pub const CODE_BUFFER_EXHAUSTED: &str = "NEXUS_BUFFER_EXHAUSTED";
/// Code raised when deploying a buffer that was already consumed.
pub const CODE_BUFFER_ALREADY_USED: &str = "NEXUS_BUFFER_ALREADY_USED";

static CODE_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^NEXUS_[A-Z]+_[A-Z_]+$").expect("static pattern"));

/// Whether `code` matches the canonical `NEXUS_<DOMAIN>_<TYPE>` shape.
#[must_use]
pub fn is_valid_code(code: &str) -> bool {
    CODE_PATTERN.is_match(code)
}

// ── Cause ladder ───────────────────────────────────────────────────────

/// A serializable chain of underlying causes.
///
/// Mirrors the shape persisted in incident records: each rung has a message,
/// optional structured details, and an optional deeper cause.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorCause {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorCause>>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ErrorCause {
    pub fn msg<M: Into<String>>(m: M) -> Self {
        Self {
            message: m.into(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Build a cause ladder by walking a `std::error::Error` source chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut root = Self::msg(err.to_string());
        let mut slot = &mut root;
        let mut source = err.source();
        while let Some(src) = source {
            slot.cause = Some(Box::new(Self::msg(src.to_string())));
            slot = slot.cause.as_mut().expect("just set");
            source = src.source();
        }
        root
    }
}

impl std::fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ErrorCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c as &dyn std::error::Error)
    }
}

// ── NexusError ─────────────────────────────────────────────────────────

/// The coded, severity-tagged error that flows between stages.
///
/// Constructed with [`NexusError::new`] and enriched with the `with_*`
/// builders:
///
/// ```
/// use nexus_orchestrator::errors::{NexusError, Severity};
/// use serde_json::json;
///
/// let err = NexusError::new("NEXUS_TTS_TIMEOUT", Severity::Retryable, "synthesis timed out")
///     .with_stage("tts")
///     .with_context(json!({"voice": "chirp3-hd"}));
///
/// assert!(err.is_retryable());
/// assert_eq!(err.stage.as_deref(), Some("tts"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NexusError {
    /// `NEXUS_<DOMAIN>_<TYPE>` code.
    pub code: String,
    pub message: String,
    pub severity: Severity,
    /// Stage the error surfaced in; filled in at the stage boundary when
    /// absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorCause>>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl NexusError {
    /// Create an error with the given code, severity, and message.
    ///
    /// Debug-asserts that `code` matches `NEXUS_<DOMAIN>_<TYPE>`.
    pub fn new<C: Into<String>, M: Into<String>>(code: C, severity: Severity, message: M) -> Self {
        let code = code.into();
        debug_assert!(is_valid_code(&code), "malformed error code: {code}");
        Self {
            code,
            message: message.into(),
            severity,
            stage: None,
            context: serde_json::Value::Null,
            cause: None,
            timestamp: Utc::now(),
        }
    }

    /// Shorthand for a `Retryable` error.
    pub fn transient<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::new(code, Severity::Retryable, message)
    }

    /// Shorthand for a `Fallback` error.
    pub fn fallback<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::new(code, Severity::Fallback, message)
    }

    /// Shorthand for a `Recoverable` error.
    pub fn recoverable<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::new(code, Severity::Recoverable, message)
    }

    /// Shorthand for a `Critical` error.
    pub fn critical<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::new(code, Severity::Critical, message)
    }

    #[must_use]
    pub fn with_stage<S: Into<String>>(mut self, stage: S) -> Self {
        self.stage = Some(stage.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Derived: retry is only ever driven by `Retryable` severity.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.severity == Severity::Retryable
    }

    /// Fill in `stage` if the error crossed a stage boundary without one.
    ///
    /// Already-stamped errors are returned unchanged.
    #[must_use]
    pub fn at_stage(mut self, stage: &str) -> Self {
        if self.stage.is_none() {
            self.stage = Some(stage.to_string());
        }
        self
    }

    /// Wrap an arbitrary error as `Critical` / `NEXUS_UNKNOWN_ERROR`,
    /// preserving its message and source chain as the cause ladder.
    pub fn wrap_unclassified(err: &(dyn std::error::Error + 'static), stage: &str) -> Self {
        Self::new(CODE_UNKNOWN, Severity::Critical, err.to_string())
            .with_stage(stage)
            .with_cause(ErrorCause::from_error(err))
    }
}

impl std::fmt::Display for NexusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.stage {
            Some(stage) => write!(
                f,
                "[{}] {} ({}, stage {stage})",
                self.code, self.message, self.severity
            ),
            None => write!(f, "[{}] {} ({})", self.code, self.message, self.severity),
        }
    }
}

impl std::error::Error for NexusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c as &dyn std::error::Error)
    }
}

// ── Persisted error entries ────────────────────────────────────────────

/// The append-only entry recorded in `PipelineState.errors`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEntry {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

impl From<&NexusError> for ErrorEntry {
    fn from(err: &NexusError) -> Self {
        Self {
            code: err.code.clone(),
            message: err.message.clone(),
            stage: err.stage.clone(),
            timestamp: err.timestamp,
            severity: err.severity,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
