//! Exponential-backoff retry of a single unit of work.
//!
//! [`run_with_retry`] drives a thunk for up to [`RetryPolicy::max_retries`]
//! attempts. Only two things trigger another attempt: a typed error with
//! [`Severity::Retryable`](crate::errors::Severity::Retryable), or an
//! unclassified error whose message carries a transient transport signal
//! (timeout, 5xx, rate-limit). Everything else propagates on the first
//! attempt.
//!
//! Delay before attempt `n+1` is `min(max_delay, base_delay · 2^(n-1))` with
//! ±20% jitter. A policy with `max_retries == 0` still executes the thunk
//! exactly once and never sleeps.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::errors::{CODE_RETRY_EXHAUSTED, CODE_UNKNOWN, ErrorCause, NexusError, Severity};

// ── Policy ─────────────────────────────────────────────────────────────

/// Backoff parameters for one retried unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts (not "extra" attempts). `0` is treated as `1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Symmetric jitter fraction applied to each delay (`0.2` → ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Attempts that will actually run: at least one.
    #[must_use]
    pub fn effective_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Un-jittered delay slept after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.saturating_mul(2u32.saturating_pow(exp));
        scaled.min(self.max_delay)
    }

    /// Upper bound on total sleep time across a full exhaustion, ignoring
    /// jitter: `Σ min(max_delay, base · 2^i)` over `attempts - 1` sleeps.
    #[must_use]
    pub fn max_total_delay(&self) -> Duration {
        (1..self.effective_attempts()).map(|a| self.delay_after(a)).sum()
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }
}

// ── Transport allowlist ────────────────────────────────────────────────

/// Transient transport signals that justify a retry even when the error was
/// never classified. Deliberately small; anything else must be typed.
const TRANSIENT_SIGNALS: &[&str] = &[
    "timeout",
    "timed out",
    "429",
    "rate limit",
    "too many requests",
    "500",
    "502",
    "503",
    "504",
    "connection reset",
    "temporarily unavailable",
];

/// Whether an unclassified error message looks like a transient transport
/// failure.
#[must_use]
pub fn is_transient_transport(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_SIGNALS.iter().any(|sig| lower.contains(sig))
}

fn should_retry(err: &NexusError) -> bool {
    err.is_retryable() || (err.code == CODE_UNKNOWN && is_transient_transport(&err.message))
}

// ── Engine ─────────────────────────────────────────────────────────────

/// A successful retried call plus how many attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `op` under `policy`, retrying qualifying failures with backoff.
///
/// The thunk receives the 1-based attempt number. On exhaustion the last
/// error becomes the cause of a `NEXUS_RETRY_EXHAUSTED` error that keeps
/// `Retryable` severity, so an enclosing fallback cascade treats the
/// provider as spent.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<Attempted<T>, NexusError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, NexusError>>,
{
    let attempts = policy.effective_attempts();
    let mut last_err: Option<NexusError> = None;

    for attempt in 1..=attempts {
        match op(attempt).await {
            Ok(value) => return Ok(Attempted { value, attempts: attempt }),
            Err(err) => {
                if !should_retry(&err) {
                    return Err(err);
                }
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts = attempts,
                    code = %err.code,
                    "retryable failure"
                );
                let exhausted = attempt == attempts;
                last_err = Some(err);
                if !exhausted {
                    let delay = policy.jittered(policy.delay_after(attempt));
                    debug!(op = op_name, delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    let last = last_err.expect("loop ran at least once");
    let mut out = NexusError::new(
        CODE_RETRY_EXHAUSTED,
        Severity::Retryable,
        format!("{op_name} failed after {attempts} attempts: {}", last.message),
    )
    .with_cause(ErrorCause::from_error(&last));
    out.stage = last.stage;
    Err(out)
}

// ── Tests ──────────────────────────────────────────────────────────────
