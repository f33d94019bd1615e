//! Ordered provider cascade for one unit of work.
//!
//! [`run_with_fallback`] tries each provider in the order given. A provider
//! is considered spent when its thunk fails with `Fallback` severity or with
//! `Retryable` severity (which, coming out of
//! [`run_with_retry`](crate::retry::run_with_retry), means the retry budget
//! inside that provider was exhausted). `Critical` and `Recoverable` errors
//! short-circuit the cascade and propagate untouched. Running out of
//! providers is itself `Critical`.
//!
//! The engine is a pure function over the provider slice; it owns no
//! provider lifecycle.

use tracing::{info, warn};

use crate::errors::{CODE_FALLBACK_EXHAUSTED, ErrorCause, NexusError, Severity};
use crate::retry::Attempted;

// ── Provider naming ────────────────────────────────────────────────────

/// Anything that can sit in a cascade needs a stable name for logging and
/// for the `stage:provider` entries in the quality context.
pub trait ProviderName {
    fn provider_name(&self) -> &str;
}

impl ProviderName for String {
    fn provider_name(&self) -> &str {
        self
    }
}

impl ProviderName for &str {
    fn provider_name(&self) -> &str {
        self
    }
}

// ── Outcome ────────────────────────────────────────────────────────────

/// Which slot in the cascade produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTier {
    Primary,
    Fallback,
}

impl std::fmt::Display for ProviderTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A successful cascade run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackOutcome<T> {
    pub value: T,
    /// Name of the provider that produced the value.
    pub provider: String,
    /// `Primary` for index 0, `Fallback` for anything after it.
    pub tier: ProviderTier,
    /// Attempts spent inside the winning provider.
    pub attempts: u32,
}

// ── Engine ─────────────────────────────────────────────────────────────

/// Try `providers` in order until one yields a value.
///
/// The thunk returns [`Attempted`] so retry engines compose directly:
/// a body that wraps its call in `run_with_retry` hands the attempt count
/// straight through.
pub async fn run_with_fallback<P, T, F, Fut>(
    providers: &[P],
    op_name: &str,
    mut op: F,
) -> Result<FallbackOutcome<T>, NexusError>
where
    P: ProviderName,
    F: FnMut(&P) -> Fut,
    Fut: Future<Output = Result<Attempted<T>, NexusError>>,
{
    if providers.is_empty() {
        return Err(NexusError::critical(
            CODE_FALLBACK_EXHAUSTED,
            format!("{op_name}: no providers configured"),
        ));
    }

    let mut last_err: Option<NexusError> = None;

    for (index, provider) in providers.iter().enumerate() {
        let name = provider.provider_name();
        match op(provider).await {
            Ok(attempted) => {
                let tier = if index == 0 {
                    ProviderTier::Primary
                } else {
                    ProviderTier::Fallback
                };
                if tier == ProviderTier::Fallback {
                    info!(op = op_name, provider = name, "fallback provider succeeded");
                }
                return Ok(FallbackOutcome {
                    value: attempted.value,
                    provider: name.to_string(),
                    tier,
                    attempts: attempted.attempts,
                });
            }
            Err(err) => match err.severity {
                Severity::Fallback | Severity::Retryable => {
                    warn!(
                        op = op_name,
                        provider = name,
                        code = %err.code,
                        remaining = providers.len() - index - 1,
                        "provider exhausted, cascading"
                    );
                    last_err = Some(err);
                }
                // Degraded results are produced, not thrown; a thrown
                // Degraded is treated as terminal like the rest.
                Severity::Critical | Severity::Recoverable | Severity::Degraded => {
                    return Err(err);
                }
            },
        }
    }

    let last = last_err.expect("non-empty provider list");
    let mut out = NexusError::critical(
        CODE_FALLBACK_EXHAUSTED,
        format!(
            "{op_name}: all {} providers exhausted, last: {}",
            providers.len(),
            last.message
        ),
    )
    .with_cause(ErrorCause::from_error(&last));
    out.stage = last.stage;
    Err(out)
}

// ── Tests ──────────────────────────────────────────────────────────────
