//! Health preflight: parallel probes of external dependencies.
//!
//! Every registered [`HealthProbe`] runs concurrently with its own timeout.
//! Probes carry a static [`Criticality`]: an unhealthy `Critical` probe
//! fails the whole preflight (the runner then bypasses the pipeline and
//! deploys a buffer video); `Degraded`-criticality probes only contribute
//! warnings, whatever they report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default per-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ── Probe contract ─────────────────────────────────────────────────────

/// How much a service's failure matters to pipeline start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    /// Failure blocks the pipeline and triggers the buffer fallback.
    Critical,
    /// Failure is recorded as a warning; the pipeline still starts.
    Degraded,
}

/// Reported health of one probed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of one probe run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub service: String,
    pub status: ProbeStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ProbeResult {
    #[must_use]
    pub fn healthy(service: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            service: service.into(),
            status: ProbeStatus::Healthy,
            latency_ms,
            error: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn degraded(service: impl Into<String>, latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status: ProbeStatus::Degraded,
            latency_ms,
            error: Some(error.into()),
            metadata: None,
        }
    }

    #[must_use]
    pub fn unhealthy(service: impl Into<String>, latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status: ProbeStatus::Unhealthy,
            latency_ms,
            error: Some(error.into()),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// One registered dependency probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Service name used in results and alerts.
    fn service(&self) -> &str;

    /// Static criticality; defaults to gating.
    fn criticality(&self) -> Criticality {
        Criticality::Critical
    }

    /// Check the dependency. Failures are encoded in the result, not
    /// thrown; a panic-free probe that cannot reach its service reports
    /// `Unhealthy` with an error string.
    async fn probe(&self) -> ProbeResult;
}

// ── Aggregation ────────────────────────────────────────────────────────

/// Aggregated preflight verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckOutcome {
    pub all_passed: bool,
    pub critical_failures: Vec<ProbeResult>,
    pub warnings: Vec<ProbeResult>,
    /// Every probe's result, registration order.
    pub results: Vec<ProbeResult>,
    pub total_duration_ms: u64,
}

impl HealthCheckOutcome {
    /// Human-oriented warning strings for response envelopes.
    #[must_use]
    pub fn warning_lines(&self) -> Vec<String> {
        self.warnings
            .iter()
            .map(|w| match &w.error {
                Some(err) => format!("{}: {err}", w.service),
                None => w.service.clone(),
            })
            .collect()
    }
}

/// Runs all registered probes concurrently and aggregates.
pub struct HealthPreflight {
    probes: Vec<Arc<dyn HealthProbe>>,
    probe_timeout: Duration,
}

impl HealthPreflight {
    #[must_use]
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            probes: Vec::new(),
            probe_timeout,
        }
    }

    #[must_use]
    pub fn register(mut self, probe: impl HealthProbe + 'static) -> Self {
        self.probes.push(Arc::new(probe));
        self
    }

    #[must_use]
    pub fn register_shared(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Run every probe with an independent timeout; join on all.
    pub async fn run(&self) -> HealthCheckOutcome {
        let started = Instant::now();
        let timeout = self.probe_timeout;

        let futures = self.probes.iter().map(|probe| {
            let probe = Arc::clone(probe);
            async move {
                let probe_started = Instant::now();
                match tokio::time::timeout(timeout, probe.probe()).await {
                    Ok(result) => (probe.criticality(), result),
                    Err(_) => (
                        probe.criticality(),
                        ProbeResult::unhealthy(
                            probe.service(),
                            probe_started.elapsed().as_millis() as u64,
                            format!("probe timed out after {}ms", timeout.as_millis()),
                        ),
                    ),
                }
            }
        });
        let probed = join_all(futures).await;

        let mut critical_failures = Vec::new();
        let mut warnings = Vec::new();
        let mut results = Vec::with_capacity(probed.len());
        for (criticality, result) in probed {
            match (criticality, result.status) {
                (Criticality::Critical, ProbeStatus::Unhealthy) => {
                    warn!(service = %result.service, error = ?result.error, "critical dependency unhealthy");
                    critical_failures.push(result.clone());
                }
                (_, ProbeStatus::Healthy) => {}
                // Degraded-criticality failures and degraded statuses warn.
                _ => {
                    warn!(service = %result.service, status = ?result.status, "dependency degraded");
                    warnings.push(result.clone());
                }
            }
            results.push(result);
        }

        let outcome = HealthCheckOutcome {
            all_passed: critical_failures.is_empty(),
            critical_failures,
            warnings,
            results,
            total_duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            all_passed = outcome.all_passed,
            probes = outcome.results.len(),
            duration_ms = outcome.total_duration_ms,
            "health preflight finished"
        );
        outcome
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
