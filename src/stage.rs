//! The stage seam: typed input/output envelopes, the [`Stage`] trait, and
//! the ordered registry the pipeline runner walks.
//!
//! Stages are black boxes to the orchestrator: news ingestion, script
//! generation, TTS, rendering all implement the same contract and carry
//! their payloads as tagged JSON in `data`. The executor supplies
//! everything around the contract: retries, fallback bookkeeping, quality
//! gating, persistence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::artifacts::ArtifactRef;
use crate::control::CancelToken;
use crate::cost::CostTracker;
use crate::errors::NexusError;
use crate::fallback::{FallbackOutcome, ProviderTier};
use crate::quality::{GateKind, QualityMetrics};
use crate::state::QualityContext;

// ── Config ─────────────────────────────────────────────────────────────

/// Per-stage execution knobs.
///
/// Every I/O path must live under `timeout`; a stage without one is a
/// contract violation, so the default is finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Stage-specific settings, opaque to the orchestrator.
    #[serde(default)]
    pub extra: Value,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            retries: 3,
            max_concurrency: None,
            extra: Value::Null,
        }
    }
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ── Input / output envelopes ───────────────────────────────────────────

/// Everything a stage receives.
#[derive(Clone)]
pub struct StageInput {
    pub pipeline_id: String,
    /// Stage's own registered name.
    pub stage: String,
    pub previous_stage: Option<String>,
    /// Tagged payload assembled from prior stage outputs.
    pub data: Value,
    pub config: StageConfig,
    /// Inbound degradation context (read-only for the stage).
    pub quality: QualityContext,
    pub cancel: CancelToken,
    /// Cost scope; calls recorded here land under this stage's name.
    pub costs: CostTracker,
}

/// Provider attribution for a stage result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub tier: ProviderTier,
    pub attempts: u32,
}

impl<T> From<&FallbackOutcome<T>> for ProviderInfo {
    fn from(outcome: &FallbackOutcome<T>) -> Self {
        Self {
            name: outcome.provider.clone(),
            tier: outcome.tier,
            attempts: outcome.attempts,
        }
    }
}

/// Everything a stage returns. Duration and cost are stamped on by the
/// executor, not the stage body.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub data: Value,
    pub artifacts: Vec<ArtifactRef>,
    pub metrics: Option<QualityMetrics>,
    pub provider: Option<ProviderInfo>,
    pub warnings: Vec<String>,
}

impl StageOutput {
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactRef>) -> Self {
        self.artifacts = artifacts;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: QualityMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: ProviderInfo) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

// ── Stage trait ────────────────────────────────────────────────────────

/// One named unit of work in the pipeline.
///
/// # Contract
///
/// * Compose [`run_with_retry`](crate::retry::run_with_retry) and
///   [`run_with_fallback`](crate::fallback::run_with_fallback) internally;
///   the executor only reads the final error's severity.
/// * Respect `input.cancel` on long I/O; the executor also races the whole
///   call against the token and the stage timeout.
/// * Record billable calls on `input.costs`.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, NexusError>;
}

// ── Registry ───────────────────────────────────────────────────────────

struct StageEntry {
    name: String,
    stage: Arc<dyn Stage>,
    gate: Option<GateKind>,
}

/// Ordered name → stage mapping; registration order is execution order.
#[derive(Default)]
pub struct StageRegistry {
    entries: Vec<StageEntry>,
}

impl StageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage without a quality gate.
    #[must_use]
    pub fn register(self, name: impl Into<String>, stage: impl Stage + 'static) -> Self {
        self.register_entry(name, Arc::new(stage), None)
    }

    /// Register a stage wired to a named quality gate.
    #[must_use]
    pub fn register_gated(
        self,
        name: impl Into<String>,
        stage: impl Stage + 'static,
        gate: GateKind,
    ) -> Self {
        self.register_entry(name, Arc::new(stage), Some(gate))
    }

    /// Register a pre-wrapped stage.
    #[must_use]
    pub fn register_shared(
        self,
        name: impl Into<String>,
        stage: Arc<dyn Stage>,
        gate: Option<GateKind>,
    ) -> Self {
        self.register_entry(name, stage, gate)
    }

    fn register_entry(
        mut self,
        name: impl Into<String>,
        stage: Arc<dyn Stage>,
        gate: Option<GateKind>,
    ) -> Self {
        let name = name.into();
        debug_assert!(
            !self.entries.iter().any(|e| e.name == name),
            "duplicate stage name: {name}"
        );
        self.entries.push(StageEntry { name, stage, gate });
        self
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn order(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| Arc::clone(&e.stage))
    }

    #[must_use]
    pub fn gate_for(&self, name: &str) -> Option<GateKind> {
        self.entries.iter().find(|e| e.name == name).and_then(|e| e.gate)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Intra-stage fan-out ────────────────────────────────────────────────

/// Run `work` over `items` with at most `max_concurrency` in flight.
///
/// One worker's failure never cancels its siblings; the caller composes
/// the per-item results after all finish.
pub async fn fan_out<I, T, F, Fut>(
    max_concurrency: usize,
    items: Vec<I>,
    work: F,
) -> Vec<Result<T, NexusError>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, NexusError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let handles: Vec<_> = items
        .into_iter()
        .map(|item| {
            let permit_source = Arc::clone(&semaphore);
            let fut = work(item);
            tokio::spawn(async move {
                let _permit = permit_source.acquire_owned().await.expect("semaphore open");
                fut.await
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(join_err) => results.push(Err(NexusError::wrap_unclassified(&join_err, "fan-out"))),
        }
    }
    results
}

// ── Tests ──────────────────────────────────────────────────────────────
