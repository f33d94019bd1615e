//! Persisted pipeline state.
//!
//! One [`PipelineState`] document exists per pipeline id (`YYYY-MM-DD`).
//! Stages execute strictly sequentially, so the document has a single
//! writer; writes are last-writer-wins per stage slot.
//!
//! Invariants maintained here and checked by tests:
//!
//! * `status == Running` implies exactly one stage slot is `Running`.
//! * [`QualityContext`] only grows: merges are unions, never removals.
//! * A `Failed` pipeline carries at least one `Critical` entry in `errors`.
//! * `errors` is append-only and order-preserving.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactRef;
use crate::cost::Usd;
use crate::errors::{ErrorEntry, NexusError, Severity};
use crate::fallback::ProviderTier;
use crate::store::{DocumentStore, DocumentStoreExt, StoreError, paths};

// ── Status enums ───────────────────────────────────────────────────────

/// Lifecycle of a whole pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle of one stage slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

// ── Stage slot ─────────────────────────────────────────────────────────

/// Persisted record of one stage's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<ProviderTier>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub cost: Usd,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StageRecord {
    /// Fresh slot for a stage that just started.
    #[must_use]
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            status: StageStatus::Running,
            start_time: now,
            end_time: None,
            provider: None,
            tier: None,
            attempts: 0,
            duration_ms: 0,
            cost: Usd::ZERO,
            warnings: Vec::new(),
        }
    }
}

// ── Quality context ────────────────────────────────────────────────────

/// The accumulating bag of degradation markers that flows stage-to-stage.
///
/// Merge semantics are set-union; nothing is ever removed, so the context
/// is monotonically growing across a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityContext {
    #[serde(default)]
    pub degraded_stages: BTreeSet<String>,
    /// Entries of the form `stage:provider`.
    #[serde(default)]
    pub fallbacks_used: BTreeSet<String>,
    #[serde(default)]
    pub flags: BTreeSet<String>,
}

impl QualityContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_degraded(&mut self, stage: &str) {
        self.degraded_stages.insert(stage.to_string());
    }

    pub fn record_fallback(&mut self, stage: &str, provider: &str) {
        self.fallbacks_used.insert(format!("{stage}:{provider}"));
    }

    pub fn add_flag(&mut self, flag: &str) {
        self.flags.insert(flag.to_string());
    }

    /// Union-merge `other` into `self`.
    pub fn merge(&mut self, other: &QualityContext) {
        self.degraded_stages
            .extend(other.degraded_stages.iter().cloned());
        self.fallbacks_used
            .extend(other.fallbacks_used.iter().cloned());
        self.flags.extend(other.flags.iter().cloned());
    }

    /// Stage names that used a fallback provider.
    pub fn fallback_stages(&self) -> impl Iterator<Item = &str> {
        self.fallbacks_used
            .iter()
            .map(|entry| entry.split_once(':').map_or(entry.as_str(), |(s, _)| s))
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.degraded_stages.is_empty() && self.fallbacks_used.is_empty() && self.flags.is_empty()
    }
}

// ── Pipeline state ─────────────────────────────────────────────────────

/// The `pipelines/{id}/state` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    /// Last-entered stage, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Vec<ArtifactRef>>,
    #[serde(default)]
    pub quality_context: QualityContext,
    /// Append-only; order preserved across persist/reload.
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl PipelineState {
    /// Fresh pending state for a pipeline id.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            status: PipelineStatus::Pending,
            current_stage: None,
            start_time: now,
            end_time: None,
            stages: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            quality_context: QualityContext::new(),
            errors: Vec::new(),
            topic: None,
        }
    }

    /// Append an error to the log (append-only, order preserved).
    pub fn record_error(&mut self, err: &NexusError) {
        self.errors.push(ErrorEntry::from(err));
    }

    /// Enter a stage: set `current_stage` and open a running slot.
    pub fn enter_stage(&mut self, stage: &str, now: DateTime<Utc>) {
        self.current_stage = Some(stage.to_string());
        self.stages
            .insert(stage.to_string(), StageRecord::started(now));
    }

    /// Replace a stage slot (last-writer-wins within the single writer).
    pub fn finish_stage(&mut self, stage: &str, record: StageRecord) {
        self.stages.insert(stage.to_string(), record);
    }

    pub fn add_artifacts(&mut self, stage: &str, mut refs: Vec<ArtifactRef>) {
        if refs.is_empty() {
            return;
        }
        self.artifacts
            .entry(stage.to_string())
            .or_default()
            .append(&mut refs);
    }

    /// Whether a manual retry may target this state.
    #[must_use]
    pub fn may_retry(&self) -> bool {
        self.status == PipelineStatus::Failed
    }

    /// Reset every stage at or after `from` (in `order`) back to pending,
    /// clearing their slots. The error log is preserved; degradations from
    /// earlier stages stay because cleared stages will re-contribute theirs
    /// on re-execution.
    pub fn reset_stages_from(&mut self, order: &[String], from: &str) {
        let Some(from_index) = order.iter().position(|s| s == from) else {
            return;
        };
        for stage in &order[from_index..] {
            self.stages.remove(stage);
            self.artifacts.remove(stage);
        }
        self.current_stage = Some(from.to_string());
        self.end_time = None;
    }

    /// Violated-invariant descriptions, empty when the state is coherent.
    #[must_use]
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.status == PipelineStatus::Running {
            let running = self
                .stages
                .values()
                .filter(|s| s.status == StageStatus::Running)
                .count();
            if running != 1 {
                violations.push(format!("running pipeline has {running} running stages"));
            }
        }
        if self.status == PipelineStatus::Failed
            && !self.errors.iter().any(|e| e.severity == Severity::Critical)
        {
            violations.push("failed pipeline has no critical error".to_string());
        }
        violations
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Write this document to `pipelines/{id}/state`.
    pub async fn persist(&self, store: &dyn DocumentStore) -> Result<(), StoreError> {
        let path = paths::pipeline_state(&self.pipeline_id);
        store.set_doc(path.collection, &path.id, self).await
    }

    /// Load the document for `pipeline_id`, `None` if absent.
    pub async fn load(
        store: &dyn DocumentStore,
        pipeline_id: &str,
    ) -> Result<Option<PipelineState>, StoreError> {
        let path = paths::pipeline_state(pipeline_id);
        store.get_doc(path.collection, &path.id).await
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
