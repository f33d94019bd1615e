//! The stage executor: the single seam through which every stage runs.
//!
//! Per stage, in order: `stage_start` log → persist the opened slot → run
//! the body under the stage timeout and the run's cancellation token →
//! evaluate the wired quality gate → merge the verdict into the quality
//! context → persist the finished slot → `stage_complete` log. On any
//! error: persist the error into the state's append-only log, write an
//! incident, persist the failed slot, rethrow.
//!
//! The incident write is awaited before returning, so it is visible before
//! the next stage starts; only alert fanout rides the async tail.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, instrument, warn};

use crate::collaborators::Clock;
use crate::control::CancelToken;
use crate::errors::{NexusError, Severity};
use crate::fallback::ProviderTier;
use crate::incidents::IncidentLogger;
use crate::quality::{GateKind, GateStatus, QualityReport, evaluate_gate};
use crate::stage::{Stage, StageInput, StageOutput};
use crate::state::{PipelineState, StageRecord, StageStatus};
use crate::store::{DocumentStore, DocumentStoreExt, paths};

/// Code raised when a stage overruns its configured timeout.
pub const CODE_STAGE_TIMEOUT: &str = "NEXUS_STAGE_TIMEOUT";

/// Runs stages with the full persistence/gating/incident envelope.
pub struct StageExecutor {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    incidents: Arc<IncidentLogger>,
}

impl StageExecutor {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        incidents: Arc<IncidentLogger>,
    ) -> Self {
        Self {
            store,
            clock,
            incidents,
        }
    }

    /// Execute one stage against the live pipeline state.
    ///
    /// The state is persisted after the slot opens and again after it
    /// closes; the second write completes before this function returns,
    /// which is what serializes stage N's commit before stage N+1 starts.
    #[instrument(skip_all, fields(pipeline = %state.pipeline_id, stage = %input.stage))]
    pub async fn execute(
        &self,
        state: &mut PipelineState,
        stage: Arc<dyn Stage>,
        input: StageInput,
        gate: Option<GateKind>,
    ) -> Result<StageOutput, NexusError> {
        let stage_name = input.stage.clone();
        info!(
            previous_stage = input.previous_stage.as_deref().unwrap_or("none"),
            degraded_inbound = input.quality.degraded_stages.len(),
            "stage_start"
        );

        state.enter_stage(&stage_name, self.clock.now());
        self.persist(state).await?;

        let stopwatch = Instant::now();
        let cancel = input.cancel.clone();
        let timeout = input.config.timeout;
        let costs = input.costs.clone();

        let body_result = run_body(stage, input, cancel.clone(), timeout, &stage_name).await;

        let output = match body_result {
            Ok(output) => output,
            Err(err) => {
                let cancelled = cancel.is_cancelled();
                return self
                    .fail_stage(state, &stage_name, err, stopwatch, &costs, cancelled)
                    .await;
            }
        };

        // Fallback bookkeeping feeds the pre-publish decision.
        if let Some(provider) = &output.provider
            && provider.tier == ProviderTier::Fallback
        {
            state
                .quality_context
                .record_fallback(&stage_name, &provider.name);
        }

        // Quality gate.
        let mut gate_warnings: Vec<String> = Vec::new();
        if let Some(kind) = gate {
            let report = evaluate_gate(kind, &stage_name, output.metrics.as_ref(), &state.quality_context);
            self.apply_report_side_effects(state, &report).await?;
            match report.status {
                GateStatus::Pass => {}
                GateStatus::Degraded => {
                    warn!(warnings = report.warnings.len(), "quality gate degraded");
                    state.quality_context.mark_degraded(&stage_name);
                    gate_warnings.extend(report.warnings.clone());
                }
                GateStatus::Fail { ref code, severity } => {
                    let reason = report
                        .reason
                        .clone()
                        .unwrap_or_else(|| "quality gate failed".to_string());
                    let err = NexusError::new(code.clone(), severity, reason)
                        .with_stage(&stage_name);
                    return self
                        .fail_stage(state, &stage_name, err, stopwatch, &costs, false)
                        .await;
                }
            }
        }

        // Close the slot.
        let mut record = StageRecord {
            status: StageStatus::Success,
            start_time: state.stages[&stage_name].start_time,
            end_time: Some(self.clock.now()),
            provider: output.provider.as_ref().map(|p| p.name.clone()),
            tier: output.provider.as_ref().map(|p| p.tier),
            attempts: output.provider.as_ref().map_or(1, |p| p.attempts),
            duration_ms: stopwatch.elapsed().as_millis() as u64,
            cost: costs.stage_total(&stage_name),
            warnings: output.warnings.clone(),
        };
        record.warnings.extend(gate_warnings);

        state.add_artifacts(&stage_name, output.artifacts.clone());
        state.finish_stage(&stage_name, record.clone());
        self.persist(state).await?;
        if !output.artifacts.is_empty() {
            self.persist_artifacts(state).await?;
        }

        info!(
            provider = record.provider.as_deref().unwrap_or("n/a"),
            tier = record.tier.map(|t| t.to_string()).unwrap_or_else(|| "n/a".into()),
            attempts = record.attempts,
            cost = %record.cost,
            warnings = record.warnings.len(),
            duration_ms = record.duration_ms,
            "stage_complete"
        );
        Ok(output)
    }

    /// Persist review items and merge flags, regardless of verdict.
    async fn apply_report_side_effects(
        &self,
        state: &mut PipelineState,
        report: &QualityReport,
    ) -> Result<(), NexusError> {
        for flag in &report.flags {
            state.quality_context.add_flag(flag);
        }
        for item in &report.review_items {
            let id = format!("{}-{}-{}", state.pipeline_id, item.stage, item.kind);
            let path = paths::review_item(&id);
            self.store
                .set_doc(path.collection, &path.id, item)
                .await
                .map_err(|e| {
                    NexusError::wrap_unclassified(&e, &report.stage)
                })?;
        }
        Ok(())
    }

    /// Shared error path: persist, log an incident, rethrow.
    async fn fail_stage(
        &self,
        state: &mut PipelineState,
        stage_name: &str,
        err: NexusError,
        stopwatch: Instant,
        costs: &crate::cost::CostTracker,
        cancelled: bool,
    ) -> Result<StageOutput, NexusError> {
        let err = err.at_stage(stage_name);
        error!(
            code = %err.code,
            severity = %err.severity,
            cancelled,
            "stage_error"
        );

        let status = if cancelled {
            StageStatus::Cancelled
        } else {
            StageStatus::Failed
        };
        let record = StageRecord {
            status,
            start_time: state.stages[stage_name].start_time,
            end_time: Some(self.clock.now()),
            provider: None,
            tier: None,
            attempts: 0,
            duration_ms: stopwatch.elapsed().as_millis() as u64,
            cost: costs.stage_total(stage_name),
            warnings: Vec::new(),
        };
        state.record_error(&err);
        state.finish_stage(stage_name, record);
        self.persist(state).await?;

        // Cancelled slots are an operator action, not an incident; every
        // other failure is recorded before the pipeline moves on.
        if !cancelled {
            if let Err(log_err) = self
                .incidents
                .log_incident(&state.pipeline_id, stage_name, &err)
                .await
            {
                warn!(error = %log_err, "incident write failed");
            }
        }
        Err(err)
    }

    /// Mirror the artifact index into its own `pipelines/{id}/artifacts`
    /// document for consumers that never load full state.
    async fn persist_artifacts(&self, state: &PipelineState) -> Result<(), NexusError> {
        let path = paths::pipeline_artifacts(&state.pipeline_id);
        self.store
            .set_doc(path.collection, &path.id, &state.artifacts)
            .await
            .map_err(|e| {
                NexusError::critical("NEXUS_STATE_PERSIST_FAILED", e.to_string())
                    .with_stage(state.current_stage.as_deref().unwrap_or("unknown"))
            })
    }

    async fn persist(&self, state: &PipelineState) -> Result<(), NexusError> {
        state
            .persist(self.store.as_ref())
            .await
            .map_err(|e| {
                NexusError::critical("NEXUS_STATE_PERSIST_FAILED", e.to_string())
                    .with_stage(state.current_stage.as_deref().unwrap_or("unknown"))
            })
    }
}

/// Race the body against the stage timeout and the run's cancel token.
async fn run_body(
    stage: Arc<dyn Stage>,
    input: StageInput,
    cancel: CancelToken,
    timeout: std::time::Duration,
    stage_name: &str,
) -> Result<StageOutput, NexusError> {
    tokio::select! {
        () = cancel.cancelled() => Err(CancelToken::cancellation_error(stage_name)),
        body = tokio::time::timeout(timeout, stage.execute(input)) => match body {
            Ok(result) => result,
            Err(_) => Err(NexusError::new(
                CODE_STAGE_TIMEOUT,
                Severity::Recoverable,
                format!("stage exceeded its {}ms timeout", timeout.as_millis()),
            )
            .with_stage(stage_name)),
        },
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::SystemClock;
    use crate::control::cancel_pair;
    use crate::cost::{CostTracker, TokenUsage, Usd};
    use crate::fallback::ProviderTier;
    use crate::quality::QualityMetrics;
    use crate::stage::{ProviderInfo, StageConfig};
    use crate::state::PipelineStatus;
    use crate::store::MemoryDocumentStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryDocumentStore>,
        executor: StageExecutor,
        state: PipelineState,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryDocumentStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let incidents = Arc::new(IncidentLogger::new(store.clone(), clock.clone()));
        let executor = StageExecutor::new(store.clone(), clock, incidents);
        let mut state = PipelineState::new("2026-01-22", Utc::now());
        state.status = PipelineStatus::Running;
        Harness {
            store,
            executor,
            state,
        }
    }

    fn input(stage: &str) -> StageInput {
        StageInput {
            pipeline_id: "2026-01-22".into(),
            stage: stage.into(),
            previous_stage: None,
            data: json!({}),
            config: StageConfig::default(),
            quality: Default::default(),
            cancel: CancelToken::never(),
            costs: CostTracker::new("2026-01-22", Arc::new(SystemClock)),
        }
    }

    struct OkStage {
        provider: Option<ProviderInfo>,
        metrics: Option<QualityMetrics>,
    }

    #[async_trait]
    impl Stage for OkStage {
        async fn execute(&self, input: StageInput) -> Result<StageOutput, NexusError> {
            input.costs.record_api_call(
                &input.stage,
                "gemini-2.0",
                TokenUsage::new(100, 200),
                Usd::from_dollars(0.02),
                None,
            );
            let mut out = StageOutput::new(json!({"ok": true}));
            if let Some(provider) = &self.provider {
                out = out.with_provider(provider.clone());
            }
            if let Some(metrics) = &self.metrics {
                out = out.with_metrics(metrics.clone());
            }
            Ok(out)
        }
    }

    struct FailingStage(Severity);

    #[async_trait]
    impl Stage for FailingStage {
        async fn execute(&self, _input: StageInput) -> Result<StageOutput, NexusError> {
            Err(NexusError::new("NEXUS_TTS_SYNTH_FAILED", self.0, "synthesis blew up"))
        }
    }

    #[tokio::test]
    async fn success_persists_slot_and_cost() {
        let mut h = harness();
        let out = h
            .executor
            .execute(
                &mut h.state,
                Arc::new(OkStage {
                    provider: None,
                    metrics: None,
                }),
                input("research"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.data["ok"], true);

        let record = &h.state.stages["research"];
        assert_eq!(record.status, StageStatus::Success);
        assert_eq!(record.cost, Usd::from_dollars(0.02));
        assert_eq!(record.attempts, 1);

        let persisted = PipelineState::load(h.store.as_ref(), "2026-01-22")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.stages["research"].status, StageStatus::Success);
    }

    #[tokio::test]
    async fn fallback_provider_lands_in_quality_context() {
        let mut h = harness();
        h.executor
            .execute(
                &mut h.state,
                Arc::new(OkStage {
                    provider: Some(ProviderInfo {
                        name: "chirp3-hd".into(),
                        tier: ProviderTier::Fallback,
                        attempts: 2,
                    }),
                    metrics: None,
                }),
                input("tts"),
                None,
            )
            .await
            .unwrap();
        assert!(h.state.quality_context.fallbacks_used.contains("tts:chirp3-hd"));
        assert_eq!(h.state.stages["tts"].attempts, 2);
        assert_eq!(h.state.stages["tts"].tier, Some(ProviderTier::Fallback));
    }

    #[tokio::test]
    async fn degraded_gate_marks_context_and_continues() {
        let mut h = harness();
        let out = h
            .executor
            .execute(
                &mut h.state,
                Arc::new(OkStage {
                    provider: None,
                    metrics: Some(QualityMetrics::Tts {
                        silence_pct: 8.0,
                        clipping_detected: false,
                        duration_secs: 480.0,
                    }),
                }),
                input("tts"),
                Some(GateKind::Tts),
            )
            .await;
        assert!(out.is_ok());
        assert!(h.state.quality_context.degraded_stages.contains("tts"));
        assert!(!h.state.stages["tts"].warnings.is_empty());
    }

    #[tokio::test]
    async fn failed_gate_raises_and_logs_incident() {
        let mut h = harness();
        let err = h
            .executor
            .execute(
                &mut h.state,
                Arc::new(OkStage {
                    provider: None,
                    metrics: Some(QualityMetrics::Thumbnail { variants: 2 }),
                }),
                input("thumbnails"),
                Some(GateKind::Thumbnail),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "NEXUS_THUMBNAIL_VARIANT_COUNT");
        assert_eq!(h.state.stages["thumbnails"].status, StageStatus::Failed);
        assert_eq!(h.state.errors.len(), 1);

        // Incident visible before the next stage would start.
        let incidents = h.store.query("incidents", &[]).await.unwrap();
        assert_eq!(incidents.len(), 1);
    }

    #[tokio::test]
    async fn word_count_failure_still_flags_context() {
        let mut h = harness();
        let err = h
            .executor
            .execute(
                &mut h.state,
                Arc::new(OkStage {
                    provider: None,
                    metrics: Some(QualityMetrics::ScriptGen {
                        word_count: 900,
                        excerpt: "Today we look at...".into(),
                    }),
                }),
                input("script-gen"),
                Some(GateKind::ScriptGen),
            )
            .await
            .unwrap_err();
        assert_eq!(err.severity, Severity::Recoverable);
        // The flag survives the failure so the pre-publish decision sees it.
        assert!(h.state.quality_context.flags.contains("word-count-low"));
        // Review item persisted.
        let review = h
            .store
            .get("review-queue", "2026-01-22-script-gen-word-count-low")
            .await
            .unwrap();
        assert!(review.is_some());
    }

    #[tokio::test]
    async fn body_error_is_persisted_and_rethrown() {
        let mut h = harness();
        let err = h
            .executor
            .execute(
                &mut h.state,
                Arc::new(FailingStage(Severity::Recoverable)),
                input("tts"),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "NEXUS_TTS_SYNTH_FAILED");
        assert_eq!(err.stage.as_deref(), Some("tts"));
        assert_eq!(h.state.stages["tts"].status, StageStatus::Failed);
        assert_eq!(h.state.errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_recoverably() {
        struct SlowStage;

        #[async_trait]
        impl Stage for SlowStage {
            async fn execute(&self, _input: StageInput) -> Result<StageOutput, NexusError> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(StageOutput::default())
            }
        }

        let mut h = harness();
        let mut inp = input("render");
        inp.config.timeout = Duration::from_millis(50);
        let err = h
            .executor
            .execute(&mut h.state, Arc::new(SlowStage), inp, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, CODE_STAGE_TIMEOUT);
        assert_eq!(err.severity, Severity::Recoverable);
    }

    #[tokio::test]
    async fn cancellation_persists_cancelled_slot_without_incident() {
        struct HangingStage;

        #[async_trait]
        impl Stage for HangingStage {
            async fn execute(&self, _input: StageInput) -> Result<StageOutput, NexusError> {
                std::future::pending().await
            }
        }

        let mut h = harness();
        let (handle, token) = cancel_pair();
        let mut inp = input("render");
        inp.cancel = token;

        let err = {
            let executor = &h.executor;
            let state = &mut h.state;
            let run = executor.execute(state, Arc::new(HangingStage), inp, None);
            tokio::pin!(run);

            tokio::select! {
                biased;
                _ = tokio::time::sleep(Duration::from_millis(10)) => handle.cancel(),
                _ = &mut run => panic!("stage should not finish before cancel"),
            }
            run.await.unwrap_err()
        };
        assert_eq!(err.code, crate::control::CODE_CANCELLED);
        assert_eq!(h.state.stages["render"].status, StageStatus::Cancelled);

        // No incident for operator-driven cancellation.
        let incidents = h.store.query("incidents", &[]).await.unwrap();
        assert!(incidents.is_empty());
    }
}
