//! The pipeline runner: preflight, ordered stage walk, severity routing,
//! resume, and the trigger API surface.
//!
//! # Control flow
//!
//! A trigger lands here. The runner first runs the health preflight; if a
//! critical dependency is down it skips the pipeline entirely and deploys a
//! buffer video. Otherwise it loads or creates the pipeline state and walks
//! the registry's stage order through the [`StageExecutor`], consulting
//! error severity after each stage: `Recoverable` failures skip to the next
//! stage, anything harsher aborts the run and (cancellation aside) deploys
//! a buffer. After the last stage the pre-publish decision engine routes
//! the video to auto-publish or human review.
//!
//! # State machine
//!
//! ```text
//! pending --(health pass, first stage starts)--> running
//! running --(last stage success)--> success
//! running --(stage raises CRITICAL)--> failed      => buffer deploy
//! running --(stage raises RECOVERABLE)--> running  (skip to next)
//! pending --(health CRITICAL)--> skipped           => buffer deploy
//! failed  --(manual retry from-stage)--> running
//! ```
//!
//! Retry is allowed only from `failed`; `from-stage` resets that stage and
//! everything after it to pending while preserving the error log.

use std::sync::Arc;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::alerts::{Alert, AlertHub, AlertKind};
use crate::artifacts::{ArtifactRef, ArtifactType};
use crate::buffer::{BufferError, BufferInventory, BufferVideo};
use crate::collaborators::{AlertMessage, Clock};
use crate::config::OrchestratorConfig;
use crate::control::{CODE_CANCELLED, CancelToken};
use crate::cost::{BudgetTracker, CostError, CostTracker, Usd, video_cost_alert};
use crate::decision::{DecisionOutcome, decide, persist_decision};
use crate::errors::{NexusError, Severity};
use crate::executor::StageExecutor;
use crate::health::{HealthCheckOutcome, HealthPreflight};
use crate::incidents::{
    IncidentLogError, IncidentLogger, Resolution, ResolutionType, ResolvedBy,
};
use crate::stage::{StageInput, StageRegistry};
use crate::state::{PipelineState, PipelineStatus, StageStatus};
use crate::store::{DocumentStore, DocumentStoreExt, Filter, StoreError, paths};

// ── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error("invalid pipeline id: {id}")]
    #[diagnostic(
        code(nexus::runner::invalid_id),
        help("Pipeline ids are dates shaped YYYY-MM-DD.")
    )]
    InvalidPipelineId { id: String },

    #[error("pipeline not found: {id}")]
    #[diagnostic(code(nexus::runner::not_found))]
    PipelineNotFound { id: String },

    #[error("pipeline {id} already ran (status {status})")]
    #[diagnostic(code(nexus::runner::already_ran))]
    AlreadyRan { id: String, status: PipelineStatus },

    #[error("pipeline {id} is not in failed state (status {status})")]
    #[diagnostic(
        code(nexus::runner::not_retryable),
        help("Only failed pipelines can be retried.")
    )]
    NotRetryable { id: String, status: PipelineStatus },

    #[error("unknown stage: {stage}")]
    #[diagnostic(code(nexus::runner::unknown_stage))]
    UnknownStage { stage: String },

    #[error("stage registry is empty")]
    #[diagnostic(code(nexus::runner::empty_registry))]
    EmptyRegistry,

    #[error(transparent)]
    #[diagnostic(code(nexus::runner::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(nexus::runner::incidents))]
    Incident(#[from] IncidentLogError),

    #[error(transparent)]
    #[diagnostic(code(nexus::runner::cost))]
    Cost(#[from] CostError),
}

// ── Run options & summary ──────────────────────────────────────────────

/// Knobs for one run invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub skip_health_check: bool,
    /// Resume a failed pipeline instead of starting fresh.
    pub resume: bool,
    /// Stage to resume from; defaults to the state's `current_stage`.
    pub from_stage: Option<String>,
    /// Run-level cancellation token; all stage I/O races against it.
    pub cancel: Option<CancelToken>,
}

/// Per-stage line in a [`RunSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub cost: Usd,
}

/// What a finished (or skipped/failed) run looks like to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionOutcome>,
    pub total_cost: Usd,
    pub duration_ms: u64,
    pub stages: Vec<StageSummary>,
    pub buffer_deployed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheckOutcome>,
}

impl RunSummary {
    fn from_state(
        state: &PipelineState,
        order: &[String],
        decision: Option<DecisionOutcome>,
        health: Option<HealthCheckOutcome>,
        buffer_deployed: bool,
        total_cost: Usd,
    ) -> Self {
        let stages = order
            .iter()
            .filter_map(|name| {
                state.stages.get(name).map(|record| StageSummary {
                    name: name.clone(),
                    status: record.status,
                    provider: record.provider.clone(),
                    attempts: record.attempts,
                    duration_ms: record.duration_ms,
                    cost: record.cost,
                })
            })
            .collect();
        let duration_ms = state
            .end_time
            .map(|end| (end - state.start_time).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        Self {
            pipeline_id: state.pipeline_id.clone(),
            status: state.status,
            decision,
            total_cost,
            duration_ms,
            stages,
            buffer_deployed,
            health,
        }
    }
}

// ── Runner ─────────────────────────────────────────────────────────────

/// Orchestrates one pipeline per date through the fixed stage order.
pub struct PipelineRunner {
    config: OrchestratorConfig,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    registry: StageRegistry,
    preflight: HealthPreflight,
    buffers: BufferInventory,
    incidents: Arc<IncidentLogger>,
    executor: StageExecutor,
    budget: BudgetTracker,
    alerts: Option<Arc<AlertHub>>,
}

impl PipelineRunner {
    /// Assemble a runner and its subsystems over one store and clock.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        registry: StageRegistry,
        preflight: HealthPreflight,
    ) -> Self {
        let incidents = Arc::new(IncidentLogger::with_cache_ttl(
            store.clone(),
            clock.clone(),
            config.incident_cache_ttl,
        ));
        let executor = StageExecutor::new(store.clone(), clock.clone(), incidents.clone());
        let buffers = BufferInventory::new(store.clone(), clock.clone(), config.buffer.clone());
        let budget = BudgetTracker::new(
            store.clone(),
            clock.clone(),
            config.budget_thresholds,
            config.initial_credit,
        );
        Self {
            config,
            store,
            clock,
            registry,
            preflight,
            buffers,
            incidents,
            executor,
            budget,
            alerts: None,
        }
    }

    /// Attach an alert hub for the async notification tail.
    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<AlertHub>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    #[must_use]
    pub fn buffers(&self) -> &BufferInventory {
        &self.buffers
    }

    #[must_use]
    pub fn incidents(&self) -> &IncidentLogger {
        &self.incidents
    }

    // ── Core run loop ──────────────────────────────────────────────

    /// Drive one pipeline run to its terminal status.
    ///
    /// Pipeline-level failures (critical stage, health bypass) are part of
    /// the returned summary; `Err` is reserved for caller mistakes and
    /// infrastructure faults.
    #[instrument(skip(self, options), err)]
    pub async fn run(
        &self,
        pipeline_id: &str,
        options: RunOptions,
    ) -> Result<RunSummary, RunnerError> {
        if !paths::is_valid_pipeline_id(pipeline_id) {
            return Err(RunnerError::InvalidPipelineId {
                id: pipeline_id.to_string(),
            });
        }
        if self.registry.is_empty() {
            return Err(RunnerError::EmptyRegistry);
        }
        let order = self.registry.order();

        // Health preflight gates pipeline start.
        let health = if options.skip_health_check {
            None
        } else {
            Some(self.preflight.run().await)
        };
        if let Some(outcome) = &health
            && !outcome.all_passed
        {
            return self.skip_for_health(pipeline_id, outcome.clone()).await;
        }

        // Load or create state; resolve the starting stage.
        let existing = PipelineState::load(self.store.as_ref(), pipeline_id).await?;
        let (mut state, start_index, resumed) = match (existing, options.resume) {
            (Some(state), true) => {
                if !state.may_retry() {
                    return Err(RunnerError::NotRetryable {
                        id: pipeline_id.to_string(),
                        status: state.status,
                    });
                }
                let from = options
                    .from_stage
                    .clone()
                    .or_else(|| state.current_stage.clone())
                    .ok_or_else(|| RunnerError::UnknownStage {
                        stage: "<none>".to_string(),
                    })?;
                let Some(index) = self.registry.position(&from) else {
                    return Err(RunnerError::UnknownStage { stage: from });
                };
                let mut state = state;
                state.reset_stages_from(&order, &from);
                (state, index, true)
            }
            (Some(state), false) => {
                return Err(RunnerError::AlreadyRan {
                    id: pipeline_id.to_string(),
                    status: state.status,
                });
            }
            (None, true) => {
                return Err(RunnerError::PipelineNotFound {
                    id: pipeline_id.to_string(),
                });
            }
            (None, false) => (PipelineState::new(pipeline_id, self.clock.now()), 0, false),
        };

        state.status = PipelineStatus::Running;
        state.end_time = None;
        state.persist(self.store.as_ref()).await?;

        let cancel = options.cancel.unwrap_or_else(CancelToken::never);
        let costs = CostTracker::new(pipeline_id, self.clock.clone());
        let deadline = std::time::Instant::now() + self.config.pipeline_timeout;
        let mut outputs = serde_json::Map::new();
        let mut previous_stage: Option<String> =
            start_index.checked_sub(1).map(|i| order[i].clone());

        for name in &order[start_index..] {
            // Pipeline-wide deadline; stage timeouts nest under it.
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                let err = NexusError::critical(
                    "NEXUS_PIPELINE_TIMEOUT",
                    format!(
                        "run exceeded its {}s budget before stage {name}",
                        self.config.pipeline_timeout.as_secs()
                    ),
                )
                .with_stage(name.as_str());
                state.record_error(&err);
                return self.abort_run(state, &order, err, &costs, health).await;
            }
            let stage = self
                .registry
                .get(name)
                .expect("registry order and lookup agree");
            let mut stage_config = self.config.stage_defaults.clone();
            stage_config.timeout = stage_config.timeout.min(remaining);
            let input = StageInput {
                pipeline_id: pipeline_id.to_string(),
                stage: name.clone(),
                previous_stage: previous_stage.clone(),
                data: json!({
                    "topic": state.topic,
                    "outputs": serde_json::Value::Object(outputs.clone()),
                }),
                config: stage_config,
                quality: state.quality_context.clone(),
                cancel: cancel.clone(),
                costs: costs.clone(),
            };
            let gate = self.registry.gate_for(name);

            match self.executor.execute(&mut state, stage, input, gate).await {
                Ok(output) => {
                    if state.topic.is_none()
                        && let Some(topic) = output.data.get("topic").and_then(|t| t.as_str())
                    {
                        state.topic = Some(topic.to_string());
                    }
                    outputs.insert(name.clone(), output.data);
                }
                Err(err) if err.severity == Severity::Recoverable => {
                    // Stage failed but the pipeline stays alive.
                    warn!(stage = %name, code = %err.code, "recoverable stage failure, continuing");
                }
                Err(err) => {
                    return self
                        .abort_run(state, &order, err, &costs, health)
                        .await;
                }
            }
            previous_stage = Some(name.clone());
        }

        // All stages walked: decide, close out, settle the books.
        let decision = decide(&state.quality_context);
        persist_decision(
            self.store.as_ref(),
            pipeline_id,
            &decision,
            &state.quality_context,
            self.clock.now(),
        )
        .await?;

        state.status = PipelineStatus::Success;
        state.end_time = Some(self.clock.now());
        state.persist(self.store.as_ref()).await?;

        costs.persist(self.store.as_ref()).await?;
        let total_cost = costs.total();
        self.settle_budget(pipeline_id, total_cost).await;

        if resumed {
            self.resolve_open_incidents(pipeline_id).await;
        }

        info!(
            pipeline = pipeline_id,
            decision = ?decision.decision,
            cost = %total_cost,
            "pipeline completed"
        );
        Ok(RunSummary::from_state(
            &state,
            &order,
            Some(decision),
            health,
            false,
            total_cost,
        ))
    }

    /// Critical-severity abort: mark failed, deploy a buffer, alert.
    async fn abort_run(
        &self,
        mut state: PipelineState,
        order: &[String],
        err: NexusError,
        costs: &CostTracker,
        health: Option<HealthCheckOutcome>,
    ) -> Result<RunSummary, RunnerError> {
        state.status = PipelineStatus::Failed;
        state.end_time = Some(self.clock.now());
        // A failed pipeline always carries a critical entry; an escaped
        // sub-critical severity gets re-recorded at critical here.
        if !state
            .errors
            .iter()
            .any(|e| e.severity == Severity::Critical)
        {
            let mut escalated = err.clone();
            escalated.severity = Severity::Critical;
            state.record_error(&escalated);
        }
        state.persist(self.store.as_ref()).await?;
        costs.persist(self.store.as_ref()).await?;

        self.emit_alert(Alert::critical(
            AlertKind::PipelineFailure,
            AlertMessage::new(
                format!("Pipeline {} failed", state.pipeline_id),
                err.message.clone(),
            )
            .with_field("code", &err.code)
            .with_field("stage", err.stage.as_deref().unwrap_or("unknown")),
        ));

        // Cancellation is an operator action; it does not burn a buffer.
        let buffer_deployed = if err.code == CODE_CANCELLED {
            false
        } else {
            self.deploy_buffer(&mut state).await
        };
        state.persist(self.store.as_ref()).await?;

        Ok(RunSummary::from_state(
            &state,
            order,
            None,
            health,
            buffer_deployed,
            costs.total(),
        ))
    }

    /// Health preflight failed: persist a skipped run and deploy a buffer.
    async fn skip_for_health(
        &self,
        pipeline_id: &str,
        outcome: HealthCheckOutcome,
    ) -> Result<RunSummary, RunnerError> {
        let services: Vec<&str> = outcome
            .critical_failures
            .iter()
            .map(|f| f.service.as_str())
            .collect();
        warn!(pipeline = pipeline_id, ?services, "preflight failed, bypassing pipeline");

        let mut state = PipelineState::load(self.store.as_ref(), pipeline_id)
            .await?
            .unwrap_or_else(|| PipelineState::new(pipeline_id, self.clock.now()));
        state.status = PipelineStatus::Skipped;
        state.end_time = Some(self.clock.now());

        let err = NexusError::critical(
            "NEXUS_HEALTH_PREFLIGHT_FAILED",
            format!("critical dependency failure: {}", services.join(", ")),
        )
        .with_stage("health-preflight")
        .with_context(json!({ "services": services }));
        state.record_error(&err);
        state.persist(self.store.as_ref()).await?;

        self.incidents
            .log_incident(pipeline_id, "health-preflight", &err)
            .await?;

        let buffer_deployed = self.deploy_buffer(&mut state).await;
        state.persist(self.store.as_ref()).await?;

        let order = self.registry.order();
        Ok(RunSummary::from_state(
            &state,
            &order,
            None,
            Some(outcome),
            buffer_deployed,
            Usd::ZERO,
        ))
    }

    /// Claim a buffer and publish it under the pipeline's date.
    ///
    /// Returns whether a buffer actually shipped. Claim-then-publish is the
    /// two-step write from the buffer subsystem: a publish failure rolls
    /// the slot's status back while keeping `used`.
    async fn deploy_buffer(&self, state: &mut PipelineState) -> bool {
        let claimed = match self.buffers.claim_next().await {
            Ok(video) => video,
            Err(err) => {
                warn!(error = %err, "buffer deployment unavailable");
                let nexus_err: NexusError = err.into();
                if let Err(log_err) = self
                    .incidents
                    .log_incident(&state.pipeline_id, "buffer-deploy", &nexus_err)
                    .await
                {
                    warn!(error = %log_err, "incident write failed");
                }
                self.emit_alert(Alert::critical(
                    AlertKind::BufferStockLow,
                    AlertMessage::new(
                        "Buffer deployment failed",
                        format!("pipeline {}: {}", state.pipeline_id, nexus_err.message),
                    ),
                ));
                return false;
            }
        };

        match self.publish_buffer(state, &claimed).await {
            Ok(()) => {
                self.emit_alert(Alert::routine(
                    AlertKind::BufferDeployed,
                    AlertMessage::new(
                        "Buffer video deployed",
                        format!("'{}' shipped for {}", claimed.topic, state.pipeline_id),
                    )
                    .with_field("buffer", &claimed.id),
                ));
                true
            }
            Err(err) => {
                warn!(buffer = %claimed.id, error = %err, "buffer publish failed, rolling back");
                if let Err(rollback_err) =
                    self.buffers.release_after_publish_failure(&claimed.id).await
                {
                    warn!(error = %rollback_err, "buffer rollback failed");
                }
                let nexus_err = NexusError::critical(
                    "NEXUS_BUFFER_PUBLISH_FAILED",
                    format!("buffer {} publish failed: {err}", claimed.id),
                );
                if let Err(log_err) = self
                    .incidents
                    .log_incident(&state.pipeline_id, "buffer-deploy", &nexus_err)
                    .await
                {
                    warn!(error = %log_err, "incident write failed");
                }
                false
            }
        }
    }

    /// Step (b): make the claimed buffer the date's published video.
    async fn publish_buffer(
        &self,
        state: &mut PipelineState,
        video: &BufferVideo,
    ) -> Result<(), BufferError> {
        state.topic = Some(video.topic.clone());
        state.add_artifacts(
            "render",
            vec![ArtifactRef {
                artifact_type: ArtifactType::Video,
                url: video.video_url.clone(),
                size_bytes: 0,
                content_type: "video/mp4".to_string(),
                generated_at: self.clock.now(),
                stage: "render".to_string(),
            }],
        );
        state
            .persist(self.store.as_ref())
            .await
            .map_err(BufferError::from)?;
        let artifacts_path = paths::pipeline_artifacts(&state.pipeline_id);
        self.store
            .set_doc(artifacts_path.collection, &artifacts_path.id, &state.artifacts)
            .await
            .map_err(BufferError::from)?;
        Ok(())
    }

    /// Budget tail: record the spend, fire deduplicated threshold alerts.
    async fn settle_budget(&self, pipeline_id: &str, total: Usd) {
        if let Err(err) = self.budget.apply_spend(total).await {
            warn!(error = %err, "budget update failed");
            return;
        }
        let Some(level) = video_cost_alert(total, self.budget.thresholds()) else {
            return;
        };
        match self.budget.should_alert(level).await {
            Ok(true) => {
                let (kind, critical) = match level {
                    crate::cost::BudgetAlertLevel::Warning => (AlertKind::BudgetWarning, false),
                    crate::cost::BudgetAlertLevel::Critical => (AlertKind::BudgetCritical, true),
                };
                let message = AlertMessage::new(
                    format!("Video cost {level:?}"),
                    format!("pipeline {pipeline_id} spent {total}"),
                );
                let alert = if critical {
                    Alert::critical(kind, message)
                } else {
                    Alert::routine(kind, message)
                };
                self.emit_alert(alert);
            }
            Ok(false) => {}
            Err(err) => warn!(error = %err, "budget alert dedupe failed"),
        }
    }

    /// After a successful resumed run, close this pipeline's open
    /// incidents as system-resolved retries.
    async fn resolve_open_incidents(&self, pipeline_id: &str) {
        let open = self
            .store
            .query(
                "incidents",
                &[
                    Filter::eq("pipeline_id", pipeline_id),
                    Filter::eq("is_open", true),
                ],
            )
            .await;
        let Ok(open) = open else { return };
        for (id, _) in open {
            let result = self
                .incidents
                .resolve_incident(
                    &id,
                    Resolution {
                        resolution_type: ResolutionType::Retry,
                        resolved_by: ResolvedBy::System,
                    },
                )
                .await;
            if let Err(err) = result {
                warn!(incident = %id, error = %err, "auto-resolution failed");
            }
        }
    }

    fn emit_alert(&self, alert: Alert) {
        if let Some(hub) = &self.alerts
            && let Err(err) = hub.emit(alert)
        {
            warn!(error = %err, "alert enqueue failed");
        }
    }
}

// ── Trigger API ────────────────────────────────────────────────────────

/// HTTP-ish disposition a thin transport layer maps 1:1 onto status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Accepted,
    BadRequest,
    Unauthorized,
    Conflict,
    ServiceUnavailable,
}

impl Disposition {
    #[must_use]
    pub fn status_code(self) -> u16 {
        match self {
            Self::Accepted => 202,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Conflict => 409,
            Self::ServiceUnavailable => 503,
        }
    }
}

/// Request-shape sanity check for bearer tokens.
///
/// This is defense-in-depth against obviously malformed requests, not
/// authentication; real token validation belongs to the infrastructure
/// layer in front of the orchestrator.
#[must_use]
pub fn validate_bearer_token(token: Option<&str>) -> bool {
    matches!(token, Some(t) if (16..=4096).contains(&t.len()))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduledTriggerRequest {
    pub source: Option<String>,
    pub job_name: Option<String>,
    #[serde(skip)]
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledRunResponse {
    pub disposition: Disposition,
    pub pipeline_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PipelineStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheckOutcome>,
    pub health_warnings: Vec<String>,
    pub buffer_deployment_triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManualTriggerRequest {
    pub date: String,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub skip_health_check: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualRunResponse {
    pub disposition: Disposition,
    pub pipeline_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PipelineStatus>,
    /// Populated for `wait: true` requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryRequest {
    pub pipeline_id: String,
    pub from_stage: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryResponse {
    pub disposition: Disposition,
    pub message: String,
    pub pipeline_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PipelineStatus>,
}

impl PipelineRunner {
    /// `POST /trigger/scheduled`: today's pipeline, full preflight.
    pub async fn trigger_scheduled(
        &self,
        request: ScheduledTriggerRequest,
    ) -> ScheduledRunResponse {
        let pipeline_id = self.clock.now().format("%Y-%m-%d").to_string();
        if !validate_bearer_token(request.bearer_token.as_deref()) {
            return ScheduledRunResponse {
                disposition: Disposition::Unauthorized,
                pipeline_id,
                status: None,
                health: None,
                health_warnings: vec![],
                buffer_deployment_triggered: false,
                error: Some("missing or malformed bearer token".to_string()),
            };
        }
        info!(
            source = request.source.as_deref().unwrap_or("unknown"),
            job = request.job_name.as_deref().unwrap_or("unknown"),
            pipeline = %pipeline_id,
            "scheduled trigger received"
        );

        match self.run(&pipeline_id, RunOptions::default()).await {
            Ok(summary) if summary.status == PipelineStatus::Skipped => ScheduledRunResponse {
                disposition: Disposition::ServiceUnavailable,
                pipeline_id,
                status: Some(summary.status),
                health_warnings: summary
                    .health
                    .as_ref()
                    .map(|h| h.warning_lines())
                    .unwrap_or_default(),
                health: summary.health,
                buffer_deployment_triggered: summary.buffer_deployed,
                error: Some("health preflight failed".to_string()),
            },
            Ok(summary) => ScheduledRunResponse {
                disposition: Disposition::Accepted,
                pipeline_id,
                status: Some(summary.status),
                health_warnings: summary
                    .health
                    .as_ref()
                    .map(|h| h.warning_lines())
                    .unwrap_or_default(),
                health: summary.health,
                buffer_deployment_triggered: summary.buffer_deployed,
                error: None,
            },
            Err(err) => ScheduledRunResponse {
                disposition: match err {
                    RunnerError::AlreadyRan { .. } => Disposition::Conflict,
                    RunnerError::InvalidPipelineId { .. } => Disposition::BadRequest,
                    _ => Disposition::ServiceUnavailable,
                },
                pipeline_id,
                status: None,
                health: None,
                health_warnings: vec![],
                buffer_deployment_triggered: false,
                error: Some(err.to_string()),
            },
        }
    }

    /// `POST /trigger/manual`: a named date, optional preflight skip.
    ///
    /// The run is driven to completion either way; `wait` only controls
    /// whether the full summary is included. Detaching a no-wait run is
    /// the transport layer's job.
    pub async fn trigger_manual(&self, request: ManualTriggerRequest) -> ManualRunResponse {
        let pipeline_id = request.date.clone();
        let options = RunOptions {
            skip_health_check: request.skip_health_check,
            ..Default::default()
        };
        match self.run(&pipeline_id, options).await {
            Ok(summary) => ManualRunResponse {
                disposition: Disposition::Accepted,
                pipeline_id,
                status: Some(summary.status),
                summary: request.wait.then_some(summary),
                error: None,
            },
            Err(err) => ManualRunResponse {
                disposition: match err {
                    RunnerError::InvalidPipelineId { .. } => Disposition::BadRequest,
                    RunnerError::AlreadyRan { .. } => Disposition::Conflict,
                    _ => Disposition::ServiceUnavailable,
                },
                pipeline_id,
                status: None,
                summary: None,
                error: Some(err.to_string()),
            },
        }
    }

    /// `POST /retry`: re-enter a failed pipeline at `from_stage`.
    ///
    /// Preflight already ran for the original attempt; retries go straight
    /// back into the executor.
    pub async fn retry(&self, request: RetryRequest) -> RetryResponse {
        let options = RunOptions {
            skip_health_check: true,
            resume: true,
            from_stage: request.from_stage.clone(),
            ..Default::default()
        };
        match self.run(&request.pipeline_id, options).await {
            Ok(summary) => RetryResponse {
                disposition: Disposition::Accepted,
                message: format!(
                    "pipeline {} re-entered at {}",
                    request.pipeline_id,
                    request.from_stage.as_deref().unwrap_or("last failed stage")
                ),
                pipeline_id: request.pipeline_id,
                status: Some(summary.status),
            },
            Err(err) => RetryResponse {
                disposition: match err {
                    RunnerError::NotRetryable { .. } => Disposition::Conflict,
                    RunnerError::PipelineNotFound { .. }
                    | RunnerError::InvalidPipelineId { .. }
                    | RunnerError::UnknownStage { .. } => Disposition::BadRequest,
                    _ => Disposition::ServiceUnavailable,
                },
                message: err.to_string(),
                pipeline_id: request.pipeline_id,
                status: None,
            },
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
