#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;

use nexus_orchestrator::cost::{TokenUsage, Usd};
use nexus_orchestrator::errors::{NexusError, Severity};
use nexus_orchestrator::fallback::run_with_fallback;
use nexus_orchestrator::quality::QualityMetrics;
use nexus_orchestrator::retry::{RetryPolicy, run_with_retry};
use nexus_orchestrator::stage::{ProviderInfo, Stage, StageInput, StageOutput};

/// Succeeds immediately, recording a small API spend.
#[derive(Debug, Clone)]
pub struct OkStage;

#[async_trait]
impl Stage for OkStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, NexusError> {
        input.costs.record_api_call(
            &input.stage,
            "gemini-2.0-flash",
            TokenUsage::new(400, 900),
            Usd::from_dollars(0.003),
            Some("gemini-2.0-flash".into()),
        );
        Ok(StageOutput::new(json!({"stage": input.stage})).with_provider(ProviderInfo {
            name: "primary".into(),
            tier: nexus_orchestrator::fallback::ProviderTier::Primary,
            attempts: 1,
        }))
    }
}

/// Succeeds and reports fixed quality metrics.
pub struct MetricsStage {
    pub metrics: QualityMetrics,
}

#[async_trait]
impl Stage for MetricsStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, NexusError> {
        Ok(StageOutput::new(json!({"stage": input.stage})).with_metrics(self.metrics.clone()))
    }
}

/// Always fails with the configured severity and code.
pub struct FailingStage {
    pub severity: Severity,
    pub code: &'static str,
}

#[async_trait]
impl Stage for FailingStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, NexusError> {
        Err(NexusError::new(self.code, self.severity, "scripted failure").with_stage(&input.stage))
    }
}

/// A TTS stage whose primary provider raises FALLBACK and whose secondary
/// succeeds, composed through the real retry and fallback engines.
pub struct TtsWithFallbackStage;

#[async_trait]
impl Stage for TtsWithFallbackStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, NexusError> {
        let providers = vec!["neural2".to_string(), "chirp3-hd".to_string()];
        let policy = RetryPolicy::new(input.config.retries);
        let outcome = run_with_fallback(&providers, "tts-synthesis", |provider| {
            let provider = provider.clone();
            let policy = policy.clone();
            async move {
                if provider == "neural2" {
                    Err(NexusError::fallback(
                        "NEXUS_TTS_VOICE_UNAVAILABLE",
                        "primary voice unavailable",
                    ))
                } else {
                    run_with_retry(&policy, "tts-call", |_| async {
                        Ok(json!({"audio": "synthesized"}))
                    })
                    .await
                }
            }
        })
        .await?;

        let provider = ProviderInfo::from(&outcome);
        Ok(StageOutput::new(outcome.value).with_provider(provider))
    }
}

/// Fails the first `failures` executions, then succeeds.
pub struct FlakyStage {
    pub failures: std::sync::atomic::AtomicU32,
    pub severity: Severity,
    pub code: &'static str,
}

impl FlakyStage {
    pub fn failing_once(severity: Severity, code: &'static str) -> Self {
        Self {
            failures: std::sync::atomic::AtomicU32::new(1),
            severity,
            code,
        }
    }
}

#[async_trait]
impl Stage for FlakyStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, NexusError> {
        use std::sync::atomic::Ordering;
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(
                NexusError::new(self.code, self.severity, "flaky failure").with_stage(&input.stage)
            );
        }
        Ok(StageOutput::new(json!({"stage": input.stage, "recovered": true})))
    }
}
