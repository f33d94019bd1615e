//! End-to-end runner scenarios over the in-memory store.

use nexus_orchestrator::decision::PublishDecision;
use nexus_orchestrator::errors::Severity;
use nexus_orchestrator::fallback::ProviderTier;
use nexus_orchestrator::runner::{
    Disposition, ManualTriggerRequest, RetryRequest, RunOptions,
};
use nexus_orchestrator::state::{PipelineState, PipelineStatus, StageStatus};

mod common;
use common::*;

#[tokio::test]
async fn happy_path_auto_publishes_with_primary_providers() {
    let store = test_store();
    let clock = test_clock();
    let runner = build_runner(
        store.clone(),
        clock,
        minimal_registry(),
        vec![Box::new(FixedProbe::healthy("tts-api"))],
    );

    let response = runner
        .trigger_manual(ManualTriggerRequest {
            date: TEST_DATE.into(),
            wait: true,
            skip_health_check: false,
        })
        .await;

    assert_eq!(response.disposition, Disposition::Accepted);
    assert_eq!(response.status, Some(PipelineStatus::Success));
    let summary = response.summary.expect("wait=true returns the summary");
    assert_eq!(
        summary.decision.as_ref().unwrap().decision,
        PublishDecision::AutoPublish
    );
    assert_eq!(summary.stages.len(), 6);
    for stage in &summary.stages {
        assert_eq!(stage.status, StageStatus::Success);
        assert_eq!(stage.attempts, 1);
        assert_eq!(stage.provider.as_deref(), Some("primary"));
    }

    let state = PipelineState::load(store.as_ref(), TEST_DATE)
        .await
        .unwrap()
        .expect("state persisted");
    assert_eq!(state.status, PipelineStatus::Success);
    for record in state.stages.values() {
        assert_eq!(record.tier, Some(ProviderTier::Primary));
    }
    assert!(state.invariant_violations().is_empty());
}

#[tokio::test]
async fn tts_fallback_routes_to_human_review() {
    let store = test_store();
    let clock = test_clock();
    let runner = build_runner(
        store.clone(),
        clock,
        registry_with("tts", TtsWithFallbackStage, None),
        vec![],
    );

    let summary = runner
        .run(TEST_DATE, RunOptions {
            skip_health_check: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.status, PipelineStatus::Success);
    let decision = summary.decision.unwrap();
    assert_eq!(decision.decision, PublishDecision::HumanReview);
    assert_eq!(decision.reason, "TTS fallback used");

    let state = PipelineState::load(store.as_ref(), TEST_DATE)
        .await
        .unwrap()
        .unwrap();
    assert!(state.quality_context.fallbacks_used.contains("tts:chirp3-hd"));
    assert_eq!(state.stages["tts"].tier, Some(ProviderTier::Fallback));
    assert_eq!(state.stages["tts"].provider.as_deref(), Some("chirp3-hd"));
}

#[tokio::test]
async fn recoverable_stage_failure_keeps_pipeline_alive() {
    let store = test_store();
    let clock = test_clock();
    let runner = build_runner(
        store.clone(),
        clock,
        registry_with(
            "thumbnails",
            FailingStage {
                severity: Severity::Recoverable,
                code: "NEXUS_THUMBNAIL_GEN_FAILED",
            },
            None,
        ),
        vec![],
    );

    let summary = runner
        .run(TEST_DATE, RunOptions {
            skip_health_check: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // The pipeline finishes despite the failed stage.
    assert_eq!(summary.status, PipelineStatus::Success);
    let state = PipelineState::load(store.as_ref(), TEST_DATE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.stages["thumbnails"].status, StageStatus::Failed);
    assert_eq!(state.stages["render"].status, StageStatus::Success);
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].code, "NEXUS_THUMBNAIL_GEN_FAILED");
}

#[tokio::test]
async fn critical_stage_failure_fails_pipeline_and_deploys_buffer() {
    let store = test_store();
    let clock = test_clock();
    let buffer = seed_buffer(store.clone(), clock.clone(), "evergreen-ai-explainer").await;
    let runner = build_runner(
        store.clone(),
        clock,
        registry_with(
            "render",
            FailingStage {
                severity: Severity::Critical,
                code: "NEXUS_RENDER_CORRUPT",
            },
            None,
        ),
        vec![],
    );

    let summary = runner
        .run(TEST_DATE, RunOptions {
            skip_health_check: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.status, PipelineStatus::Failed);
    assert!(summary.buffer_deployed);

    let state = PipelineState::load(store.as_ref(), TEST_DATE)
        .await
        .unwrap()
        .unwrap();
    assert!(state.errors.iter().any(|e| e.severity == Severity::Critical));
    assert!(state.invariant_violations().is_empty());
    // The buffer's video became the date's render artifact.
    assert_eq!(state.artifacts["render"][0].url, buffer.video_url);

    // Incident recorded for the render failure.
    let incidents = runner.incidents().by_stage("render").await.unwrap();
    assert_eq!(incidents.len(), 1);
}

#[tokio::test]
async fn retry_from_failed_stage_preserves_earlier_stages() {
    let store = test_store();
    let clock = test_clock();

    // First run: tts fails critically.
    let runner = build_runner(
        store.clone(),
        clock.clone(),
        registry_with(
            "tts",
            FailingStage {
                severity: Severity::Critical,
                code: "NEXUS_TTS_FATAL",
            },
            None,
        ),
        vec![],
    );
    let summary = runner
        .run(TEST_DATE, RunOptions {
            skip_health_check: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(summary.status, PipelineStatus::Failed);

    let failed_state = PipelineState::load(store.as_ref(), TEST_DATE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed_state.current_stage.as_deref(), Some("tts"));
    let research_started = failed_state.stages["research"].start_time;

    // Retry with a healthy tts stage.
    let runner = build_runner(store.clone(), clock, minimal_registry(), vec![]);
    let response = runner
        .retry(RetryRequest {
            pipeline_id: TEST_DATE.into(),
            from_stage: Some("tts".into()),
        })
        .await;

    assert_eq!(response.disposition, Disposition::Accepted);
    assert_eq!(response.status, Some(PipelineStatus::Success));

    let state = PipelineState::load(store.as_ref(), TEST_DATE)
        .await
        .unwrap()
        .unwrap();
    // Stages before tts kept their original slots.
    assert_eq!(state.stages["research"].start_time, research_started);
    assert_eq!(state.stages["tts"].status, StageStatus::Success);
    assert_eq!(state.stages["render"].status, StageStatus::Success);
    // The original error log survives the retry.
    assert!(state.errors.iter().any(|e| e.code == "NEXUS_TTS_FATAL"));

    // The open incident from the first run was system-resolved as a retry.
    let incidents = runner.incidents().by_stage("tts").await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert!(!incidents[0].is_open);
}

#[tokio::test]
async fn retry_rejected_unless_failed() {
    let store = test_store();
    let clock = test_clock();
    let runner = build_runner(store.clone(), clock, minimal_registry(), vec![]);

    // Complete the pipeline successfully first.
    runner
        .run(TEST_DATE, RunOptions {
            skip_health_check: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let before = PipelineState::load(store.as_ref(), TEST_DATE)
        .await
        .unwrap()
        .unwrap();

    let response = runner
        .retry(RetryRequest {
            pipeline_id: TEST_DATE.into(),
            from_stage: Some("tts".into()),
        })
        .await;
    assert_eq!(response.disposition, Disposition::Conflict);
    assert!(response.message.contains("not in failed state"));

    // No state mutation happened.
    let after = PipelineState::load(store.as_ref(), TEST_DATE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn retry_unknown_pipeline_is_bad_request() {
    let runner = build_runner(test_store(), test_clock(), minimal_registry(), vec![]);
    let response = runner
        .retry(RetryRequest {
            pipeline_id: "2026-03-03".into(),
            from_stage: None,
        })
        .await;
    assert_eq!(response.disposition, Disposition::BadRequest);
}

#[tokio::test]
async fn retry_unknown_stage_is_bad_request() {
    let store = test_store();
    let clock = test_clock();
    let runner = build_runner(
        store.clone(),
        clock.clone(),
        registry_with(
            "tts",
            FailingStage {
                severity: Severity::Critical,
                code: "NEXUS_TTS_FATAL",
            },
            None,
        ),
        vec![],
    );
    runner
        .run(TEST_DATE, RunOptions {
            skip_health_check: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let response = runner
        .retry(RetryRequest {
            pipeline_id: TEST_DATE.into(),
            from_stage: Some("color-grade".into()),
        })
        .await;
    assert_eq!(response.disposition, Disposition::BadRequest);
}

#[tokio::test]
async fn duplicate_manual_run_conflicts() {
    let store = test_store();
    let clock = test_clock();
    let runner = build_runner(store, clock, minimal_registry(), vec![]);

    let first = runner
        .trigger_manual(ManualTriggerRequest {
            date: TEST_DATE.into(),
            wait: false,
            skip_health_check: true,
        })
        .await;
    assert_eq!(first.disposition, Disposition::Accepted);
    assert!(first.summary.is_none());

    let second = runner
        .trigger_manual(ManualTriggerRequest {
            date: TEST_DATE.into(),
            wait: true,
            skip_health_check: true,
        })
        .await;
    assert_eq!(second.disposition, Disposition::Conflict);
}

#[tokio::test]
async fn invalid_date_is_bad_request() {
    let runner = build_runner(test_store(), test_clock(), minimal_registry(), vec![]);
    let response = runner
        .trigger_manual(ManualTriggerRequest {
            date: "tomorrow".into(),
            wait: true,
            skip_health_check: true,
        })
        .await;
    assert_eq!(response.disposition, Disposition::BadRequest);
}

#[tokio::test]
async fn costs_reconcile_across_stage_records() {
    let store = test_store();
    let clock = test_clock();
    let runner = build_runner(store.clone(), clock, minimal_registry(), vec![]);
    let summary = runner
        .run(TEST_DATE, RunOptions {
            skip_health_check: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let state = PipelineState::load(store.as_ref(), TEST_DATE)
        .await
        .unwrap()
        .unwrap();
    let stage_sum: nexus_orchestrator::cost::Usd =
        state.stages.values().map(|record| record.cost).sum();
    assert_eq!(stage_sum, summary.total_cost);
}
