//! Quality gates exercised through full pipeline runs.

use nexus_orchestrator::decision::PublishDecision;
use nexus_orchestrator::errors::Severity;
use nexus_orchestrator::quality::{GateKind, QualityMetrics, WordSegment, WordTiming};
use nexus_orchestrator::runner::RunOptions;
use nexus_orchestrator::state::{PipelineState, PipelineStatus, StageStatus};
use nexus_orchestrator::store::DocumentStore;

mod common;
use common::*;

fn word(w: &str, start: f64, end: f64) -> WordTiming {
    WordTiming {
        word: w.to_string(),
        start_secs: start,
        end_secs: end,
    }
}

#[tokio::test]
async fn overlapping_word_timings_abort_the_pipeline() {
    let store = test_store();
    let clock = test_clock();
    // The seeded extractor emits words [0.0, 0.3] and [0.25, 0.5]: the
    // second starts before the first ends.
    let metrics = QualityMetrics::Timestamps {
        segments: vec![WordSegment {
            words: vec![word("alpha", 0.0, 0.3), word("beta", 0.25, 0.5)],
        }],
        word_match_ratio: 0.97,
        processing_secs: 4.0,
    };
    let runner = build_runner(
        store.clone(),
        clock,
        registry_with("render", MetricsStage { metrics }, Some(GateKind::Timestamps)),
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
    let state = PipelineState::load(store.as_ref(), TEST_DATE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.stages["render"].status, StageStatus::Failed);
    let critical = state
        .errors
        .iter()
        .find(|e| e.severity == Severity::Critical)
        .expect("critical error recorded");
    assert_eq!(critical.code, "NEXUS_TIMESTAMPS_NON_MONOTONIC");
}

#[tokio::test]
async fn short_script_flags_word_count_and_routes_to_review() {
    let store = test_store();
    let clock = test_clock();
    let metrics = QualityMetrics::ScriptGen {
        word_count: 800,
        excerpt: "Today we break down the week in AI.".into(),
    };
    let runner = build_runner(
        store.clone(),
        clock,
        registry_with("script-gen", MetricsStage { metrics }, Some(GateKind::ScriptGen)),
        vec![],
    );

    let summary = runner
        .run(TEST_DATE, RunOptions {
            skip_health_check: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // The gate failure is recoverable, so the pipeline still completes,
    // but the flag drives the decision to a human.
    assert_eq!(summary.status, PipelineStatus::Success);
    let decision = summary.decision.unwrap();
    assert_eq!(decision.decision, PublishDecision::HumanReview);
    assert_eq!(decision.reason, "Word count outside acceptable range");

    // Review item carries the excerpt.
    let review = store
        .get("review-queue", &format!("{TEST_DATE}-script-gen-word-count-low"))
        .await
        .unwrap()
        .expect("review item persisted");
    assert!(review["detail"]["excerpt"].as_str().unwrap().contains("week in AI"));
}

#[tokio::test]
async fn degraded_tts_metrics_warn_but_auto_publish() {
    let store = test_store();
    let clock = test_clock();
    let metrics = QualityMetrics::Tts {
        silence_pct: 7.5,
        clipping_detected: false,
        duration_secs: 495.0,
    };
    let runner = build_runner(
        store.clone(),
        clock,
        registry_with("tts", MetricsStage { metrics }, Some(GateKind::Tts)),
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
    assert_eq!(decision.decision, PublishDecision::AutoPublishWithWarning);
    assert_eq!(decision.reason, "Minor quality issues");

    let state = PipelineState::load(store.as_ref(), TEST_DATE)
        .await
        .unwrap()
        .unwrap();
    assert!(state.quality_context.degraded_stages.contains("tts"));
    // Degraded stages are a subset of the stages that actually executed.
    for degraded in &state.quality_context.degraded_stages {
        assert!(state.stages.contains_key(degraded));
    }
}

#[tokio::test]
async fn audio_mix_duration_drift_is_critical() {
    let store = test_store();
    let clock = test_clock();
    let metrics = QualityMetrics::AudioMix {
        duration_secs: 540.0,
        target_duration_secs: 500.0,
        peak_db: -1.0,
        voice_peak_db: -6.0,
        music_peak_db: None,
        ducking_applied: false,
    };
    let runner = build_runner(
        store.clone(),
        clock,
        registry_with("render", MetricsStage { metrics }, Some(GateKind::AudioMix)),
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
}
