//! Quality gates: per-stage metric checks feeding the quality context.
//!
//! A gate is a pure function from a stage's [`QualityMetrics`] (plus the
//! inbound [`QualityContext`]) to a [`QualityReport`]. The stage executor
//! merges the report into the pipeline's quality context:
//!
//! * `Pass`: no change.
//! * `Degraded`: the stage joins `degraded_stages` and warnings accumulate.
//! * `Fail`: the executor raises an error at the gate's own severity
//!   (`Recoverable` skips the stage, `Critical` aborts the run).
//!
//! Gates never touch I/O; review-queue writes for the items they emit are
//! the executor's job.

pub mod gates;

use serde::{Deserialize, Serialize};

use crate::errors::Severity;
use crate::state::QualityContext;

// ── Metrics ────────────────────────────────────────────────────────────

/// One timed word from the timestamp extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

/// A contiguous run of words; gap and monotonicity rules apply within it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordSegment {
    pub words: Vec<WordTiming>,
}

/// Stage-specific metrics, tagged by stage family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum QualityMetrics {
    ScriptGen {
        word_count: u32,
        /// Leading excerpt carried into review items on failure.
        excerpt: String,
    },
    Tts {
        silence_pct: f64,
        clipping_detected: bool,
        duration_secs: f64,
    },
    Render {
        frame_drops: u32,
        audio_sync_ms: u32,
    },
    Thumbnail {
        variants: u32,
    },
    Pronunciation {
        unknown_terms: u32,
        accuracy_pct: f64,
    },
    AudioMix {
        duration_secs: f64,
        target_duration_secs: f64,
        peak_db: f64,
        voice_peak_db: f64,
        music_peak_db: Option<f64>,
        ducking_applied: bool,
    },
    Timestamps {
        segments: Vec<WordSegment>,
        word_match_ratio: f64,
        processing_secs: f64,
    },
}

// ── Reports ────────────────────────────────────────────────────────────

/// Verdict of a gate run.
#[derive(Debug, Clone, PartialEq)]
pub enum GateStatus {
    Pass,
    Degraded,
    Fail {
        /// `NEXUS_*` code the executor raises.
        code: String,
        /// `Recoverable` or `Critical`, per the gate's own policy.
        severity: Severity,
    },
}

impl GateStatus {
    #[must_use]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded)
    }

    #[must_use]
    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail { .. })
    }
}

/// An item destined for the human review queue.
///
/// Gates emit these without ids; the executor keys them deterministically
/// by pipeline, stage, and kind when persisting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub kind: String,
    pub stage: String,
    pub summary: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// Full result of one gate evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    pub stage: String,
    pub status: GateStatus,
    pub warnings: Vec<String>,
    /// Human-readable reason attached to degraded/failed verdicts.
    pub reason: Option<String>,
    /// Flags merged into `QualityContext.flags` (e.g. `word-count-low`).
    pub flags: Vec<String>,
    pub review_items: Vec<ReviewItem>,
}

impl QualityReport {
    #[must_use]
    pub fn pass(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            status: GateStatus::Pass,
            warnings: Vec::new(),
            reason: None,
            flags: Vec::new(),
            review_items: Vec::new(),
        }
    }

    #[must_use]
    pub fn degraded(stage: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            stage: stage.to_string(),
            status: GateStatus::Degraded,
            warnings: vec![reason.clone()],
            reason: Some(reason),
            flags: Vec::new(),
            review_items: Vec::new(),
        }
    }

    #[must_use]
    pub fn fail(
        stage: &str,
        code: impl Into<String>,
        severity: Severity,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.to_string(),
            status: GateStatus::Fail {
                code: code.into(),
                severity,
            },
            warnings: Vec::new(),
            reason: Some(reason.into()),
            flags: Vec::new(),
            review_items: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    #[must_use]
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    #[must_use]
    pub fn with_review_item(mut self, item: ReviewItem) -> Self {
        self.review_items.push(item);
        self
    }
}

// ── Gate registry ──────────────────────────────────────────────────────

/// The named gates a stage can be wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateKind {
    ScriptGen,
    Tts,
    Render,
    Thumbnail,
    Pronunciation,
    AudioMix,
    Timestamps,
}

/// Run the named gate over a stage's metrics.
///
/// A stage wired to a gate but producing no metrics (or the wrong variant)
/// fails recoverably: the contract between body and gate was broken, which
/// is a stage bug, not a pipeline-ending event.
#[must_use]
pub fn evaluate_gate(
    kind: GateKind,
    stage: &str,
    metrics: Option<&QualityMetrics>,
    _ctx: &QualityContext,
) -> QualityReport {
    let Some(metrics) = metrics else {
        return QualityReport::fail(
            stage,
            "NEXUS_QUALITY_METRICS_MISSING",
            Severity::Recoverable,
            format!("stage produced no metrics for the {kind:?} gate"),
        );
    };
    match (kind, metrics) {
        (GateKind::ScriptGen, QualityMetrics::ScriptGen { word_count, excerpt }) => {
            gates::check_script_gen(stage, *word_count, excerpt)
        }
        (
            GateKind::Tts,
            QualityMetrics::Tts {
                silence_pct,
                clipping_detected,
                duration_secs,
            },
        ) => gates::check_tts(stage, *silence_pct, *clipping_detected, *duration_secs),
        (
            GateKind::Render,
            QualityMetrics::Render {
                frame_drops,
                audio_sync_ms,
            },
        ) => gates::check_render(stage, *frame_drops, *audio_sync_ms),
        (GateKind::Thumbnail, QualityMetrics::Thumbnail { variants }) => {
            gates::check_thumbnail(stage, *variants)
        }
        (
            GateKind::Pronunciation,
            QualityMetrics::Pronunciation {
                unknown_terms,
                accuracy_pct,
            },
        ) => gates::check_pronunciation(stage, *unknown_terms, *accuracy_pct),
        (GateKind::AudioMix, QualityMetrics::AudioMix { .. }) => {
            gates::check_audio_mix(stage, metrics)
        }
        (
            GateKind::Timestamps,
            QualityMetrics::Timestamps {
                segments,
                word_match_ratio,
                processing_secs,
            },
        ) => gates::check_timestamps(stage, segments, *word_match_ratio, *processing_secs),
        _ => {
            QualityReport::fail(
                stage,
                "NEXUS_QUALITY_METRICS_MISMATCH",
                Severity::Recoverable,
                format!("metrics variant does not match the {kind:?} gate"),
            )
        }
    }
}
