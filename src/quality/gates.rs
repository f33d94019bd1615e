//! The seven concrete gate checks.
//!
//! Pure functions over stage metrics. Thresholds are the canonical
//! production constants; tests pin every boundary.

use serde_json::json;

use super::{QualityMetrics, QualityReport, ReviewItem, WordSegment};
use crate::errors::Severity;

// ── Thresholds ─────────────────────────────────────────────────────────

pub const WORD_COUNT_MIN: u32 = 1200;
pub const WORD_COUNT_MAX: u32 = 1800;
pub const MAX_SILENCE_PCT: f64 = 5.0;
pub const MAX_AUDIO_SYNC_MS: u32 = 100;
pub const THUMBNAIL_VARIANTS: u32 = 3;
/// Unknown-term budget; flagging is strictly greater-than.
pub const MAX_UNKNOWN_TERMS: u32 = 3;
pub const MIN_PRONUNCIATION_ACCURACY_PCT: f64 = 98.0;
pub const MIX_DURATION_TOLERANCE: f64 = 0.01;
pub const MAX_PEAK_DB: f64 = -0.5;
pub const VOICE_PEAK_MIN_DB: f64 = -9.0;
pub const VOICE_PEAK_MAX_DB: f64 = -3.0;
pub const MAX_MUSIC_PEAK_DB: f64 = -18.0;
pub const MIN_WORD_MATCH_RATIO: f64 = 0.9;
pub const MAX_WORD_GAP_SECS: f64 = 0.5;
pub const MAX_TIMESTAMP_PROCESSING_SECS: f64 = 60.0;

const EXCERPT_CHARS: usize = 280;

// ── Script generation ──────────────────────────────────────────────────

/// Word count must land in `[1200, 1800]`; outside fails recoverably and
/// queues the script excerpt for review.
#[must_use]
pub fn check_script_gen(stage: &str, word_count: u32, excerpt: &str) -> QualityReport {
    let flag = if word_count < WORD_COUNT_MIN {
        Some("word-count-low")
    } else if word_count > WORD_COUNT_MAX {
        Some("word-count-high")
    } else {
        None
    };
    let Some(flag) = flag else {
        return QualityReport::pass(stage);
    };

    let clipped: String = excerpt.chars().take(EXCERPT_CHARS).collect();
    QualityReport::fail(
        stage,
        "NEXUS_SCRIPT_WORD_COUNT",
        Severity::Recoverable,
        format!("word count {word_count} outside [{WORD_COUNT_MIN}, {WORD_COUNT_MAX}]"),
    )
    .with_flag(flag)
    .with_review_item(ReviewItem {
        kind: flag.to_string(),
        stage: stage.to_string(),
        summary: format!("script word count {word_count}"),
        detail: json!({ "word_count": word_count, "excerpt": clipped }),
    })
}

// ── TTS ────────────────────────────────────────────────────────────────

/// Silence share and clipping are quality degradations, not failures; the
/// duration is recorded as a warning-free metric.
#[must_use]
pub fn check_tts(
    stage: &str,
    silence_pct: f64,
    clipping_detected: bool,
    duration_secs: f64,
) -> QualityReport {
    let mut report = QualityReport::pass(stage);
    if silence_pct >= MAX_SILENCE_PCT {
        report = QualityReport::degraded(
            stage,
            format!("silence {silence_pct:.1}% at or above {MAX_SILENCE_PCT}%"),
        );
    }
    if clipping_detected {
        let warning = "clipping detected in synthesized audio";
        report = match report.status {
            super::GateStatus::Pass => QualityReport::degraded(stage, warning),
            _ => report.with_warning(warning),
        };
    }
    let _ = duration_secs;
    report
}

// ── Render ─────────────────────────────────────────────────────────────

#[must_use]
pub fn check_render(stage: &str, frame_drops: u32, audio_sync_ms: u32) -> QualityReport {
    let mut report = QualityReport::pass(stage);
    if frame_drops > 0 {
        report = QualityReport::degraded(stage, format!("{frame_drops} dropped frames"));
    }
    if audio_sync_ms >= MAX_AUDIO_SYNC_MS {
        let warning = format!("audio sync offset {audio_sync_ms}ms at or above {MAX_AUDIO_SYNC_MS}ms");
        report = match report.status {
            super::GateStatus::Pass => QualityReport::degraded(stage, warning),
            _ => report.with_warning(warning),
        };
    }
    report
}

// ── Thumbnail ──────────────────────────────────────────────────────────

/// Exactly three variants or the stage fails.
#[must_use]
pub fn check_thumbnail(stage: &str, variants: u32) -> QualityReport {
    if variants == THUMBNAIL_VARIANTS {
        QualityReport::pass(stage)
    } else {
        QualityReport::fail(
            stage,
            "NEXUS_THUMBNAIL_VARIANT_COUNT",
            Severity::Recoverable,
            format!("expected {THUMBNAIL_VARIANTS} thumbnail variants, got {variants}"),
        )
    }
}

// ── Pronunciation ──────────────────────────────────────────────────────

/// Accuracy below the floor fails; more than [`MAX_UNKNOWN_TERMS`] unknown
/// terms degrades and queues a review item.
#[must_use]
pub fn check_pronunciation(stage: &str, unknown_terms: u32, accuracy_pct: f64) -> QualityReport {
    if accuracy_pct <= MIN_PRONUNCIATION_ACCURACY_PCT {
        return QualityReport::fail(
            stage,
            "NEXUS_PRONUNCIATION_ACCURACY",
            Severity::Recoverable,
            format!("accuracy {accuracy_pct:.2}% not above {MIN_PRONUNCIATION_ACCURACY_PCT}%"),
        );
    }
    if unknown_terms > MAX_UNKNOWN_TERMS {
        return QualityReport::degraded(
            stage,
            format!("{unknown_terms} unknown terms exceed budget of {MAX_UNKNOWN_TERMS}"),
        )
        .with_review_item(ReviewItem {
            kind: "unknown-terms".to_string(),
            stage: stage.to_string(),
            summary: format!("{unknown_terms} terms missing pronunciation entries"),
            detail: json!({ "unknown_terms": unknown_terms }),
        });
    }
    QualityReport::pass(stage)
}

// ── Audio mix ──────────────────────────────────────────────────────────

/// Duration drift beyond 1% of target is critical; level violations
/// degrade.
#[must_use]
pub fn check_audio_mix(stage: &str, metrics: &QualityMetrics) -> QualityReport {
    let QualityMetrics::AudioMix {
        duration_secs,
        target_duration_secs,
        peak_db,
        voice_peak_db,
        music_peak_db,
        ducking_applied,
    } = metrics
    else {
        return QualityReport::fail(
            stage,
            "NEXUS_QUALITY_METRICS_MISMATCH",
            Severity::Recoverable,
            "audio-mix gate called without audio-mix metrics",
        );
    };

    let drift = (duration_secs - target_duration_secs).abs();
    if drift > target_duration_secs * MIX_DURATION_TOLERANCE {
        return QualityReport::fail(
            stage,
            "NEXUS_AUDIO_DURATION_DRIFT",
            Severity::Critical,
            format!(
                "mix duration {duration_secs:.2}s off target {target_duration_secs:.2}s by more than 1%"
            ),
        );
    }

    let mut warnings = Vec::new();
    if *peak_db >= MAX_PEAK_DB {
        warnings.push(format!("master peak {peak_db:.1} dB at or above {MAX_PEAK_DB} dB"));
    }
    if *voice_peak_db < VOICE_PEAK_MIN_DB || *voice_peak_db > VOICE_PEAK_MAX_DB {
        warnings.push(format!(
            "voice peak {voice_peak_db:.1} dB outside [{VOICE_PEAK_MIN_DB}, {VOICE_PEAK_MAX_DB}] dB"
        ));
    }
    if *ducking_applied
        && let Some(music) = music_peak_db
        && *music >= MAX_MUSIC_PEAK_DB
    {
        warnings.push(format!(
            "ducked music peak {music:.1} dB at or above {MAX_MUSIC_PEAK_DB} dB"
        ));
    }

    if warnings.is_empty() {
        QualityReport::pass(stage)
    } else {
        let mut report = QualityReport::degraded(stage, warnings[0].clone());
        for w in &warnings[1..] {
            report = report.with_warning(w.clone());
        }
        report
    }
}

// ── Timestamp extraction ───────────────────────────────────────────────

/// Any overlap between consecutive words in a segment is critical; wide
/// gaps, weak match ratio, or slow processing degrade.
#[must_use]
pub fn check_timestamps(
    stage: &str,
    segments: &[WordSegment],
    word_match_ratio: f64,
    processing_secs: f64,
) -> QualityReport {
    for (seg_idx, segment) in segments.iter().enumerate() {
        for pair in segment.words.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.start_secs < prev.end_secs {
                return QualityReport::fail(
                    stage,
                    "NEXUS_TIMESTAMPS_NON_MONOTONIC",
                    Severity::Critical,
                    format!(
                        "segment {seg_idx}: '{}' starts at {:.3}s before '{}' ends at {:.3}s",
                        next.word, next.start_secs, prev.word, prev.end_secs
                    ),
                );
            }
        }
    }

    let mut warnings = Vec::new();
    for (seg_idx, segment) in segments.iter().enumerate() {
        for pair in segment.words.windows(2) {
            let gap = pair[1].start_secs - pair[0].end_secs;
            if gap > MAX_WORD_GAP_SECS {
                warnings.push(format!(
                    "segment {seg_idx}: {:.0}ms gap after '{}'",
                    gap * 1000.0,
                    pair[0].word
                ));
            }
        }
    }
    if word_match_ratio < MIN_WORD_MATCH_RATIO {
        warnings.push(format!(
            "word match ratio {word_match_ratio:.2} below {MIN_WORD_MATCH_RATIO}"
        ));
    }
    if processing_secs >= MAX_TIMESTAMP_PROCESSING_SECS {
        warnings.push(format!(
            "timestamp extraction took {processing_secs:.0}s"
        ));
    }

    if warnings.is_empty() {
        QualityReport::pass(stage)
    } else {
        let mut report = QualityReport::degraded(stage, warnings[0].clone());
        for w in &warnings[1..] {
            report = report.with_warning(w.clone());
        }
        report
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
