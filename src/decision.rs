//! Pre-publish decision engine.
//!
//! After the last stage, the accumulated [`QualityContext`] is reduced to a
//! three-valued routing verdict. Rules run in a fixed order and the first
//! match wins; downstream publish/notification collaborators consume the
//! persisted decision verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state::QualityContext;
use crate::store::{DocumentStore, DocumentStoreExt, StoreError, paths};

// ── Verdict ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishDecision {
    AutoPublish,
    AutoPublishWithWarning,
    HumanReview,
}

/// Decision plus its canonical reason string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub decision: PublishDecision,
    pub reason: String,
}

impl DecisionOutcome {
    fn new(decision: PublishDecision, reason: &str) -> Self {
        Self {
            decision,
            reason: reason.to_string(),
        }
    }
}

// ── Rules ──────────────────────────────────────────────────────────────

fn has_fallback_for(ctx: &QualityContext, stage_prefix: &str) -> bool {
    ctx.fallback_stages().any(|s| s.starts_with(stage_prefix))
}

/// Evaluate the ordered rule table over the final quality context.
#[must_use]
pub fn decide(ctx: &QualityContext) -> DecisionOutcome {
    // 1. Any TTS fallback means the published voice differs from the
    //    primary; a human signs off.
    if has_fallback_for(ctx, "tts") {
        return DecisionOutcome::new(PublishDecision::HumanReview, "TTS fallback used");
    }

    // 2. Script length escaped the acceptable band.
    if ctx.flags.contains("word-count-low") || ctx.flags.contains("word-count-high") {
        return DecisionOutcome::new(
            PublishDecision::HumanReview,
            "Word count outside acceptable range",
        );
    }

    // 3. Thumbnail and visual generation both fell back.
    if has_fallback_for(ctx, "thumbnail") && has_fallback_for(ctx, "visual") {
        return DecisionOutcome::new(
            PublishDecision::HumanReview,
            "Both thumbnail and visual fallbacks used",
        );
    }

    // 4. Pile-ups of independent concerns.
    let degraded = ctx.degraded_stages.len();
    let fallbacks = ctx.fallbacks_used.len();
    if degraded >= 3 || (degraded >= 1 && fallbacks >= 2) {
        return DecisionOutcome::new(PublishDecision::HumanReview, "Multiple quality concerns");
    }

    // 5. Anything noted at all warrants the warning label.
    if !ctx.is_clean() {
        return DecisionOutcome::new(
            PublishDecision::AutoPublishWithWarning,
            "Minor quality issues",
        );
    }

    // 6. Clean run.
    DecisionOutcome::new(PublishDecision::AutoPublish, "No quality issues")
}

// ── Persistence ────────────────────────────────────────────────────────

/// The `pipelines/{id}/quality` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDecision {
    pub pipeline_id: String,
    pub decision: PublishDecision,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
    pub quality_context: QualityContext,
}

/// Persist the verdict; HUMAN_REVIEW additionally lands a review-queue
/// item so operators see it without scanning pipelines.
pub async fn persist_decision(
    store: &dyn DocumentStore,
    pipeline_id: &str,
    outcome: &DecisionOutcome,
    ctx: &QualityContext,
    now: DateTime<Utc>,
) -> Result<PersistedDecision, StoreError> {
    let persisted = PersistedDecision {
        pipeline_id: pipeline_id.to_string(),
        decision: outcome.decision,
        reason: outcome.reason.clone(),
        decided_at: now,
        quality_context: ctx.clone(),
    };
    let path = paths::pipeline_quality(pipeline_id);
    store.set_doc(path.collection, &path.id, &persisted).await?;

    if outcome.decision == PublishDecision::HumanReview {
        let review_path = paths::review_item(&format!("{pipeline_id}-publish-decision"));
        store
            .set_doc(review_path.collection, &review_path.id, &persisted)
            .await?;
    }
    info!(
        pipeline = pipeline_id,
        decision = ?outcome.decision,
        reason = %outcome.reason,
        "pre-publish decision recorded"
    );
    Ok(persisted)
}

// ── Tests ──────────────────────────────────────────────────────────────
