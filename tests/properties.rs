//! Property tests for the arithmetic and decision invariants.

use std::collections::BTreeSet;
use std::time::Duration;

use proptest::prelude::*;

use nexus_orchestrator::cost::Usd;
use nexus_orchestrator::decision::{PublishDecision, decide};
use nexus_orchestrator::retry::RetryPolicy;
use nexus_orchestrator::state::QualityContext;

fn context(
    degraded: BTreeSet<String>,
    fallbacks: BTreeSet<String>,
    flags: BTreeSet<String>,
) -> QualityContext {
    let mut ctx = QualityContext::new();
    for stage in degraded {
        ctx.mark_degraded(&stage);
    }
    for entry in fallbacks {
        let (stage, provider) = entry.split_once(':').unwrap_or((entry.as_str(), "alt"));
        ctx.record_fallback(stage, provider);
    }
    for flag in flags {
        ctx.add_flag(&flag);
    }
    ctx
}

proptest! {
    /// Invariant 7: the retry engine's total sleep budget is exactly the
    /// sum of capped per-attempt delays.
    #[test]
    fn retry_delay_budget_matches_closed_form(
        max_retries in 0u32..10,
        base_ms in 1u64..5_000,
        max_ms in 1u64..60_000,
    ) {
        let policy = RetryPolicy::new(max_retries)
            .with_delays(Duration::from_millis(base_ms), Duration::from_millis(max_ms));
        let expected: Duration = (0..policy.effective_attempts().saturating_sub(1))
            .map(|i| {
                let exp = i.min(31);
                Duration::from_millis(base_ms)
                    .saturating_mul(2u32.saturating_pow(exp))
                    .min(Duration::from_millis(max_ms))
            })
            .sum();
        prop_assert_eq!(policy.max_total_delay(), expected);

        // Every individual delay respects the cap.
        for attempt in 1..=policy.effective_attempts() {
            prop_assert!(policy.delay_after(attempt) <= Duration::from_millis(max_ms));
        }
    }

    /// Invariant 1 in miniature: micro-dollar sums are exact for any
    /// sequence of 4-decimal amounts.
    #[test]
    fn usd_sum_is_order_independent_and_exact(
        amounts in prop::collection::vec(0u32..1_000_000, 0..50),
    ) {
        let forward: Usd = amounts
            .iter()
            .map(|tenths_of_millis| Usd::from_dollars(f64::from(*tenths_of_millis) / 10_000.0))
            .sum();
        let backward: Usd = amounts
            .iter()
            .rev()
            .map(|tenths_of_millis| Usd::from_dollars(f64::from(*tenths_of_millis) / 10_000.0))
            .sum();
        prop_assert_eq!(forward, backward);

        let expected_micros: i64 = amounts.iter().map(|a| i64::from(*a) * 100).sum();
        prop_assert_eq!(forward.micros(), expected_micros);
    }

    /// Merging never loses anything: the quality context only grows.
    #[test]
    fn quality_context_merge_is_monotone(
        degraded_a in prop::collection::btree_set("[a-z]{3,8}", 0..4),
        degraded_b in prop::collection::btree_set("[a-z]{3,8}", 0..4),
        flags_a in prop::collection::btree_set("[a-z-]{3,12}", 0..4),
        flags_b in prop::collection::btree_set("[a-z-]{3,12}", 0..4),
    ) {
        let a = context(degraded_a.clone(), BTreeSet::new(), flags_a.clone());
        let b = context(degraded_b.clone(), BTreeSet::new(), flags_b.clone());
        let mut merged = a.clone();
        merged.merge(&b);

        for stage in a.degraded_stages.iter().chain(b.degraded_stages.iter()) {
            prop_assert!(merged.degraded_stages.contains(stage));
        }
        for flag in a.flags.iter().chain(b.flags.iter()) {
            prop_assert!(merged.flags.contains(flag));
        }
        // Idempotent: merging again changes nothing.
        let again = {
            let mut m = merged.clone();
            m.merge(&b);
            m
        };
        prop_assert_eq!(again, merged);
    }

    /// A TTS fallback always routes to a human, whatever else happened.
    #[test]
    fn tts_fallback_dominates_decision(
        degraded in prop::collection::btree_set("[a-z]{3,8}", 0..5),
        flags in prop::collection::btree_set("[a-z-]{3,12}", 0..5),
        provider in "[a-z0-9-]{2,12}",
    ) {
        let mut ctx = context(degraded, BTreeSet::new(), flags);
        ctx.record_fallback("tts", &provider);
        let outcome = decide(&ctx);
        prop_assert_eq!(outcome.decision, PublishDecision::HumanReview);
        prop_assert_eq!(outcome.reason, "TTS fallback used");
    }

    /// The decision engine is total and AUTO_PUBLISH appears only for
    /// clean contexts.
    #[test]
    fn auto_publish_implies_clean_context(
        degraded in prop::collection::btree_set("[a-z]{3,8}", 0..5),
        fallbacks in prop::collection::btree_set("[a-z]{3,8}:[a-z0-9-]{2,8}", 0..5),
        flags in prop::collection::btree_set("[a-z-]{3,12}", 0..5),
    ) {
        let ctx = context(degraded, fallbacks, flags);
        let outcome = decide(&ctx);
        if outcome.decision == PublishDecision::AutoPublish {
            prop_assert!(ctx.is_clean());
        }
    }
}
