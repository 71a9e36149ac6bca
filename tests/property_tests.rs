//! Property-based tests for the round-trip/idempotence properties named
//! in §8: category normalization and EMA clamping.

#![allow(clippy::unwrap_used)]

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use engrammar::models::{EngramId, TagRelevance, normalize_category};

fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(0, 0).unwrap()
}

/// Arbitrary category-ish strings: ASCII path segments joined with `/`
/// and occasional extra separators/whitespace, to exercise the
/// strip-and-collapse rule without just generating already-clean input.
fn category_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-zA-Z0-9_-]{1,8}", 1..5)
        .prop_map(|segments| segments.join("/"))
        .prop_flat_map(|clean| {
            prop::collection::vec(0usize..4, 0..3).prop_map(move |extra_slashes| {
                let mut s = clean.clone();
                for n in extra_slashes {
                    s = format!("{}{}{}", "/".repeat(n), s, "/".repeat(n));
                }
                s
            })
        })
}

proptest! {
    /// `normalize(normalize(c)) == normalize(c)` for any category string
    /// that normalizes successfully at all (§8 round-trip properties).
    #[test]
    fn normalize_category_is_idempotent(raw in category_strategy()) {
        if let Ok(once) = normalize_category(&raw) {
            let twice = normalize_category(&once).unwrap();
            prop_assert_eq!(once, twice);
        }
    }

    /// Normalization never introduces a leading/trailing slash or a
    /// doubled separator, regardless of how mangled the input was.
    #[test]
    fn normalize_category_collapses_separators(raw in category_strategy()) {
        if let Ok(normalized) = normalize_category(&raw) {
            prop_assert!(!normalized.starts_with('/'));
            prop_assert!(!normalized.ends_with('/'));
            prop_assert!(!normalized.contains("//"));
        }
    }

    /// The EMA is clamped to `[-1, 1]` after any sequence of folds with
    /// raw scores and weights drawn from a range wide enough to push it
    /// out of range if clamping were missing (§8 invariant 5).
    #[test]
    fn ema_stays_clamped_over_arbitrary_fold_sequences(
        folds in prop::collection::vec((-1.0f32..=1.0f32, 0.0f32..=3.0f32), 0..100)
    ) {
        let mut relevance = TagRelevance::new(EngramId::new(1), "frontend", epoch());
        for (raw, weight) in folds {
            relevance.fold(raw, weight, epoch());
            prop_assert!(relevance.ema >= -1.0 && relevance.ema <= 1.0);
        }
    }

    /// Evidence counters only ever increment, and only on a non-zero raw
    /// score; zero contributes to neither bucket.
    #[test]
    fn ema_evidence_counters_only_move_on_nonzero_raw(
        folds in prop::collection::vec((-1.0f32..=1.0f32, 0.1f32..=2.0f32), 0..50)
    ) {
        let mut relevance = TagRelevance::new(EngramId::new(1), "frontend", epoch());
        let mut expected_positive = 0u32;
        let mut expected_negative = 0u32;
        for (raw, weight) in folds {
            relevance.fold(raw, weight, epoch());
            if raw > 0.0 {
                expected_positive += 1;
            } else if raw < 0.0 {
                expected_negative += 1;
            }
        }
        prop_assert_eq!(relevance.positive_evals, expected_positive);
        prop_assert_eq!(relevance.negative_evals, expected_negative);
    }
}
