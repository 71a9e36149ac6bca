//! Per-(engram, tag) exponential moving average of outcome scores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EngramId;

/// Smoothing factor for the EMA fold, per §4.F.
pub const ALPHA: f32 = 0.3;

/// `(engram, tag) -> (ema, positive_evals, negative_evals, last_updated)`.
/// `ema` is clamped to `[-1, 1]`; evidence counters increment only on
/// non-zero raw scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRelevance {
    /// The engram this relevance score is about.
    pub engram_id: EngramId,
    /// The environment tag this relevance score is about.
    pub tag: String,
    /// Clamped exponential moving average in `[-1, 1]`.
    pub ema: f32,
    /// Count of folds where the raw score was strictly positive.
    pub positive_evals: u32,
    /// Count of folds where the raw score was strictly negative.
    pub negative_evals: u32,
    /// Timestamp of the last fold.
    pub last_updated: DateTime<Utc>,
}

impl TagRelevance {
    /// Creates a fresh row with `ema = 0` before any evidence is folded in.
    #[must_use]
    pub fn new(engram_id: EngramId, tag: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            engram_id,
            tag: tag.into(),
            ema: 0.0,
            positive_evals: 0,
            negative_evals: 0,
            last_updated: now,
        }
    }

    /// Total evidence: positive plus negative evaluation counts.
    #[must_use]
    pub const fn evidence(&self) -> u32 {
        self.positive_evals + self.negative_evals
    }

    /// Folds a new raw score into the EMA: `new = clamp(old*(1-a) +
    /// raw*a*weight, -1, 1)`. Evidence counters increment on `raw != 0`;
    /// `raw == 0` leaves them unchanged.
    pub fn fold(&mut self, raw: f32, weight: f32, now: DateTime<Utc>) {
        let raw = raw.clamp(-1.0, 1.0);
        self.ema = (self.ema.mul_add(1.0 - ALPHA, raw * ALPHA * weight)).clamp(-1.0, 1.0);

        if raw > 0.0 {
            self.positive_evals += 1;
        } else if raw < 0.0 {
            self.negative_evals += 1;
        }

        self.last_updated = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).unwrap()
    }

    #[test]
    fn first_fold_starts_from_zero() {
        let mut r = TagRelevance::new(EngramId::new(1), "frontend", now());
        r.fold(1.0, 1.0, now());
        assert!((r.ema - 0.3).abs() < 1e-6);
        assert_eq!(r.positive_evals, 1);
        assert_eq!(r.negative_evals, 0);
    }

    #[test]
    fn ema_stays_clamped_over_many_folds() {
        let mut r = TagRelevance::new(EngramId::new(1), "frontend", now());
        for _ in 0..50 {
            r.fold(1.0, 2.0, now());
            assert!(r.ema <= 1.0 && r.ema >= -1.0);
        }
        for _ in 0..50 {
            r.fold(-1.0, 2.0, now());
            assert!(r.ema <= 1.0 && r.ema >= -1.0);
        }
    }

    #[test]
    fn zero_raw_leaves_evidence_unchanged() {
        let mut r = TagRelevance::new(EngramId::new(1), "frontend", now());
        r.fold(0.0, 1.0, now());
        assert_eq!(r.evidence(), 0);
    }
}
