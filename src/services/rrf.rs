//! Reciprocal Rank Fusion (§4.D step 7).
//!
//! `score(x) = Σ 1/(k + rank_i(x) + 1)` summed across every ranking `x`
//! appears in; absent from a ranking contributes nothing. Rank-based, not
//! magnitude-based, so a max score of roughly `2/61` is expected and no
//! absolute-score threshold is meaningful (§4.D closing note).

use std::collections::HashMap;

use crate::models::EngramId;

/// The standard RRF damping constant (§4.D).
pub const K: f32 = 60.0;

/// Fuses any number of rank-ordered lists (best first) into a single
/// score per id.
#[must_use]
pub fn fuse(rankings: &[&[EngramId]]) -> HashMap<EngramId, f32> {
    let mut scores: HashMap<EngramId, f32> = HashMap::new();
    for ranking in rankings {
        for (rank, id) in ranking.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let contribution = 1.0 / (K + rank as f32 + 1.0);
            *scores.entry(*id).or_insert(0.0) += contribution;
        }
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[i64]) -> Vec<EngramId> {
        raw.iter().map(|&i| EngramId::new(i)).collect()
    }

    #[test]
    fn item_in_both_lists_outranks_item_in_one() {
        let lexical = ids(&[1, 2]);
        let dense = ids(&[2, 3]);
        let scores = fuse(&[&lexical, &dense]);

        let s1 = scores[&EngramId::new(1)];
        let s2 = scores[&EngramId::new(2)];
        let s3 = scores[&EngramId::new(3)];
        assert!(s2 > s1);
        assert!(s2 > s3);
    }

    #[test]
    fn empty_lists_yield_empty_scores() {
        let empty: Vec<EngramId> = vec![];
        let scores = fuse(&[&empty, &empty]);
        assert!(scores.is_empty());
    }

    #[test]
    fn absence_from_a_list_contributes_nothing() {
        let only_lexical = ids(&[5]);
        let empty: Vec<EngramId> = vec![];
        let scores = fuse(&[&only_lexical, &empty]);
        assert!((scores[&EngramId::new(5)] - 1.0 / 61.0).abs() < 1e-6);
    }
}
