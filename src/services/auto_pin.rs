//! Auto-pin policy (component E).
//!
//! Watches the per-repo and per-tag-set match counters plus the
//! tag-relevance EMA and decides when an engram should be promoted to
//! "pinned" (always injected when its prerequisites match) or, for
//! engrams it promoted itself, demoted again once the signal sours.
//! Manually pinned engrams are never touched here.

use chrono::{DateTime, Utc};
use rusqlite::{Transaction, params};

use crate::models::{EngramId, Prerequisites};

/// Per-repo match count at which an engram is auto-pinned.
pub const T_REPO: i64 = 15;
/// Per-tag-set coverage threshold used by [`minimal_common_tag_subset`].
pub const T_TAG: u32 = 15;
/// EMA above which an unpinned engram is auto-pinned.
pub const PIN_THRESHOLD: f64 = 0.4;
/// EMA below which an auto-pinned engram is auto-unpinned.
pub const UNPIN_THRESHOLD: f64 = -0.2;
/// Minimum evidence (positive + negative evals) required for either decision.
pub const MIN_EVIDENCE_FOR_PIN: i64 = 5;

/// Size cap on the power-set search in [`minimal_common_tag_subset`]; the
/// universe of tags an engram has been matched under is rarely larger than
/// this, and the cap bounds the combinatorial search regardless.
const MAX_SUBSET_SIZE: usize = 4;

/// Computes the *minimal common tag subset* across a multiset of
/// `(tag_set, count)` rows, per §4.E.
///
/// Considers every subset of the tag universe up to size
/// `min(|universe|, 4)`. A subset is *qualifying* if the sum of counts
/// over rows that contain it reaches `threshold`. Among qualifying
/// subsets, a *minimal* one has no qualifying proper subset. Ties among
/// minimal subsets of the same smallest cardinality are broken by
/// lexicographic order on the sorted tag tuple.
#[must_use]
pub fn minimal_common_tag_subset(
    tag_sets: &[(Vec<String>, u32)],
    threshold: u32,
) -> Option<Vec<String>> {
    let mut universe: Vec<String> =
        tag_sets.iter().flat_map(|(tags, _)| tags.iter().cloned()).collect();
    universe.sort_unstable();
    universe.dedup();

    let max_size = universe.len().min(MAX_SUBSET_SIZE);
    let mut qualifying: Vec<Vec<String>> = Vec::new();

    for size in 1..=max_size {
        for candidate in combinations(&universe, size) {
            let coverage: u32 = tag_sets
                .iter()
                .filter(|(tags, _)| candidate.iter().all(|t| tags.contains(t)))
                .map(|(_, count)| *count)
                .sum();
            if coverage >= threshold {
                qualifying.push(candidate);
            }
        }
    }

    let minimal: Vec<&Vec<String>> = qualifying
        .iter()
        .filter(|candidate| {
            !qualifying
                .iter()
                .any(|other| other.len() < candidate.len() && other.iter().all(|t| candidate.contains(t)))
        })
        .collect();

    minimal.into_iter().min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b))).cloned()
}

/// Enumerates every `size`-element combination of `items`, in
/// lexicographic order (relies on `items` already being sorted).
fn combinations(items: &[String], size: usize) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    if size == 0 || size > items.len() {
        return out;
    }
    let mut current = Vec::with_capacity(size);
    combinations_from(items, size, 0, &mut current, &mut out);
    out
}

fn combinations_from(
    items: &[String],
    size: usize,
    start: usize,
    current: &mut Vec<String>,
    out: &mut Vec<Vec<String>>,
) {
    if current.len() == size {
        out.push(current.clone());
        return;
    }
    for i in start..items.len() {
        current.push(items[i].clone());
        combinations_from(items, size, i + 1, current, out);
        current.pop();
    }
}

/// Evaluates the EMA-driven pin/unpin decision for `id` within an
/// already-open transaction, after its tag-relevance rows have been
/// written. Averages EMA across every tag the engram participates in
/// (all of its `engram_tag_relevance` rows); this is the engram's own
/// evidence, not a query's requested tag set, so there is no
/// requested/matched denominator ambiguity here (c.f. the retriever's
/// gating in `services::retriever`, which does face that choice).
pub fn apply_ema_pin_decision(
    tx: &Transaction<'_>,
    id: EngramId,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let rows: Vec<(String, f64, i64, i64)> = {
        let mut stmt = tx.prepare(
            "SELECT tag, ema, positive_evals, negative_evals FROM engram_tag_relevance
             WHERE engram_id = ?1",
        )?;
        stmt.query_map(params![id.as_i64()], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?
        .collect::<rusqlite::Result<_>>()?
    };

    if rows.is_empty() {
        return Ok(());
    }

    let count = rows.len() as f64;
    let avg_ema = rows.iter().map(|(_, ema, ..)| ema).sum::<f64>() / count;
    let evidence: i64 = rows.iter().map(|(_, _, p, n)| p + n).sum();

    let pinned: i64 =
        tx.query_row("SELECT pinned FROM engrams WHERE id = ?1", params![id.as_i64()], |r| r.get(0))?;
    let prereq_raw: Option<String> = tx.query_row(
        "SELECT prerequisites FROM engrams WHERE id = ?1",
        params![id.as_i64()],
        |r| r.get(0),
    )?;
    let mut prereqs = Prerequisites::from_json_lenient(
        prereq_raw.as_deref().and_then(|s| serde_json::from_str(s).ok()).as_ref(),
    );

    if pinned == 0 {
        if avg_ema > PIN_THRESHOLD && evidence >= MIN_EVIDENCE_FOR_PIN {
            prereqs.auto_pinned = true;
            let has_characterising_prereq = prereqs.repos.as_ref().is_some_and(|r| !r.is_empty())
                || prereqs.tags.as_ref().is_some_and(|t| !t.is_empty());
            if !has_characterising_prereq {
                let mut tags: Vec<String> = rows.into_iter().map(|(tag, ..)| tag).collect();
                tags.sort_unstable();
                prereqs.tags = Some(tags);
            }
            let json = serde_json::to_string(&prereqs).unwrap_or_default();
            tx.execute(
                "UPDATE engrams SET pinned = 1, prerequisites = ?1, updated_at = ?2 WHERE id = ?3",
                params![json, now.to_rfc3339(), id.as_i64()],
            )?;
        }
        return Ok(());
    }

    if prereqs.auto_pinned && avg_ema < UNPIN_THRESHOLD && evidence >= MIN_EVIDENCE_FOR_PIN {
        tx.execute(
            "UPDATE engrams SET pinned = 0, updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), id.as_i64()],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sets(pairs: &[(&[&str], u32)]) -> Vec<(Vec<String>, u32)> {
        pairs
            .iter()
            .map(|(tags, count)| (tags.iter().map(|t| (*t).to_string()).collect(), *count))
            .collect()
    }

    #[test]
    fn smallest_common_subset_wins() {
        let rows = sets(&[
            (&["frontend", "react", "acme"], 6),
            (&["frontend", "vue", "acme"], 5),
            (&["frontend", "angular", "personal"], 4),
        ]);
        let subset = minimal_common_tag_subset(&rows, 15).unwrap();
        assert_eq!(subset, vec!["frontend".to_string()]);
    }

    #[test]
    fn below_threshold_returns_none() {
        let rows = sets(&[(&["frontend"], 10)]);
        assert!(minimal_common_tag_subset(&rows, 15).is_none());
    }

    #[test]
    fn ties_broken_lexicographically() {
        let rows = sets(&[(&["a", "b"], 20), (&["a", "c"], 20)]);
        let subset = minimal_common_tag_subset(&rows, 15).unwrap();
        assert_eq!(subset, vec!["a".to_string()]);
    }

    #[test]
    fn no_universe_returns_none() {
        assert!(minimal_common_tag_subset(&[], 15).is_none());
    }
}
