//! The dedup engine (component G, §4.G).
//!
//! Multi-pass LLM-assisted merge pipeline: find near-duplicate
//! candidates by cosine similarity, batch them under a character
//! budget, ask the external scorer to propose merge groups, validate
//! its accounting strictly, and execute merges deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::llm::{ExternalLlm, extract_json_from_response};
use crate::models::{Engram, EngramId};
use crate::embedding::Embedder;
use crate::storage::{EngramStore, VectorIndex};

/// Below this many verified engrams, a pass runs in bootstrap mode
/// (global candidate search, no verified/unverified split) rather than
/// incremental mode.
const BOOTSTRAP_VERIFIED_THRESHOLD: usize = 3;

/// §4.G: a group's `reason` is truncated to at most this many characters.
const MAX_REASON_CHARS: usize = 200;

/// Truncates `reason` to [`MAX_REASON_CHARS`] at a char boundary.
fn truncate_reason(reason: &str) -> String {
    match reason.char_indices().nth(MAX_REASON_CHARS) {
        Some((byte_idx, _)) => reason[..byte_idx].to_string(),
        None => reason.to_string(),
    }
}

/// Tuning knobs for a dedup run, mirroring §4.G's defaults.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Minimum cosine similarity for a pair to be considered a candidate.
    pub min_similarity: f32,
    /// Candidates kept per engram.
    pub max_candidates: usize,
    /// Approximate character budget per LLM batch.
    pub char_budget: usize,
    /// Confidence hint passed to the scorer (not itself a hard filter).
    pub min_confidence: f32,
    /// Upper bound on passes within one `run` call.
    pub max_passes: u32,
    /// Cap on unverified engrams considered in one pass.
    pub limit: Option<usize>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { min_similarity: 0.50, max_candidates: 8, char_budget: 6000, min_confidence: 0.8, max_passes: 10, limit: None }
    }
}

/// Outcome of a `run` call, aggregated across every pass.
#[derive(Debug, Clone, Default)]
pub struct DedupSummary {
    /// Unverified engrams considered across all passes.
    pub processed: usize,
    /// Groups merged.
    pub merged: usize,
    /// Engrams marked `dedup_verified` without being merged.
    pub verified: usize,
    /// Unverified engrams whose batch failed (LLM error or no valid groups).
    pub failed: usize,
    /// Number of passes actually run.
    pub passes: u32,
}

/// One candidate edge considered by a batch, mirroring the payload
/// sent to the scorer.
#[derive(Debug, Clone, Serialize)]
struct CandidateEdge {
    source_id: i64,
    target_id: i64,
    similarity: f32,
}

/// One engram as serialized into the scorer's request payload.
#[derive(Debug, Clone, Serialize)]
struct EngramPayload {
    id: i64,
    status: &'static str,
    text: String,
    category: String,
    prerequisites: serde_json::Value,
    occurrence_count: u32,
}

/// One batch of engrams sent to the scorer in a single call.
#[derive(Debug, Clone)]
struct Batch {
    engrams: Vec<EngramPayload>,
    edges: Vec<CandidateEdge>,
    unverified_ids: HashSet<EngramId>,
}

/// One proposed merge group from the scorer.
#[derive(Debug, Clone, Deserialize)]
struct DedupGroup {
    ids: Vec<i64>,
    canonical_text: String,
    confidence: f32,
    #[serde(default)]
    reason: String,
}

/// The scorer's full response for one batch.
#[derive(Debug, Clone, Deserialize, Default)]
struct DedupResponse {
    #[serde(default)]
    groups: Vec<DedupGroup>,
    #[serde(default)]
    no_match_ids: Vec<i64>,
}

/// Which accounting rules a batch's response is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Bootstrap,
    Incremental,
}

/// Runs LLM-assisted merge passes over the unverified engram pool.
pub struct DedupEngine {
    store: Arc<dyn EngramStore>,
    embedder: Arc<dyn Embedder>,
    llm: ExternalLlm,
    vector_index: Option<Arc<dyn VectorIndex>>,
}

impl DedupEngine {
    /// Creates a dedup engine over `store`, embedding candidates with
    /// `embedder` and scoring merge proposals with `llm`. `vector_index`,
    /// when given, is rebuilt once after a run that merged anything
    /// (§4.G step 9: "rebuild the vector index ... after" merges commit)
    /// so the retriever's dense ranking stops offering deprecated or
    /// stale-text rows. `None` is for tests that only care about the
    /// merge accounting itself.
    #[must_use]
    pub fn new(
        store: Arc<dyn EngramStore>,
        embedder: Arc<dyn Embedder>,
        llm: ExternalLlm,
        vector_index: Option<Arc<dyn VectorIndex>>,
    ) -> Self {
        Self { store, embedder, llm, vector_index }
    }

    /// Runs up to `config.max_passes` dedup passes, stopping early once
    /// a pass merges nothing (§4.G "multi-pass convergence").
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub async fn run(&self, config: &DedupConfig) -> Result<DedupSummary> {
        let mut summary = DedupSummary::default();

        for pass_num in 1..=config.max_passes {
            summary.passes = pass_num;
            let pass = self.run_pass(config).await?;
            summary.processed += pass.processed;
            summary.merged += pass.merged;
            summary.verified += pass.verified;
            summary.failed += pass.failed;

            if pass.merged == 0 {
                break;
            }
        }

        if summary.merged > 0 {
            self.rebuild_index()?;
        }

        Ok(summary)
    }

    /// Rebuilds the dense vector index from the post-merge active pool:
    /// survivors carry their canonical text, absorbed rows are
    /// deprecated and so excluded by `list_active`.
    fn rebuild_index(&self) -> Result<()> {
        let Some(vector_index) = &self.vector_index else { return Ok(()) };
        let active = self.store.list_active()?;
        if active.is_empty() {
            return vector_index.build(&[]);
        }
        let texts: Vec<&str> = active.iter().map(|e| e.text.as_str()).collect();
        let embeddings = self.embedder.embed_batch(&texts)?;
        let items: Vec<(EngramId, Vec<f32>)> = active.iter().map(|e| e.id).zip(embeddings).collect();
        vector_index.build(&items)
    }

    async fn run_pass(&self, config: &DedupConfig) -> Result<DedupSummary> {
        let mut result = DedupSummary { passes: 1, ..DedupSummary::default() };

        let verified = self.store.list_verified()?;
        let bootstrap = verified.len() < BOOTSTRAP_VERIFIED_THRESHOLD;
        let mode = if bootstrap { Mode::Bootstrap } else { Mode::Incremental };

        let unverified = self.store.list_unverified(config.limit)?;
        if unverified.is_empty() {
            return Ok(result);
        }

        let (pool, unverified_ids): (Vec<Engram>, HashSet<EngramId>) = if bootstrap {
            let mut seen: HashSet<EngramId> = unverified.iter().map(|e| e.id).collect();
            let mut pool = unverified.clone();
            for v in &verified {
                if seen.insert(v.id) {
                    pool.push(v.clone());
                }
            }
            let ids = pool.iter().map(|e| e.id).collect();
            (pool, ids)
        } else {
            let mut pool = unverified.clone();
            pool.extend(verified.iter().cloned());
            let ids = unverified.iter().map(|e| e.id).collect();
            (pool, ids)
        };

        let engrams_by_id: HashMap<EngramId, Engram> = pool.iter().cloned().map(|e| (e.id, e)).collect();

        let candidate_map = self.find_candidates(&pool, &unverified_ids, mode, config)?;

        let mut with_candidates: HashMap<EngramId, Vec<(EngramId, f32)>> = HashMap::new();
        for (id, candidates) in candidate_map {
            if candidates.is_empty() {
                if mode == Mode::Incremental {
                    self.store.mark_verified(id)?;
                    result.verified += 1;
                }
            } else {
                with_candidates.insert(id, candidates);
            }
        }

        if with_candidates.is_empty() {
            result.processed = unverified.len();
            return Ok(result);
        }

        let batches = build_batches(&with_candidates, &engrams_by_id, &unverified_ids, config.char_budget);
        let run_id = format!("run-{}-pass1", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"));

        for batch in &batches {
            result.processed += batch.unverified_ids.len();

            let prompt = build_prompt(batch, mode, config.min_confidence);
            let response = match self.llm.complete(&prompt).await {
                Ok(raw) => parse_response(&raw),
                Err(_) => None,
            };

            let Some(response) = response else {
                for id in &batch.unverified_ids {
                    let _ = self.store.record_dedup_error(*id, "dedup LLM call failed");
                }
                result.failed += batch.unverified_ids.len();
                continue;
            };

            // Validation (§4.G) is per-group and per-id: a group that
            // fails accounting is dropped, but that does not disqualify
            // an unrelated, validly-accounted `no_match_ids` entry in the
            // same response (S5) — so groups merge and no-match ids are
            // marked verified independently of whether the batch as a
            // whole later turns out to have unaccounted ids.
            let (valid_groups, errors) = validate_response(&response, batch, mode);

            let mut merged_unverified: HashSet<EngramId> = HashSet::new();
            let mut merge_failed: HashSet<EngramId> = HashSet::new();
            let now = Utc::now();
            for group in &valid_groups {
                let mut ids: Vec<EngramId> = group.ids.iter().map(|&id| EngramId::new(id)).collect();
                ids.sort_unstable();

                let survivor = select_survivor(&ids, &engrams_by_id);
                let absorbed: Vec<EngramId> = ids.iter().copied().filter(|id| *id != survivor).collect();

                match self.store.merge_group(
                    survivor,
                    &absorbed,
                    &group.canonical_text,
                    &run_id,
                    group.confidence,
                    &group.reason,
                    now,
                ) {
                    Ok(()) => {
                        result.merged += 1;
                        for id in &ids {
                            if unverified_ids.contains(id) {
                                merged_unverified.insert(*id);
                            }
                        }
                    }
                    Err(_) => {
                        result.failed += 1;
                        for id in &ids {
                            if unverified_ids.contains(id) {
                                merge_failed.insert(*id);
                            }
                        }
                    }
                }
            }

            let no_match: HashSet<EngramId> = response.no_match_ids.iter().map(|&id| EngramId::new(id)).collect();
            for id in &batch.unverified_ids {
                if no_match.contains(id) && !merged_unverified.contains(id) && !merge_failed.contains(id) {
                    self.store.mark_verified(*id)?;
                    result.verified += 1;
                }
            }

            // Anything left over — neither merged, nor a merge failure
            // already counted above, nor a validly-accounted no-match —
            // is unaccounted for this batch and gets a dedup error.
            let unaccounted: Vec<EngramId> = batch
                .unverified_ids
                .iter()
                .copied()
                .filter(|id| {
                    !merged_unverified.contains(id) && !merge_failed.contains(id) && !no_match.contains(id)
                })
                .collect();

            if !unaccounted.is_empty() {
                let reason = if errors.is_empty() {
                    "dedup validation failed: unverified id not accounted for".to_string()
                } else {
                    format!("dedup validation failed: {}", errors.join("; "))
                };
                for id in &unaccounted {
                    let _ = self.store.record_dedup_error(*id, &reason);
                }
                result.failed += unaccounted.len();
            }
        }

        Ok(result)
    }

    /// Builds the candidate map for `pool` under `mode`: for incremental
    /// mode, each unverified engram is compared only against the
    /// verified pool; for bootstrap mode, every pair in `pool` is
    /// compared against every other.
    fn find_candidates(
        &self,
        pool: &[Engram],
        unverified_ids: &HashSet<EngramId>,
        mode: Mode,
        config: &DedupConfig,
    ) -> Result<HashMap<EngramId, Vec<(EngramId, f32)>>> {
        if pool.len() < 2 {
            return Ok(HashMap::new());
        }

        let texts: Vec<&str> = pool.iter().map(|e| e.text.as_str()).collect();
        let embeddings = self.embedder.embed_batch(&texts)?;
        let normalized: Vec<Vec<f32>> = embeddings.iter().map(|v| normalize(v)).collect();

        let mut candidate_map = HashMap::new();

        for (i, engram) in pool.iter().enumerate() {
            if mode == Mode::Incremental && !unverified_ids.contains(&engram.id) {
                continue;
            }

            let mut scored: Vec<(EngramId, f32)> = Vec::new();
            for (j, other) in pool.iter().enumerate() {
                if i == j {
                    continue;
                }
                if mode == Mode::Incremental && unverified_ids.contains(&other.id) {
                    continue;
                }
                let sim = dot(&normalized[i], &normalized[j]);
                if sim >= config.min_similarity {
                    scored.push((other.id, sim));
                }
            }

            scored.sort_by(|a, b| b.1.total_cmp(&a.1));
            scored.truncate(config.max_candidates);
            candidate_map.insert(engram.id, scored);
        }

        Ok(candidate_map)
    }
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-10);
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Packs engrams with candidates into batches under `char_budget`,
/// mirroring the greedy bin-packing rule: flush the current batch
/// before it would exceed budget, never split a single unverified
/// engram and its candidates across batches.
fn build_batches(
    with_candidates: &HashMap<EngramId, Vec<(EngramId, f32)>>,
    engrams_by_id: &HashMap<EngramId, Engram>,
    unverified_ids: &HashSet<EngramId>,
    char_budget: usize,
) -> Vec<Batch> {
    let mut sorted_unverified: Vec<EngramId> =
        with_candidates.keys().filter(|id| unverified_ids.contains(*id)).copied().collect();
    sorted_unverified.sort_unstable();

    let mut batches = Vec::new();
    let mut current: HashMap<EngramId, EngramPayload> = HashMap::new();
    let mut current_edges = Vec::new();
    let mut current_unverified: HashSet<EngramId> = HashSet::new();
    let mut current_chars = 0usize;

    for uid in sorted_unverified {
        let candidates = &with_candidates[&uid];
        let Some(engram) = engrams_by_id.get(&uid) else { continue };

        let mut new_chars = if current.contains_key(&uid) { 0 } else { engram.text.len() };
        for (cid, _) in candidates {
            if !current.contains_key(cid) {
                if let Some(c) = engrams_by_id.get(cid) {
                    new_chars += c.text.len();
                }
            }
        }

        if current_chars + new_chars > char_budget && !current_unverified.is_empty() {
            batches.push(Batch {
                engrams: current.values().cloned().collect(),
                edges: std::mem::take(&mut current_edges),
                unverified_ids: std::mem::take(&mut current_unverified),
            });
            current = HashMap::new();
            current_chars = 0;
        }

        if let std::collections::hash_map::Entry::Vacant(entry) = current.entry(uid) {
            entry.insert(to_payload(engram, unverified_ids.contains(&uid)));
            current_chars += engram.text.len();
        }
        current_unverified.insert(uid);

        for (cid, sim) in candidates {
            if let std::collections::hash_map::Entry::Vacant(entry) = current.entry(*cid) {
                if let Some(c) = engrams_by_id.get(cid) {
                    entry.insert(to_payload(c, unverified_ids.contains(cid)));
                    current_chars += c.text.len();
                }
            }
            current_edges.push(CandidateEdge { source_id: uid.as_i64(), target_id: cid.as_i64(), similarity: *sim });
        }
    }

    if !current_unverified.is_empty() {
        batches.push(Batch { engrams: current.values().cloned().collect(), edges: current_edges, unverified_ids: current_unverified });
    }

    batches
}

fn to_payload(engram: &Engram, is_unverified: bool) -> EngramPayload {
    EngramPayload {
        id: engram.id.as_i64(),
        status: if is_unverified { "unverified" } else { "verified" },
        text: engram.text.clone(),
        category: engram.category.clone(),
        prerequisites: serde_json::to_value(&engram.prerequisites).unwrap_or(serde_json::Value::Null),
        occurrence_count: engram.occurrence_count,
    }
}

fn build_prompt(batch: &Batch, mode: Mode, min_confidence: f32) -> String {
    let mode_rules = match mode {
        Mode::Bootstrap => {
            "You are in BOOTSTRAP mode. There is no stable verified pool yet. Use the \
             candidate edges to reason globally. Every input ID must appear exactly once: \
             either in one group or in no_match_ids."
        }
        Mode::Incremental => {
            "You are in INCREMENTAL mode. Decide, for each unverified engram, whether it \
             duplicates a verified candidate. A verified engram may bridge several \
             unverified engrams into one group. Every unverified ID must appear exactly \
             once, in one group or in no_match_ids; verified-only IDs must never appear in \
             no_match_ids; every group must contain at least one unverified ID."
        }
    };

    let payload = serde_json::json!({
        "engrams": batch.engrams,
        "candidate_edges": batch.edges,
    });

    format!(
        "You are deduplicating short actionable lessons (\"engrams\") extracted from \
         coding sessions.\n\n\
         Merge only when the core action, the expected outcome, and the context \
         constraints all agree. Do not merge lessons that are merely related, or where \
         one is a broader umbrella and the other a specific sub-rule, or where concrete \
         details (commands, flags, paths, versions) conflict. When two engrams teach the \
         same lesson but were learned in different project contexts, merge them and \
         generalize the canonical text to drop the project-specific detail. High \
         precision is required: if uncertain, do not merge.\n\n\
         Canonical text must be 1-2 sentences, concrete, and invent no new facts.\n\n\
         {mode_rules}\n\n\
         Confidence hint: {min_confidence}\n\n\
         Batch:\n{}\n\n\
         Return strict JSON, no markdown fences, matching:\n\
         {{\"groups\": [{{\"ids\": [int], \"canonical_text\": \"string\", \"confidence\": \
         float, \"reason\": \"string\"}}], \"no_match_ids\": [int]}}",
        serde_json::to_string_pretty(&payload).unwrap_or_default(),
    )
}

fn parse_response(raw: &str) -> Option<DedupResponse> {
    let json = extract_json_from_response(raw);
    serde_json::from_str(json).ok()
}

/// Validates a scorer response against the strict accounting rules in
/// §4.G, returning only the groups that pass and the error strings for
/// everything that did not.
fn validate_response(response: &DedupResponse, batch: &Batch, mode: Mode) -> (Vec<DedupGroup>, Vec<String>) {
    let mut errors = Vec::new();
    let input_ids: HashSet<i64> = batch.engrams.iter().map(|e| e.id).collect();
    let unverified_ids: HashSet<i64> = batch.unverified_ids.iter().map(|id| id.as_i64()).collect();
    let verified_ids: HashSet<i64> = input_ids.difference(&unverified_ids).copied().collect();

    let mut seen: HashSet<i64> = HashSet::new();
    let mut valid = Vec::new();

    for (i, group) in response.groups.iter().enumerate() {
        let mut group_errors = Vec::new();

        if group.ids.len() < 2 {
            group_errors.push(format!("group {i}: size < 2"));
        }
        let unknown: Vec<i64> = group.ids.iter().filter(|&&id| !input_ids.contains(&id)).copied().collect();
        if !unknown.is_empty() {
            group_errors.push(format!("group {i}: unknown ids {unknown:?}"));
        }
        let duplicated: Vec<i64> = group.ids.iter().filter(|&&id| seen.contains(&id)).copied().collect();
        if !duplicated.is_empty() {
            group_errors.push(format!("group {i}: ids {duplicated:?} already claimed"));
        }
        if !(0.0..=1.0).contains(&group.confidence) {
            group_errors.push(format!("group {i}: confidence {} not in [0,1]", group.confidence));
        }
        if group.canonical_text.trim().is_empty() {
            group_errors.push(format!("group {i}: empty canonical_text"));
        }
        if mode == Mode::Incremental && !group.ids.iter().any(|id| unverified_ids.contains(id)) {
            group_errors.push(format!("group {i}: no unverified id in incremental mode"));
        }

        if group_errors.is_empty() {
            seen.extend(&group.ids);
            let mut accepted = group.clone();
            accepted.reason = truncate_reason(&accepted.reason);
            valid.push(accepted);
        } else {
            errors.extend(group_errors);
        }
    }

    for &id in &response.no_match_ids {
        if !input_ids.contains(&id) {
            errors.push(format!("no_match_ids contains unknown id {id}"));
        }
        if seen.contains(&id) {
            errors.push(format!("no_match_ids contains id {id} already in a group"));
        }
        seen.insert(id);
    }

    match mode {
        Mode::Incremental => {
            let missing: Vec<i64> = unverified_ids.difference(&seen).copied().collect();
            if !missing.is_empty() {
                errors.push(format!("unverified ids not accounted for: {missing:?}"));
            }
            let no_match_set: HashSet<i64> = response.no_match_ids.iter().copied().collect();
            let verified_in_no_match: Vec<i64> = verified_ids.intersection(&no_match_set).copied().collect();
            if !verified_in_no_match.is_empty() {
                errors.push(format!("verified ids in no_match_ids: {verified_in_no_match:?}"));
            }
        }
        Mode::Bootstrap => {
            let missing: Vec<i64> = input_ids.difference(&seen).copied().collect();
            if !missing.is_empty() {
                errors.push(format!("ids not accounted for: {missing:?}"));
            }
        }
    }

    (valid, errors)
}

/// Deterministic survivor: verified beats unverified, then higher
/// `occurrence_count`, then lowest id.
fn select_survivor(ids: &[EngramId], engrams_by_id: &HashMap<EngramId, Engram>) -> EngramId {
    let mut candidates: Vec<EngramId> = ids.iter().copied().filter(|id| engrams_by_id.contains_key(id)).collect();
    candidates.sort_by_key(|id| {
        let e = &engrams_by_id[id];
        (std::cmp::Reverse(e.dedup_verified), std::cmp::Reverse(e.occurrence_count), id.as_i64())
    });
    candidates.first().copied().unwrap_or(ids[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engram(id: i64, text: &str, verified: bool, occurrence_count: u32) -> Engram {
        let now = Utc::now();
        Engram {
            id: EngramId::new(id),
            text: text.to_string(),
            category: "general".to_string(),
            category_level1: Some("general".to_string()),
            category_level2: None,
            category_level3: None,
            extra_categories: Vec::new(),
            source: crate::models::Source::Manual,
            source_sessions: Vec::new(),
            occurrence_count,
            deprecated: false,
            pinned: false,
            dedup_verified: verified,
            prerequisites: crate::models::Prerequisites::default(),
            times_matched: 0,
            last_matched: None,
            merged_into: None,
            dedup_error: None,
            merge_metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn select_survivor_prefers_verified_over_occurrence() {
        let mut by_id = HashMap::new();
        by_id.insert(EngramId::new(1), engram(1, "a", false, 100));
        by_id.insert(EngramId::new(2), engram(2, "b", true, 1));
        let survivor = select_survivor(&[EngramId::new(1), EngramId::new(2)], &by_id);
        assert_eq!(survivor, EngramId::new(2));
    }

    #[test]
    fn select_survivor_falls_back_to_lowest_id() {
        let mut by_id = HashMap::new();
        by_id.insert(EngramId::new(5), engram(5, "a", false, 1));
        by_id.insert(EngramId::new(2), engram(2, "b", false, 1));
        let survivor = select_survivor(&[EngramId::new(5), EngramId::new(2)], &by_id);
        assert_eq!(survivor, EngramId::new(2));
    }

    #[test]
    fn validate_response_rejects_group_missing_unverified_id() {
        let batch = Batch {
            engrams: vec![
                to_payload(&engram(1, "a", false, 1), true),
                to_payload(&engram(2, "b", true, 1), false),
                to_payload(&engram(3, "c", true, 1), false),
            ],
            edges: Vec::new(),
            unverified_ids: [EngramId::new(1)].into_iter().collect(),
        };
        let response = DedupResponse {
            groups: vec![DedupGroup { ids: vec![2, 3], canonical_text: "x".to_string(), confidence: 0.9, reason: String::new() }],
            no_match_ids: vec![1],
        };
        let (valid, errors) = validate_response(&response, &batch, Mode::Incremental);
        assert!(valid.is_empty());
        assert!(errors.iter().any(|e| e.contains("no unverified id")));
    }

    #[test]
    fn validate_response_accepts_well_formed_incremental_group() {
        let batch = Batch {
            engrams: vec![to_payload(&engram(1, "a", false, 1), true), to_payload(&engram(2, "b", true, 1), false)],
            edges: Vec::new(),
            unverified_ids: [EngramId::new(1)].into_iter().collect(),
        };
        let response = DedupResponse {
            groups: vec![DedupGroup { ids: vec![1, 2], canonical_text: "merged lesson".to_string(), confidence: 0.95, reason: String::new() }],
            no_match_ids: vec![],
        };
        let (valid, errors) = validate_response(&response, &batch, Mode::Incremental);
        assert_eq!(valid.len(), 1);
        assert!(errors.is_empty());
    }

    #[test]
    fn build_batches_splits_on_char_budget() {
        let e1 = engram(1, &"a".repeat(40), false, 1);
        let e2 = engram(2, &"b".repeat(40), true, 1);
        let e3 = engram(3, &"c".repeat(40), false, 1);
        let e4 = engram(4, &"d".repeat(40), true, 1);

        let mut by_id = HashMap::new();
        for e in [&e1, &e2, &e3, &e4] {
            by_id.insert(e.id, e.clone());
        }

        let mut with_candidates = HashMap::new();
        with_candidates.insert(e1.id, vec![(e2.id, 0.9)]);
        with_candidates.insert(e3.id, vec![(e4.id, 0.9)]);

        let unverified_ids: HashSet<EngramId> = [e1.id, e3.id].into_iter().collect();
        let batches = build_batches(&with_candidates, &by_id, &unverified_ids, 90);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn accepted_group_reason_is_truncated_to_200_chars() {
        let batch = Batch {
            engrams: vec![to_payload(&engram(1, "a", false, 1), true), to_payload(&engram(2, "b", false, 1), true)],
            edges: Vec::new(),
            unverified_ids: [EngramId::new(1), EngramId::new(2)].into_iter().collect(),
        };
        let response = DedupResponse {
            groups: vec![DedupGroup {
                ids: vec![1, 2],
                canonical_text: "merged lesson".to_string(),
                confidence: 0.9,
                reason: "x".repeat(500),
            }],
            no_match_ids: vec![],
        };
        let (valid, _errors) = validate_response(&response, &batch, Mode::Bootstrap);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].reason.chars().count(), MAX_REASON_CHARS);
    }

    /// Writes an executable shell script that ignores its arguments and
    /// stdin and always prints `json` to stdout, standing in for the
    /// external LLM subprocess.
    fn fake_llm_script(dir: &std::path::Path, json: &str) -> std::path::PathBuf {
        use std::io::Write as _;

        let path = dir.join("fake-llm.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "cat <<'ENGRAMMAR_EOF'").unwrap();
        writeln!(file, "{json}").unwrap();
        writeln!(file, "ENGRAMMAR_EOF").unwrap();
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        path
    }

    /// S1 end-to-end: two near-duplicate engrams, an empty verified pool
    /// (bootstrap mode), a stubbed external LLM proposing a single merge
    /// group. `DedupEngine::run` should merge them into the lower-id
    /// survivor with the canonical text and mark nothing else failed.
    #[tokio::test]
    async fn bootstrap_run_merges_near_duplicates_via_external_llm() {
        let dir = tempfile::tempdir().unwrap();
        let conn = std::sync::Mutex::new(rusqlite::Connection::open_in_memory().unwrap());
        crate::storage::sqlite::schema::migrate(&conn).unwrap();
        let store: Arc<dyn EngramStore> = Arc::new(crate::storage::SqliteEngramStore::new(conn));

        let text = "branch names must be taps-n lowercase";
        let e1 = store
            .add(text, "general", &[], crate::models::Source::Manual, Some("sess-1"), crate::models::Prerequisites::default(), Utc::now())
            .unwrap();
        let e2 = store
            .add(text, "general", &[], crate::models::Source::Manual, Some("sess-2"), crate::models::Prerequisites::default(), Utc::now())
            .unwrap();
        assert!(e1 < e2);

        let json = format!(
            r#"{{"groups":[{{"ids":[{},{}],"canonical_text":"Use lowercase branch names like taps-N.","confidence":0.95,"reason":"same rule, reworded"}}],"no_match_ids":[]}}"#,
            e1.as_i64(),
            e2.as_i64(),
        );
        let script = fake_llm_script(dir.path(), &json);
        let llm = ExternalLlm::new(script.to_string_lossy().to_string(), None);
        let embedder: Arc<dyn Embedder> = Arc::new(crate::embedding::FallbackEmbedder::new());

        let engine = DedupEngine::new(Arc::clone(&store), embedder, llm, None);
        let summary = engine.run(&DedupConfig::default()).await.unwrap();

        assert_eq!(summary.merged, 1);
        assert_eq!(summary.failed, 0);

        let survivor = store.get(e1).unwrap().unwrap();
        assert_eq!(survivor.text, "Use lowercase branch names like taps-N.");
        assert_eq!(survivor.source_sessions, vec!["sess-1".to_string(), "sess-2".to_string()]);
        assert_eq!(survivor.occurrence_count, 2);
        assert!(!survivor.deprecated);

        let absorbed = store.get(e2).unwrap().unwrap();
        assert!(absorbed.deprecated);
        assert_eq!(absorbed.merged_into, Some(e1));
        assert!(absorbed.merge_metadata.as_deref().unwrap_or_default().contains("same rule, reworded"));
    }
}
