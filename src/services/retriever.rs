//! The hybrid retriever (component D, §4.D).
//!
//! Depends on exactly the three capabilities named in §9 —
//! [`EngramStore`], [`VectorIndex`], [`EnvironmentProbe`] — composed
//! behind `Arc<dyn ...>` so tests can inject stubs without touching
//! SQLite or the filesystem.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use super::{bm25, rrf};
use crate::Result;
use crate::context::{Environment, EnvironmentProbe};
use crate::embedding::Embedder;
use crate::models::{Engram, EngramId, SearchFilter, SearchHit, TagRelevance};
use crate::storage::{EngramStore, VectorIndex};

const DENSE_TOP: usize = 10;
const LEXICAL_TOP: usize = 10;

/// A candidate is dropped when its average tag-relevance EMA across the
/// *requested* tags (denominator = environment tag count, not matched-tag
/// count) is at or below this and evidence clears the floor.
const TAG_PENALTY_EMA_THRESHOLD: f32 = -0.1;
const TAG_PENALTY_MIN_EVIDENCE: u32 = 3;
/// Positive-average bonus scale; small relative to RRF's own score range
/// (max roughly `2/61`) so it nudges ties without dominating fusion.
const TAG_BONUS_SCALE: f32 = 0.01;

/// Default number of results for a prompt-driven search (§6 `search.top_k`).
pub const DEFAULT_PROMPT_TOP_K: usize = 5;
/// Default number of results for a tool-context search (§4.D closing note).
pub const DEFAULT_TOOL_TOP_K: usize = 3;

/// Combines dense and lexical rankings via reciprocal rank fusion,
/// filtered by structural prerequisites and penalised by learned tag
/// relevance.
pub struct HybridRetriever {
    store: Arc<dyn EngramStore>,
    vector_index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    environment: Arc<dyn EnvironmentProbe>,
}

impl HybridRetriever {
    /// Composes the retriever over its three capabilities and the
    /// embedding model used to turn the query into a dense vector.
    #[must_use]
    pub const fn new(
        store: Arc<dyn EngramStore>,
        vector_index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        environment: Arc<dyn EnvironmentProbe>,
    ) -> Self {
        Self { store, vector_index, embedder, environment }
    }

    /// Runs the full pipeline (§4.D steps 1-10): structural and tag
    /// filtering, dense + lexical ranking, RRF fusion, category filter,
    /// tag-relevance gating, and truncation to `top_k`. As a side effect,
    /// records each returned engram's match stats and marks it shown in
    /// `session_id` under `hook_event`.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        top_k: usize,
        session_id: &str,
        hook_event: &str,
    ) -> Result<Vec<SearchHit>> {
        let env = self.environment.probe();
        let candidates = self.candidate_pool(&env, filter)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let by_id: HashMap<EngramId, &Engram> = candidates.iter().map(|e| (e.id, e)).collect();

        let dense = self.dense_ranking(query, &by_id)?;
        let lexical_docs: Vec<(EngramId, String)> = candidates
            .iter()
            .map(|e| (e.id, format!("{} {}", e.text, e.category)))
            .collect();
        let lexical = bm25::rank(&lexical_docs, query, LEXICAL_TOP);

        let dense_ids: Vec<EngramId> = dense.iter().map(|(id, _)| *id).collect();
        let lexical_ids: Vec<EngramId> = lexical.iter().map(|(id, _)| *id).collect();
        let dense_scores: HashMap<EngramId, f32> = dense.into_iter().collect();
        let lexical_scores: HashMap<EngramId, f32> = lexical.into_iter().collect();

        let fused = rrf::fuse(&[&dense_ids, &lexical_ids]);

        let mut hits: Vec<SearchHit> = fused
            .into_iter()
            .filter_map(|(id, score)| {
                let engram = *by_id.get(&id)?;
                if let Some(prefix) = &filter.category_prefix
                    && !engram.matches_category_prefix(prefix)
                {
                    return None;
                }
                Some(SearchHit {
                    engram_id: id,
                    score,
                    vector_score: dense_scores.get(&id).copied(),
                    bm25_score: lexical_scores.get(&id).copied(),
                })
            })
            .collect();

        self.apply_tag_relevance_penalty(&mut hits, &env)?;

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);

        let now = Utc::now();
        for hit in &hits {
            self.store.update_match_stats(hit.engram_id, env.repo.as_deref(), &env.tags, now)?;
            self.store.record_shown(session_id, hit.engram_id, hook_event)?;
        }

        Ok(hits)
    }

    /// Pinned engrams whose prerequisites match the current environment
    /// (the `pinned {}` request, §4.H) — always injected, bypassing
    /// ranking entirely.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    pub fn pinned(&self) -> Result<Vec<Engram>> {
        let env = self.environment.probe();
        Ok(self.store.list_pinned()?.into_iter().filter(|e| e.prerequisites.matches(&env)).collect())
    }

    fn candidate_pool(&self, env: &Environment, filter: &SearchFilter) -> Result<Vec<Engram>> {
        let mut candidates: Vec<Engram> = self
            .store
            .list_active()?
            .into_iter()
            .filter(|e| e.prerequisites.matches_structural(env))
            .collect();

        if let Some(required_tags) = &filter.tag_filter {
            candidates.retain(|e| match &e.prerequisites.tags {
                Some(declared) => required_tags.iter().all(|t| declared.contains(t)),
                None => required_tags.is_empty(),
            });
        }

        Ok(candidates)
    }

    fn dense_ranking(
        &self,
        query: &str,
        by_id: &HashMap<EngramId, &Engram>,
    ) -> Result<Vec<(EngramId, f32)>> {
        let vector = self.embedder.embed(query)?;
        let raw = self.vector_index.search(&vector, DENSE_TOP)?;
        Ok(raw.into_iter().filter(|(id, _)| by_id.contains_key(id)).collect())
    }

    /// §4.D step 9: drop candidates whose average EMA across requested
    /// tags is at or below threshold with enough evidence; otherwise
    /// apply a small positive bonus. Engrams with no relevance rows for
    /// any requested tag are left untouched.
    fn apply_tag_relevance_penalty(&self, hits: &mut Vec<SearchHit>, env: &Environment) -> Result<()> {
        if env.tags.is_empty() {
            return Ok(());
        }

        let mut survivors = Vec::with_capacity(hits.len());
        for hit in hits.drain(..) {
            let rows = self.store.tag_relevance_for_tags(hit.engram_id, &env.tags)?;
            if rows.is_empty() {
                survivors.push(hit);
                continue;
            }

            #[allow(clippy::cast_precision_loss)]
            let avg_ema = rows.iter().map(|r| r.ema).sum::<f32>() / env.tags.len() as f32;
            let evidence: u32 = rows.iter().map(TagRelevance::evidence).sum();

            if avg_ema <= TAG_PENALTY_EMA_THRESHOLD && evidence >= TAG_PENALTY_MIN_EVIDENCE {
                continue;
            }

            let mut hit = hit;
            if avg_ema > 0.0 {
                hit.score += avg_ema * TAG_BONUS_SCALE;
            }
            survivors.push(hit);
        }

        *hits = survivors;
        Ok(())
    }
}

/// Builds a retrieval query from a tool-use event (§4.D closing
/// paragraph): the tool name plus the string values of well-known input
/// fields, with the first whitespace-separated token of `command` added
/// for shell invocations.
#[must_use]
pub fn build_tool_query(tool_name: &str, tool_input: &serde_json::Value) -> String {
    let mut parts = vec![tool_name.to_string()];
    for field in ["file_path", "path", "pattern", "command"] {
        if let Some(value) = tool_input.get(field).and_then(serde_json::Value::as_str) {
            parts.push(value.to_string());
            if field == "command"
                && let Some(first_token) = value.split_whitespace().next()
            {
                parts.push(first_token.to_string());
            }
        }
    }
    parts.join(" ")
}
