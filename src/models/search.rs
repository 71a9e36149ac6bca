//! Retrieval-facing types: filters and fused hits.

use serde::{Deserialize, Serialize};

use super::EngramId;

/// Optional filters applied by the hybrid retriever before dense/lexical
/// ranking, or passed straight through from the request-server protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Keep only engrams whose primary or extra category starts with this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_prefix: Option<String>,
    /// Keep only engrams that declare all of these tags as prerequisites.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_filter: Option<Vec<String>>,
}

/// One fused, ranked result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// The matched engram's identity.
    pub engram_id: EngramId,
    /// Reciprocal-rank-fusion score (rank-based, not a similarity).
    pub score: f32,
    /// Dense-ranking cosine similarity, when present in that list.
    pub vector_score: Option<f32>,
    /// Lexical BM25 score, when present in that list.
    pub bm25_score: Option<f32>,
}
