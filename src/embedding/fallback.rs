//! Deterministic pseudo-embedding, used when the `fastembed-embeddings`
//! feature is not compiled in.
//!
//! Hashes overlapping word shingles into a fixed-width vector and L2
//! normalizes it. Not semantically meaningful, but stable across runs
//! (same text always yields the same vector) and cheap, so the dense
//! half of the hybrid retriever degrades to a weak lexical echo rather
//! than disappearing outright — callers that want true BM25-only
//! behavior instead can compare cosine scores from this embedder as
//! noise and rely on the lexical ranking alone.

use sha2::{Digest, Sha256};

use super::Embedder;
use crate::Result;

/// Fallback embedder producing hash-based pseudo-embeddings.
pub struct FallbackEmbedder {
    dimensions: usize,
}

impl FallbackEmbedder {
    /// Matches [`super::FastEmbedEmbedder::DEFAULT_DIMENSIONS`] so the
    /// vector index's fixed dimensionality does not change depending on
    /// whether the `fastembed-embeddings` feature is enabled.
    pub const DEFAULT_DIMENSIONS: usize = super::FastEmbedEmbedder::DEFAULT_DIMENSIONS;

    /// Creates a new fallback embedder with the default dimensionality.
    #[must_use]
    pub const fn new() -> Self {
        Self { dimensions: Self::DEFAULT_DIMENSIONS }
    }
}

impl Default for FallbackEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for FallbackEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        let normalized = text.to_lowercase();
        let tokens: Vec<&str> = normalized.split_whitespace().collect();

        if tokens.is_empty() {
            return Ok(vector);
        }

        for window in tokens.windows(2.min(tokens.len())) {
            let shingle = window.join(" ");
            let digest = Sha256::digest(shingle.as_bytes());
            for (chunk_index, chunk) in digest.chunks_exact(4).enumerate() {
                let slot = chunk_index % self.dimensions;
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let signed = (raw as f32 / u32::MAX as f32).mul_add(2.0, -1.0);
                vector[slot] += signed;
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for component in &mut vector {
                *component /= norm;
            }
        }

        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_text_yields_same_vector() {
        let embedder = FallbackEmbedder::new();
        let a = embedder.embed("use rebase not merge").unwrap();
        let b = embedder.embed("use rebase not merge").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_text_yields_different_vector() {
        let embedder = FallbackEmbedder::new();
        let a = embedder.embed("use rebase not merge").unwrap();
        let b = embedder.embed("prefer squash commits").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn output_is_unit_normalized() {
        let embedder = FallbackEmbedder::new();
        let v = embedder.embed("some lesson text here").unwrap();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn empty_text_yields_zero_vector() {
        let embedder = FallbackEmbedder::new();
        let v = embedder.embed("").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
