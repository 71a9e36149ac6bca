//! The dense vector index capability (component A of the system overview).

use crate::Result;
use crate::models::EngramId;

/// Dense vector store over engram text, or over a parallel set of
/// prerequisite-tag strings. Implementations are memory-mapped matrices
/// rebuilt atomically from the caller's perspective (§4.A).
pub trait VectorIndex: Send + Sync {
    /// The fixed dimensionality of vectors in this index.
    fn dimensions(&self) -> usize;

    /// Number of vectors currently indexed.
    fn len(&self) -> usize;

    /// Whether the index is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites the index from `items` atomically: readers either see
    /// the old or the new pair of matrices, never a mixed one.
    /// Implementations achieve this with temp-then-rename.
    ///
    /// # Errors
    /// Returns an error if the rebuild cannot be persisted.
    fn build(&self, items: &[(EngramId, Vec<f32>)]) -> Result<()>;

    /// Returns the top-`k` `(id, cosine_score)` pairs for `query`. Returns
    /// an empty vector when the index is empty, or when `query`'s
    /// dimensionality does not match [`VectorIndex::dimensions`] (the
    /// query path falls back to lexical-only search in that case).
    ///
    /// # Errors
    /// Returns an error if the underlying storage cannot be read.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(EngramId, f32)>>;
}
