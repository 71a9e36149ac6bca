//! `FastEmbed`-based embedder (local ONNX inference, no network calls at
//! query time once the model is cached).

use std::sync::Mutex;

use super::Embedder;
use crate::{Error, Result};

/// `FastEmbed` embedder using all-MiniLM-L6-v2.
///
/// `fastembed::TextEmbedding` is not `Sync` internally (it holds an ORT
/// session), so calls are serialized behind a mutex; this mirrors the
/// single-threaded embedding-model access the request server already
/// assumes (§5: "the embedding model is loaded once, on server warm-up").
pub struct FastEmbedEmbedder {
    #[cfg(feature = "fastembed-embeddings")]
    inner: Mutex<::fastembed::TextEmbedding>,
    #[cfg(not(feature = "fastembed-embeddings"))]
    _inner: Mutex<()>,
    dimensions: usize,
}

impl FastEmbedEmbedder {
    /// Dimensionality of the all-MiniLM-L6-v2 embedding.
    pub const DEFAULT_DIMENSIONS: usize = 384;

    /// Creates a new `FastEmbed` embedder, downloading or loading the
    /// cached model on first use.
    ///
    /// # Errors
    /// Returns an error if the `fastembed-embeddings` feature is
    /// compiled in and model initialization fails.
    #[cfg(feature = "fastembed-embeddings")]
    pub fn new() -> Result<Self> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false),
        )
        .map_err(|e| Error::OperationFailed {
            operation: "fastembed_init".to_string(),
            cause: e.to_string(),
        })?;

        Ok(Self { inner: Mutex::new(model), dimensions: Self::DEFAULT_DIMENSIONS })
    }

    /// Stub constructor when the feature is disabled; callers should
    /// prefer [`super::FallbackEmbedder`] in that configuration. Kept so
    /// call sites that construct an embedder behind a feature flag still
    /// compile either way.
    #[cfg(not(feature = "fastembed-embeddings"))]
    pub fn new() -> Result<Self> {
        Ok(Self { _inner: Mutex::new(()), dimensions: Self::DEFAULT_DIMENSIONS })
    }
}

impl Embedder for FastEmbedEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[cfg(feature = "fastembed-embeddings")]
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut model = self.inner.lock().map_err(|_| Error::OperationFailed {
            operation: "fastembed_embed".to_string(),
            cause: "embedding model lock poisoned".to_string(),
        })?;
        let mut embeddings =
            model.embed(vec![text], None).map_err(|e| Error::OperationFailed {
                operation: "fastembed_embed".to_string(),
                cause: e.to_string(),
            })?;
        embeddings.pop().ok_or_else(|| Error::OperationFailed {
            operation: "fastembed_embed".to_string(),
            cause: "model returned no embeddings".to_string(),
        })
    }

    #[cfg(not(feature = "fastembed-embeddings"))]
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::OperationFailed {
            operation: "fastembed_embed".to_string(),
            cause: "built without the fastembed-embeddings feature".to_string(),
        })
    }

    #[cfg(feature = "fastembed-embeddings")]
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut model = self.inner.lock().map_err(|_| Error::OperationFailed {
            operation: "fastembed_embed_batch".to_string(),
            cause: "embedding model lock poisoned".to_string(),
        })?;
        model.embed(texts.to_vec(), None).map_err(|e| Error::OperationFailed {
            operation: "fastembed_embed_batch".to_string(),
            cause: e.to_string(),
        })
    }
}
