//! Text embedding.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from embedding text.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding service error: {0}")]
    Service(String),

    #[error("embedding timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding has {found} dimensions, expected {expected}")]
    Dimension { expected: usize, found: usize },

    #[error("embedding contains non-finite values")]
    NonFinite,
}

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Length of every vector returned by [`embed`](Self::embed).
    fn dimension(&self) -> usize;
}

#[async_trait]
impl<E: Embedder + ?Sized> Embedder for Arc<E> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        (**self).embed(text).await
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }
}

/// Check that an embedding has the declared shape.
pub fn validate_embedding(embedding: &[f32], dimension: usize) -> Result<(), EmbeddingError> {
    if embedding.len() != dimension {
        return Err(EmbeddingError::Dimension {
            expected: dimension,
            found: embedding.len(),
        });
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(EmbeddingError::NonFinite);
    }
    Ok(())
}

/// Deterministic local embedding built from hashed character trigrams.
///
/// Needs no network and gives texts that share wording a positive cosine
/// similarity. Vectors are L2-normalized; empty text embeds to zeros.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn hash_trigram(trigram: &[u8]) -> usize {
        let mut hash: usize = 0;
        for (i, &b) in trigram.iter().enumerate() {
            hash = hash.wrapping_add((b as usize).wrapping_mul(31_usize.pow(i as u32)));
        }
        hash
    }

    fn generate(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];
        let folded = text.to_lowercase();
        let bytes = folded.as_bytes();
        if bytes.is_empty() {
            return embedding;
        }

        if bytes.len() < 3 {
            for (i, &b) in bytes.iter().enumerate() {
                embedding[(b as usize + i * 256) % self.dimension] += 1.0;
            }
        } else {
            for trigram in bytes.windows(3) {
                embedding[Self::hash_trigram(trigram) % self.dimension] += 1.0;
            }
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        embedding
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EMBEDDING_DIMENSION)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.generate(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Bounds every call of the wrapped embedder by a timeout.
pub struct TimedEmbedder<E> {
    inner: E,
    timeout: Duration,
}

impl<E: Embedder> TimedEmbedder<E> {
    pub fn new(inner: E, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<E: Embedder> Embedder for TimedEmbedder<E> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        tokio::time::timeout(self.timeout, self.inner.embed(text))
            .await
            .map_err(|_| EmbeddingError::Timeout(self.timeout))?
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}
