//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, the validating batch helpers [`embed_texts`] and
//! [`embed_query`], a deterministic offline [`HashProvider`], and pure
//! helper functions for vector serialization and similarity computation.
//!
//! Network and ONNX-backed providers (OpenAI, Ollama, fastembed) live in
//! the `docrag` app crate.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};

/// Character budget used when a provider does not declare its own.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 8_000;

/// Trait for embedding providers.
///
/// Implementations must be deterministic for a fixed model version: the same
/// input text always maps to the same vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Longest input, in characters, the model accepts without truncation.
    fn max_input_chars(&self) -> usize {
        DEFAULT_MAX_INPUT_CHARS
    }
    /// Embed one batch of already-validated texts.
    ///
    /// Callers should go through [`embed_texts`], which validates inputs,
    /// batches, and checks the provider's output.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed `texts` in batches of `batch_size`, returning one vector per input
/// in input order.
///
/// Fails with [`RagError::Embedding`] if any text is empty or longer than
/// the provider's character budget (nothing is truncated), or if the
/// provider returns the wrong number of vectors or the wrong dimensionality.
pub async fn embed_texts(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let budget = provider.max_input_chars();
    for (i, text) in texts.iter().enumerate() {
        if text.trim().is_empty() {
            return Err(RagError::Embedding(format!("input {} is empty", i)));
        }
        let len = text.chars().count();
        if len > budget {
            return Err(RagError::Embedding(format!(
                "input {} has {} chars, model '{}' accepts at most {}",
                i,
                len,
                provider.model_name(),
                budget
            )));
        }
    }

    let dims = provider.dims();
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = provider.embed(batch).await?;
        if vectors.len() != batch.len() {
            return Err(RagError::Embedding(format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(RagError::Embedding(format!(
                "provider returned {}-dim vector, declared {}",
                bad.len(),
                dims
            )));
        }
        out.extend(vectors);
    }
    Ok(out)
}

/// Embed a single query string.
pub async fn embed_query(provider: &dyn EmbeddingProvider, query: &str) -> Result<Vec<f32>> {
    if query.trim().is_empty() {
        return Err(RagError::Validation("query must not be empty".into()));
    }
    let mut vectors = embed_texts(provider, &[query.to_string()], 1).await?;
    vectors
        .pop()
        .ok_or_else(|| RagError::Embedding("provider returned no vector".into()))
}

/// Deterministic feature-hashing embedder.
///
/// Lower-cased word unigrams (weight 1.0) and bigrams (weight 0.5) are
/// hashed with SHA-256 into `dims` signed buckets; the result is
/// L2-normalized. No model download, no network: suitable for tests and
/// offline indexes where lexical overlap is a good enough signal.
#[derive(Debug, Clone)]
pub struct HashProvider {
    dims: usize,
    model: String,
}

impl HashProvider {
    pub const DEFAULT_DIMS: usize = 384;

    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            model: format!("hash-v1-{}", dims),
        }
    }

    /// Embed one text synchronously.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        let mut v = vec![0.0f32; self.dims];
        if self.dims == 0 {
            return v;
        }
        for token in &tokens {
            self.add_feature(&mut v, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut v, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let d = Sha256::digest(feature.as_bytes());
        let bucket = u64::from_le_bytes([d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]]);
        let idx = (bucket % self.dims as u64) as usize;
        let sign = if d[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign * weight;
    }
}

impl Default for HashProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use docrag_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
///
/// Reverses [`vec_to_blob`]: reads 4-byte little-endian `f32` values
/// from the byte slice.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
