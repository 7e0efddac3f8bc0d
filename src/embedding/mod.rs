//! Sector-aware text embedding
//!
//! Supported providers:
//! - Synthetic hashed bag-of-features (default, deterministic, offline)
//! - Remote OpenAI-compatible API (feature `remote`)
//!
//! Every provider embeds per sector: the sector selects text
//! pre-processing and salts the feature space, so the same content
//! lands on different (but stable) points per sector. When a provider
//! fails, callers fall back to the 32-dim fingerprint.

pub mod simhash;

pub use simhash::{fingerprint_vector, fnv1a64, hamming, simhash64, FINGERPRINT_DIM};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
#[cfg(feature = "remote")]
use crate::error::MnemaError;
use crate::error::Result;
use crate::types::Sector;

/// Identity of an encoder, used for the startup compatibility check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderDigest {
    pub provider: String,
    pub model: String,
    pub dims: usize,
}

/// Trait for sector-aware embedding providers
pub trait SectorEncoder: Send + Sync {
    /// Generate a unit-norm embedding for `text` in `sector`
    fn embed(&self, text: &str, sector: Sector) -> Result<Vec<f32>>;

    /// Target dimension
    fn dimensions(&self) -> usize;

    /// Provider identity
    fn digest(&self) -> EncoderDigest;
}

/// Sector-specific pre-processing applied before encoding
pub fn preprocess(text: &str, sector: Sector) -> String {
    match sector {
        // Strip markdown markup; procedures care about the steps
        Sector::Procedural => text
            .chars()
            .filter(|c| !matches!(c, '#' | '*' | '`' | '>' | '_' | '~'))
            .collect(),
        // Keep interjections and exclamation context
        Sector::Emotional => text.to_string(),
        // Keep digits prominent for time references
        Sector::Temporal => text.to_string(),
        _ => text.trim().to_string(),
    }
}

/// Synthetic deterministic embedder: hashing-trick bag of tokens and
/// bigrams with signed features, salted per sector, L2-normalized.
pub struct SyntheticEncoder {
    dimensions: usize,
}

impl SyntheticEncoder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn feature_index(&self, token: &str, sector: Sector) -> usize {
        let salted = format!("{}\u{1}{}", sector.as_str(), token);
        (fnv1a64(salted.as_bytes()) as usize) % self.dimensions
    }

    fn feature_sign(&self, token: &str, sector: Sector) -> f32 {
        let salted = format!("{}\u{1}{}\u{1}sign", sector.as_str(), token);
        if fnv1a64(salted.as_bytes()) % 2 == 0 {
            1.0
        } else {
            -1.0
        }
    }
}

impl SectorEncoder for SyntheticEncoder {
    fn embed(&self, text: &str, sector: Sector) -> Result<Vec<f32>> {
        let prepared = preprocess(text, sector);
        let tokens = match sector {
            // Emotional sector keeps interjection tokens the canonical
            // pass would drop ("wow", "oh", punctuation emphasis)
            Sector::Emotional => prepared
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric() && c != '!')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect::<Vec<_>>(),
            _ => crate::text::canonical_tokens(&prepared),
        };

        let mut embedding = vec![0.0f32; self.dimensions];
        if tokens.is_empty() {
            return Ok(embedding);
        }

        let doc_len = tokens.len() as f32;
        let mut tf: std::collections::HashMap<&str, f32> = std::collections::HashMap::new();
        for token in &tokens {
            *tf.entry(token.as_str()).or_insert(0.0) += 1.0;
        }

        for (token, count) in tf {
            let weight = (1.0 + count / doc_len).ln() * (1.0 + token.len() as f32 * 0.1);
            let idx = self.feature_index(token, sector);
            embedding[idx] += weight * self.feature_sign(token, sector);
        }

        for window in tokens.windows(2) {
            let bigram = format!("{}_{}", window[0], window[1]);
            let idx = self.feature_index(&bigram, sector);
            embedding[idx] += 0.5 * self.feature_sign(&bigram, sector);
        }

        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn digest(&self) -> EncoderDigest {
        EncoderDigest {
            provider: "synthetic".to_string(),
            model: "hashed-bow-v1".to_string(),
            dims: self.dimensions,
        }
    }
}

/// Remote OpenAI-compatible embedding client
#[cfg(feature = "remote")]
pub struct RemoteEncoder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
}

#[cfg(feature = "remote")]
impl RemoteEncoder {
    pub fn new(api_key: String, base_url: String, model: String, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
            dimensions,
        }
    }

    async fn embed_async(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "input": text,
                "model": self.model,
            }))
            .send()
            .await
            .map_err(|e| MnemaError::Unavailable {
                message: e.to_string(),
                retryable: true,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MnemaError::Unavailable {
                message: format!("embedding API error {}: {}", status, body),
                retryable: status.is_server_error(),
            });
        }

        let data: serde_json::Value = response.json().await.map_err(|e| {
            MnemaError::Embedding(format!("invalid embedding response: {}", e))
        })?;
        let embedding: Vec<f32> = data["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| MnemaError::Embedding("invalid response format".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        Ok(embedding)
    }
}

#[cfg(feature = "remote")]
impl SectorEncoder for RemoteEncoder {
    fn embed(&self, text: &str, sector: Sector) -> Result<Vec<f32>> {
        let prepared = preprocess(text, sector);
        let mut embedding = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.embed_async(&prepared))
        })?;
        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn digest(&self) -> EncoderDigest {
        EncoderDigest {
            provider: "remote".to_string(),
            model: self.model.clone(),
            dims: self.dimensions,
        }
    }
}

/// Create the configured encoder
pub fn create_encoder(config: &EngineConfig) -> Result<Arc<dyn SectorEncoder>> {
    Ok(Arc::new(SyntheticEncoder::new(config.vec_dim)))
}

/// Warn when the active provider differs from the one the stored
/// vectors were produced with; scores would be incomparable.
pub fn check_compatibility(active: &EncoderDigest, stored: Option<&EncoderDigest>) {
    if let Some(stored) = stored {
        if active != stored {
            tracing::warn!(
                active_provider = %active.provider,
                active_model = %active.model,
                stored_provider = %stored.provider,
                stored_model = %stored.model,
                "encoder changed since vectors were written; similarity scores are incomparable"
            );
        }
    }
}

/// In-place L2 normalization
pub fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Pool a vector down to `target_dim` by averaging buckets of
/// adjacent dimensions, then renormalize. Pooling an already-pooled
/// vector to the same target is a no-op dimension-wise.
pub fn pool_vector(vec: &[f32], target_dim: usize) -> Vec<f32> {
    if target_dim == 0 || vec.is_empty() || vec.len() <= target_dim {
        return vec.to_vec();
    }

    let bucket = vec.len().div_ceil(target_dim);
    let mut pooled: Vec<f32> = vec
        .chunks(bucket)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect();
    l2_normalize(&mut pooled);
    pooled
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_deterministic() {
        let encoder = SyntheticEncoder::new(128);
        let a = encoder.embed("I prefer dark theme", Sector::Semantic).unwrap();
        let b = encoder.embed("I prefer dark theme", Sector::Semantic).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
    }

    #[test]
    fn test_synthetic_unit_norm() {
        let encoder = SyntheticEncoder::new(64);
        let v = encoder.embed("some content to embed", Sector::Semantic).unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_sectors_salt_the_space() {
        let encoder = SyntheticEncoder::new(128);
        let semantic = encoder.embed("run the tests", Sector::Semantic).unwrap();
        let procedural = encoder.embed("run the tests", Sector::Procedural).unwrap();
        assert_ne!(semantic, procedural);
    }

    #[test]
    fn test_similar_texts_score_higher() {
        let encoder = SyntheticEncoder::new(256);
        let a = encoder.embed("user prefers dark theme", Sector::Semantic).unwrap();
        let b = encoder.embed("user likes dark mode", Sector::Semantic).unwrap();
        let c = encoder.embed("quarterly revenue spreadsheet", Sector::Semantic).unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn test_procedural_strips_markup() {
        assert_eq!(preprocess("# Do *this* `now`", Sector::Procedural), " Do this now");
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let encoder = SyntheticEncoder::new(32);
        let v = encoder.embed("", Sector::Semantic).unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_pool_vector_dimensions() {
        let vec: Vec<f32> = (0..128).map(|i| i as f32).collect();
        let pooled = pool_vector(&vec, 64);
        assert_eq!(pooled.len(), 64);
        let norm: f32 = pooled.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        // Pooling to the same or larger target is a no-op
        assert_eq!(pool_vector(&pooled, 64), pooled);
        assert_eq!(pool_vector(&pooled, 128), pooled);
    }

    #[test]
    fn test_cosine_bounds() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }
}
