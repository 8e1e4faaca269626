//! Embedding provider contract and the default deterministic generator.
//!
//! Real model backends are injected through [`EmbeddingProvider`]; when no
//! provider is installed (or an installed one fails), the store falls back
//! to [`MockEmbedding`], a hash-based generator that is deterministic per
//! text and gives token-overlap cosine structure — enough for tests and
//! for embedding-free deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Per-type automatic embedding policy.
///
/// Unset config means enabled with auto-detected text fields; `enabled:
/// false` disables embedding for the type entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    /// Fields to concatenate into the embeddable text. `None` auto-detects
    /// all string-valued fields.
    pub fields: Option<Vec<String>>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fields: None,
        }
    }
}

/// One scored neighbor from [`EmbeddingProvider::find_similar`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarHit {
    pub index: usize,
    pub score: f32,
}

/// The injected embedding backend.
///
/// `embed_texts` is mandatory; the similarity methods have fused default
/// implementations that backends with native kNN may override.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts. One vector per input, same order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Cosine similarity between two vectors.
    fn cosine_similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine_similarity(a, b)
    }

    /// Rank `embeddings` by similarity to `query`, filtered by `min_score`,
    /// cut to `top_k`, best first. Returned indices point into `embeddings`.
    async fn find_similar(
        &self,
        query: &[f32],
        embeddings: &[Vec<f32>],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SimilarHit>> {
        let mut hits: Vec<SimilarHit> = embeddings
            .iter()
            .enumerate()
            .map(|(index, emb)| SimilarHit {
                index,
                score: self.cosine_similarity(query, emb),
            })
            .filter(|hit| hit.score >= min_score)
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }
}

/// Cosine similarity `sum(a·b) / (‖a‖·‖b‖)`. Zero when either norm is zero
/// or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// SHA-256 of the embeddable text, hex-encoded. Used as artifact
/// `source_hash` so unchanged content can skip re-embedding.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ============================================================================
// MockEmbedding — the default generator
// ============================================================================

/// Deterministic hash-based embedding.
///
/// Each lowercased alphanumeric token hashes to a unit direction; the text
/// embedding is the normalized sum. Identical texts embed identically and
/// token overlap shows up as cosine similarity, which is what the search
/// paths need from a default.
#[derive(Debug, Clone)]
pub struct MockEmbedding {
    dimension: usize,
}

/// Default vector width of the mock generator.
pub const MOCK_DIMENSION: usize = 64;

impl Default for MockEmbedding {
    fn default() -> Self {
        Self::new(MOCK_DIMENSION)
    }
}

impl MockEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut acc = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        let mut any = false;
        for token in lowered.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            any = true;
            self.add_token(&mut acc, token);
        }
        if !any {
            return acc;
        }
        normalize(&mut acc);
        acc
    }

    fn add_token(&self, acc: &mut [f32], token: &str) {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let mut digest = hasher.finalize_reset();
        let mut i = 0;
        while i < self.dimension {
            for &byte in digest.iter() {
                if i >= self.dimension {
                    break;
                }
                // Map each byte into [-1, 1].
                acc[i] += (byte as f32 - 127.5) / 127.5;
                i += 1;
            }
            if i < self.dimension {
                hasher.update(digest);
                digest = hasher.finalize_reset();
            }
        }
    }
}

fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedding {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Failing provider used in tests to exercise the fallback path.
#[doc(hidden)]
pub struct FailingEmbedding;

#[async_trait]
impl EmbeddingProvider for FailingEmbedding {
    async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::EmbeddingBackend("backend unavailable".into()))
    }
}
