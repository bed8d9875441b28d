use crate::error::{EmbedError, Result};
use crate::score::tokenize;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Fixed embedding dimension the gateway expects from any service.
pub const EMBEDDING_DIMENSION: usize = 384;

/// The external embedding contract: text in, fixed-dimension vector out.
/// Implementations must be idempotent for identical inputs.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize {
        EMBEDDING_DIMENSION
    }
}

/// Deterministic embedder that hashes each token into a handful of vector
/// slots. No model assets, no network, stable across runs and platforms,
/// which is what the default wiring and the tests need. Texts sharing
/// tokens land near each other; unrelated texts are near-orthogonal.
#[derive(Clone, Debug)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dimension: EMBEDDING_DIMENSION,
        }
    }

    #[must_use]
    pub fn with_dimension(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingService for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hash_embed(text, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Always-failing service. Selecting it (e.g. `GRIMOIRE_EMBEDDING_MODE=none`)
/// runs the resolver permanently in keyword-only degradation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEmbedder;

#[async_trait]
impl EmbeddingService for NullEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(EmbedError::Disabled)
    }
}

fn hash_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension.max(1)];
    for token in tokenize(text) {
        let digest = Sha256::digest(token.as_bytes());
        // Spread each token over a few pseudo-random signed slots.
        for chunk in digest.chunks_exact(4).take(4) {
            let slot = u16::from_le_bytes([chunk[0], chunk[1]]) as usize % vector.len();
            let sign = if chunk[2] & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }
    }
    normalize_in_place(&mut vector);
    vector
}

pub(crate) fn normalize_in_place(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
