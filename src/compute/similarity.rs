//! Hashed bag-of-words embeddings and cosine similarity.
//!
//! Each token is hashed with 32-bit FNV-1a and contributes +1 or -1 (sign from
//! the hash's low bit) at index `hash mod dim`. This approximates a bag-of-words
//! embedding without an external model, which is all the pair miner and the
//! tournament's novelty scoring need.

/// Default embedding dimension.
pub const DEFAULT_DIM: usize = 512;

/// Tokens shorter than this (in chars) are dropped.
pub const MIN_TOKEN_CHARS: usize = 3;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Similarity errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimilarityError {
    #[error("Vector dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// 32-bit FNV-1a hash.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    })
}

fn is_cyrillic(c: char) -> bool {
    ('\u{0400}'..='\u{04FF}').contains(&c)
}

/// Lowercase, replace punctuation with whitespace and drop short tokens.
///
/// Hyphens and Cyrillic letters survive so that hyphenated terms and
/// non-Latin outputs still produce tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || is_cyrillic(c) {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_string)
        .collect()
}

/// Hash `text` into a signed `dim`-dimensional vector.
pub fn embed(text: &str, dim: usize) -> Vec<f64> {
    let mut vector = vec![0.0; dim];
    if dim == 0 {
        return vector;
    }
    for token in tokenize(text) {
        let hash = fnv1a32(token.as_bytes());
        let index = hash as usize % dim;
        let sign = if hash & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign;
    }
    vector
}

/// Cosine similarity in [-1, 1]; 0 if either vector is all-zero.
pub fn cosine(a: &[f64], b: &[f64]) -> Result<f64, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0))
}

/// Reusable embedder with a fixed dimension.
#[derive(Debug, Clone, Copy)]
pub struct TextEmbedder {
    dim: usize,
}

impl Default for TextEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIM)
    }
}

impl TextEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn embed(&self, text: &str) -> Vec<f64> {
        embed(text, self.dim)
    }

    /// Similarity of two texts, clamped to [0, 1].
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        // Both vectors come from the same embedder, so dimensions always agree.
        cosine(&self.embed(a), &self.embed(b))
            .unwrap_or(0.0)
            .max(0.0)
    }
}
