//! AI backend abstractions: text generation and embeddings.
//!
//! The worker and agent depend on these traits rather than a concrete
//! client, so tests substitute deterministic fakes and the HTTP backend can
//! be swapped without touching the pipeline.

pub mod openai;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("ai request failed: {0}")]
    Request(String),
    #[error("ai response malformed: {0}")]
    Malformed(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Produces a completion for a system instruction plus user prompt.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, AiError>;
}

/// Produces a fixed-dimension embedding for a text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError>;

    /// Dimension every returned vector must have.
    fn dimension(&self) -> usize;
}
