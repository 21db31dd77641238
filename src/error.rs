//! Error taxonomy for the training and query pipelines.
//!
//! Per-page and per-batch failures are handled locally (skip or retry with
//! backoff) and never appear here; these variants are the category errors
//! that cross module boundaries and reach callers.

use thiserror::Error;

/// Errors surfaced by the engine facade and its pipelines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Every page in the crawl failed; nothing could be indexed.
    #[error("fetch failed: no pages could be retrieved from {url}")]
    FetchFailed { url: String },

    /// The URL is malformed, has an unsupported scheme, or points at a
    /// private/loopback host.
    #[error("invalid source: {reason}")]
    InvalidSource { reason: String },

    /// The embedding capability failed after its retries were exhausted.
    #[error("embedding unavailable: {reason}")]
    EmbeddingUnavailable { reason: String },

    /// The generation capability failed after its retries were exhausted.
    #[error("generation unavailable: {reason}")]
    GenerationUnavailable { reason: String },

    /// A training run attempted to swap a collection that no longer matches
    /// the run that built it. Invariant breach — must never surface from
    /// correct code.
    #[error("collection swap conflict for user {user_id}")]
    CollectionSwapConflict { user_id: String },

    /// The training run was superseded by a newer run and stopped at a
    /// checkpoint. Internal control flow, not a user-visible failure.
    #[error("training run cancelled")]
    Cancelled,

    /// Persistent store failure.
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    /// The reason category reported to users. Never internal detail.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::FetchFailed { .. } => "fetch failed",
            EngineError::InvalidSource { .. } => "invalid source",
            EngineError::EmbeddingUnavailable { .. } => "embedding unavailable",
            EngineError::GenerationUnavailable { .. } => "generation unavailable",
            EngineError::CollectionSwapConflict { .. } => "internal error",
            EngineError::Cancelled => "cancelled",
            EngineError::Store(_) => "store error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_hides_detail() {
        let err = EngineError::EmbeddingUnavailable {
            reason: "HTTP 500 from provider: secret-host".to_string(),
        };
        assert_eq!(err.category(), "embedding unavailable");
    }
}
