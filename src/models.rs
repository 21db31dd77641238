//! Core data models for the training and query pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a knowledge source.
///
/// Transitions are driven by the training coordinator:
/// `Pending → Crawling → Embedding → Ready`, or `→ Failed` from any
/// non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason")]
pub enum TrainingStatus {
    Pending,
    Crawling,
    Embedding,
    Ready,
    /// Carries the failure category only, never internal detail.
    Failed(String),
}

impl TrainingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrainingStatus::Ready | TrainingStatus::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            TrainingStatus::Pending => "pending",
            TrainingStatus::Crawling => "crawling",
            TrainingStatus::Embedding => "embedding",
            TrainingStatus::Ready => "ready",
            TrainingStatus::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingStatus::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// A crawled website corpus for one user.
///
/// A user has at most one live source at a time; a re-train produces a
/// fresh record with a new `source_id` unless the content hash is
/// unchanged, in which case the existing record is re-confirmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub source_id: String,
    pub user_id: String,
    pub origin_url: String,
    pub status: TrainingStatus,
    /// SHA-256 over the normalized fetched content, for idempotent re-training.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub trained_at: Option<DateTime<Utc>>,
}

impl KnowledgeSource {
    pub fn new(user_id: &str, origin_url: &str) -> Self {
        Self {
            source_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            origin_url: origin_url.to_string(),
            status: TrainingStatus::Pending,
            content_hash: String::new(),
            created_at: Utc::now(),
            trained_at: None,
        }
    }
}

/// One normalized page produced by the content fetcher.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub text: String,
}

/// A bounded span of page text; the unit of embedding and retrieval.
///
/// Immutable once created. The `chunk_id` is derived from the page URL,
/// ordinal, and text, so re-chunking identical input yields identical IDs.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub source_id: String,
    pub page_url: String,
    /// Position within the whole source, contiguous across pages in crawl
    /// order. Used as the ranking tie-breaker.
    pub ordinal: usize,
    pub text: String,
}

/// A chunk paired with its embedding, ready for indexing.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: DocumentChunk,
    pub embedding: Vec<f32>,
}

/// One retrieval hit, ranked by descending similarity.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// Final answer from the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    /// Ordered source page URLs the answer is grounded in. Empty in plain
    /// mode and in degraded responses.
    pub citations: Vec<String>,
    /// False when the answer was produced without retrieved context.
    pub grounded: bool,
}

impl Answer {
    pub fn plain(text: String) -> Self {
        Self {
            text,
            citations: Vec::new(),
            grounded: false,
        }
    }
}
