//! Training coordinator: owns the crawl → chunk → embed → swap pipeline.
//!
//! One training run per user at a time. Starting a new run cancels the
//! previous one cooperatively: the old task observes its [`CancelFlag`]
//! between pages and between embedding batches, stops, and never swaps a
//! partially built collection live. Status updates are guarded by source ID
//! so a superseded run cannot clobber its replacement's record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::chunker::chunk_pages;
use crate::collection::CollectionManager;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::EngineError;
use crate::fetch::{crawl_site, validate_origin, TextFetcher};
use crate::models::{EmbeddedChunk, KnowledgeSource, Page, TrainingStatus};
use crate::session::SessionState;
use crate::store::KvStore;

/// Cooperative cancellation token shared between a training job and its
/// pipeline task.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Content hash over a crawl's normalized pages.
///
/// Pages are sorted by URL first, so the hash is independent of crawl
/// order. An unchanged site re-trains to the same hash and skips
/// re-embedding entirely.
pub fn content_hash(pages: &[Page]) -> String {
    let mut sorted: Vec<&Page> = pages.iter().collect();
    sorted.sort_by(|a, b| a.url.cmp(&b.url));

    let mut hasher = Sha256::new();
    for page in sorted {
        hasher.update(page.url.as_bytes());
        hasher.update([0u8]);
        hasher.update(page.text.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// In-memory registry of each user's current knowledge source record.
pub struct SourceRegistry {
    current: RwLock<HashMap<String, KnowledgeSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<KnowledgeSource> {
        self.current.read().unwrap().get(user_id).cloned()
    }

    pub fn insert(&self, record: KnowledgeSource) {
        self.current
            .write()
            .unwrap()
            .insert(record.user_id.clone(), record);
    }

    /// Mutate a user's record only if it still belongs to `source_id`.
    ///
    /// Returns the updated record, or `None` when the record was superseded
    /// by a newer run.
    pub fn update_if_current(
        &self,
        user_id: &str,
        source_id: &str,
        apply: impl FnOnce(&mut KnowledgeSource),
    ) -> Option<KnowledgeSource> {
        let mut current = self.current.write().unwrap();
        match current.get_mut(user_id) {
            Some(record) if record.source_id == source_id => {
                apply(record);
                Some(record.clone())
            }
            _ => None,
        }
    }

    pub fn remove(&self, user_id: &str) -> Option<KnowledgeSource> {
        self.current.write().unwrap().remove(user_id)
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct TrainingJob {
    source_id: String,
    cancel: CancelFlag,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

fn source_key(user_id: &str) -> String {
    format!("source:{}", user_id)
}

/// Drives training runs and owns the per-user job table.
pub struct TrainingCoordinator {
    config: Config,
    fetcher: Arc<dyn TextFetcher>,
    embedder: Arc<dyn Embedder>,
    collections: Arc<CollectionManager>,
    sessions: Arc<SessionState>,
    registry: Arc<SourceRegistry>,
    kv: Arc<dyn KvStore>,
    jobs: Mutex<HashMap<String, TrainingJob>>,
}

impl TrainingCoordinator {
    pub fn new(
        config: Config,
        fetcher: Arc<dyn TextFetcher>,
        embedder: Arc<dyn Embedder>,
        collections: Arc<CollectionManager>,
        sessions: Arc<SessionState>,
        registry: Arc<SourceRegistry>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            config,
            fetcher,
            embedder,
            collections,
            sessions,
            registry,
            kv,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) training a user's knowledge source.
    ///
    /// Validates the origin URL, registers a fresh `Pending` record, cancels
    /// any run already in flight for the user, and spawns the pipeline.
    /// Returns the new record immediately; progress is observed via
    /// [`status`](Self::status).
    pub async fn start_training(
        self: &Arc<Self>,
        user_id: &str,
        raw_url: &str,
    ) -> Result<KnowledgeSource, EngineError> {
        let origin = validate_origin(raw_url)?;

        // Snapshot the previous record before replacing it; the pipeline
        // compares content hashes against it for the idempotent path.
        let previous = self.registry.get(user_id);

        let record = KnowledgeSource::new(user_id, origin.as_str());
        self.registry.insert(record.clone());
        self.persist(&record).await;

        let cancel = CancelFlag::new();
        let this = Arc::clone(self);
        let source_id = record.source_id.clone();
        let user = user_id.to_string();
        let pipeline_cancel = cancel.clone();

        // The job entry must be visible before the pipeline task can run its
        // still-current check, so it is registered under the same lock.
        {
            let mut jobs = self.jobs.lock().unwrap();
            let handle = tokio::spawn(async move {
                this.run_pipeline(&user, &source_id, origin, previous, pipeline_cancel)
                    .await;
            });
            let job = TrainingJob {
                source_id: record.source_id.clone(),
                cancel,
                handle,
            };
            if let Some(old) = jobs.insert(user_id.to_string(), job) {
                info!(user_id, old_source = %old.source_id, "cancelling superseded training run");
                old.cancel.cancel();
            }
        }

        Ok(record)
    }

    /// Current source record for a user, falling back to the persisted copy
    /// after a restart.
    pub async fn status(&self, user_id: &str) -> Option<KnowledgeSource> {
        if let Some(record) = self.registry.get(user_id) {
            return Some(record);
        }
        let value = self.kv.get(&source_key(user_id)).await.ok().flatten()?;
        let record: KnowledgeSource = serde_json::from_value(value).ok()?;
        self.registry.insert(record.clone());
        Some(record)
    }

    /// Cancel any in-flight run for a user. Used when forgetting a source.
    pub fn cancel_active(&self, user_id: &str) {
        if let Some(job) = self.jobs.lock().unwrap().remove(user_id) {
            job.cancel.cancel();
        }
    }

    /// Drop everything known about a user's source: the in-flight run, the
    /// live collection, and the persisted record.
    pub async fn forget(&self, user_id: &str) {
        self.cancel_active(user_id);
        self.collections.delete(user_id);
        self.registry.remove(user_id);
        if let Err(e) = self.kv.delete(&source_key(user_id)).await {
            warn!(user_id, error = %e, "failed to delete persisted source record");
        }
    }

    async fn run_pipeline(
        &self,
        user_id: &str,
        source_id: &str,
        origin: url::Url,
        previous: Option<KnowledgeSource>,
        cancel: CancelFlag,
    ) {
        match self
            .train(user_id, source_id, &origin, previous, &cancel)
            .await
        {
            Ok(()) => {}
            Err(EngineError::Cancelled) => {
                info!(user_id, source_id, "training run cancelled");
                self.mark_failed(user_id, source_id, "cancelled").await;
            }
            Err(e) => {
                warn!(user_id, source_id, error = %e, "training run failed");
                self.mark_failed(user_id, source_id, e.category()).await;
            }
        }
    }

    async fn train(
        &self,
        user_id: &str,
        source_id: &str,
        origin: &url::Url,
        previous: Option<KnowledgeSource>,
        cancel: &CancelFlag,
    ) -> Result<(), EngineError> {
        self.set_status(user_id, source_id, TrainingStatus::Crawling)
            .await;

        let outcome = crawl_site(self.fetcher.as_ref(), &self.config.crawl, origin, cancel).await?;
        info!(
            user_id,
            source_id,
            pages = outcome.pages.len(),
            skipped = outcome.skipped.len(),
            "crawl complete"
        );

        let hash = content_hash(&outcome.pages);

        // Idempotent path: unchanged content re-confirms the existing
        // collection without re-embedding or swapping.
        if let Some(prev) = &previous {
            let unchanged = prev.status == TrainingStatus::Ready
                && prev.origin_url == origin.as_str()
                && prev.content_hash == hash;
            let live_matches = self
                .collections
                .live_handle(user_id)
                .map(|h| h.source_id() == prev.source_id)
                .unwrap_or(false);
            if unchanged && live_matches {
                info!(user_id, source_id, "content unchanged, re-confirming existing collection");
                if let Err(e) = self.sessions.set_active_source(user_id, &prev.source_id).await {
                    warn!(user_id, error = %e, "failed to update session mode after training");
                }
                let mut reconfirmed = prev.clone();
                reconfirmed.trained_at = Some(Utc::now());
                let updated = self
                    .registry
                    .update_if_current(user_id, source_id, |record| *record = reconfirmed.clone());
                if let Some(record) = updated {
                    self.persist(&record).await;
                }
                return Ok(());
            }
        }

        let max_total = self.config.limits.max_chunks_per_source;
        let chunks = chunk_pages(source_id, &outcome.pages, &self.config.chunking, max_total);
        if chunks.len() == max_total {
            warn!(user_id, source_id, max_total, "chunk cap reached, corpus truncated");
        }
        if chunks.is_empty() {
            return Err(EngineError::FetchFailed {
                url: origin.to_string(),
            });
        }

        self.set_status(user_id, source_id, TrainingStatus::Embedding)
            .await;

        let collection = self.collections.create_empty(source_id);
        for batch in chunks.chunks(self.config.embedding.batch_size) {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            let embedded: Vec<EmbeddedChunk> = batch
                .iter()
                .cloned()
                .zip(vectors)
                .map(|(chunk, embedding)| EmbeddedChunk { chunk, embedding })
                .collect();
            self.collections.upsert(&collection, embedded);
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // A newer run may have replaced this job while the embeddings were
        // in flight; if so, the built collection is discarded unswapped.
        let still_current = self
            .jobs
            .lock()
            .unwrap()
            .get(user_id)
            .map(|job| job.source_id == source_id)
            .unwrap_or(false);
        if !still_current {
            return Err(EngineError::Cancelled);
        }

        if let Err(e) = self.collections.swap_live(user_id, collection) {
            error!(user_id, source_id, error = %e, "live collection swap conflict");
            return Err(e);
        }

        // Mode flips before the record reads Ready, so a Ready status always
        // implies grounded answering is on.
        if let Err(e) = self.sessions.set_active_source(user_id, source_id).await {
            warn!(user_id, error = %e, "failed to update session mode after training");
        }

        let updated = self.registry.update_if_current(user_id, source_id, |record| {
            record.status = TrainingStatus::Ready;
            record.content_hash = hash.clone();
            record.trained_at = Some(Utc::now());
        });
        if let Some(record) = updated {
            self.persist(&record).await;
        }

        info!(user_id, source_id, "training complete");
        Ok(())
    }

    async fn set_status(&self, user_id: &str, source_id: &str, status: TrainingStatus) {
        let updated = self
            .registry
            .update_if_current(user_id, source_id, |record| record.status = status);
        if let Some(record) = updated {
            self.persist(&record).await;
        }
    }

    async fn mark_failed(&self, user_id: &str, source_id: &str, reason: &str) {
        self.set_status(user_id, source_id, TrainingStatus::Failed(reason.to_string()))
            .await;
    }

    async fn persist(&self, record: &KnowledgeSource) {
        let value = match serde_json::to_value(record) {
            Ok(v) => v,
            Err(e) => {
                warn!(user_id = %record.user_id, error = %e, "failed to serialize source record");
                return;
            }
        };
        if let Err(e) = self.kv.put(&source_key(&record.user_id), &value).await {
            warn!(user_id = %record.user_id, error = %e, "failed to persist source record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_content_hash_ignores_crawl_order() {
        let a = Page {
            url: "https://x/a".into(),
            text: "alpha".into(),
        };
        let b = Page {
            url: "https://x/b".into(),
            text: "beta".into(),
        };
        assert_eq!(
            content_hash(&[a.clone(), b.clone()]),
            content_hash(&[b, a])
        );
    }

    #[test]
    fn test_content_hash_changes_with_text() {
        let a = Page {
            url: "https://x/a".into(),
            text: "alpha".into(),
        };
        let mut b = a.clone();
        b.text = "alpha edited".into();
        assert_ne!(content_hash(&[a]), content_hash(&[b]));
    }

    #[test]
    fn test_registry_guards_superseded_updates() {
        let registry = SourceRegistry::new();
        let first = KnowledgeSource::new("u1", "https://example.com");
        let first_id = first.source_id.clone();
        registry.insert(first);

        let second = KnowledgeSource::new("u1", "https://example.com");
        let second_id = second.source_id.clone();
        registry.insert(second);

        // The superseded run's update is a no-op.
        assert!(registry
            .update_if_current("u1", &first_id, |r| r.status = TrainingStatus::Ready)
            .is_none());
        assert_eq!(registry.get("u1").unwrap().status, TrainingStatus::Pending);

        assert!(registry
            .update_if_current("u1", &second_id, |r| r.status = TrainingStatus::Ready)
            .is_some());
        assert_eq!(registry.get("u1").unwrap().status, TrainingStatus::Ready);
    }
}
