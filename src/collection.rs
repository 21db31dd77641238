//! Per-user vector collections with atomic live-pointer swap.
//!
//! A [`VectorCollection`] indexes the embedded chunks of one knowledge
//! source. The [`CollectionManager`] owns the per-user live pointer — the
//! only state shared between the query path (reads) and the training path
//! (builds a fresh collection, then swaps). Handles are `Arc`s: an in-flight
//! search keeps its collection alive until it finishes, so a swap never
//! tears a read and a superseded collection is freed once the last
//! reference drops.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::embedding::cosine_similarity;
use crate::error::EngineError;
use crate::models::{EmbeddedChunk, ScoredChunk};

/// Shared handle to one source's vector collection.
pub type CollectionHandle = Arc<VectorCollection>;

/// An indexed set of (chunk, embedding) pairs for one knowledge source.
#[derive(Debug)]
pub struct VectorCollection {
    source_id: String,
    entries: RwLock<Vec<EmbeddedChunk>>,
}

impl VectorCollection {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunk IDs in ordinal order. Used to compare chunk sets across runs.
    pub fn chunk_ids(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap();
        let mut ids: Vec<(usize, String)> = entries
            .iter()
            .map(|e| (e.chunk.ordinal, e.chunk.chunk_id.clone()))
            .collect();
        ids.sort_by_key(|(ordinal, _)| *ordinal);
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

/// Owns per-user live collections and is the sole mutator of their contents.
pub struct CollectionManager {
    live: RwLock<HashMap<String, CollectionHandle>>,
}

impl CollectionManager {
    pub fn new() -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Create a fresh, empty collection for a source being trained.
    ///
    /// The handle is not visible to queries until [`swap_live`](Self::swap_live).
    pub fn create_empty(&self, source_id: &str) -> CollectionHandle {
        Arc::new(VectorCollection {
            source_id: source_id.to_string(),
            entries: RwLock::new(Vec::new()),
        })
    }

    /// Insert embedded chunks into a collection, idempotent by chunk ID.
    pub fn upsert(&self, handle: &CollectionHandle, chunks: Vec<EmbeddedChunk>) {
        let mut entries = handle.entries.write().unwrap();
        for incoming in chunks {
            match entries
                .iter_mut()
                .find(|e| e.chunk.chunk_id == incoming.chunk.chunk_id)
            {
                Some(existing) => *existing = incoming,
                None => entries.push(incoming),
            }
        }
    }

    /// Similarity search over one collection.
    ///
    /// Results are ordered by descending score, ties broken by ascending
    /// ordinal; entries below `min_score` are excluded.
    pub fn search(
        &self,
        handle: &CollectionHandle,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Vec<ScoredChunk> {
        let entries = handle.entries.read().unwrap();
        let mut hits: Vec<ScoredChunk> = entries
            .iter()
            .map(|e| ScoredChunk {
                chunk: e.chunk.clone(),
                score: cosine_similarity(query, &e.embedding),
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.ordinal.cmp(&b.chunk.ordinal))
        });
        hits.truncate(top_k);
        hits
    }

    /// The collection currently served for a user's queries, if any.
    pub fn live_handle(&self, user_id: &str) -> Option<CollectionHandle> {
        self.live.read().unwrap().get(user_id).cloned()
    }

    /// Atomically make `new` the live collection for a user.
    ///
    /// Returns the superseded handle so the caller can drop it. In-flight
    /// searches that already cloned the old handle complete against the old
    /// data. A swap that targets the same source as the current live
    /// collection but with a different handle is an invariant breach: a
    /// re-train always mints a fresh source ID, and the idempotent path
    /// never swaps at all.
    pub fn swap_live(
        &self,
        user_id: &str,
        new: CollectionHandle,
    ) -> Result<Option<CollectionHandle>, EngineError> {
        let mut live = self.live.write().unwrap();
        if let Some(current) = live.get(user_id) {
            if current.source_id() == new.source_id() && !Arc::ptr_eq(current, &new) {
                return Err(EngineError::CollectionSwapConflict {
                    user_id: user_id.to_string(),
                });
            }
        }
        let old = live.insert(user_id.to_string(), new);
        info!(user_id, "live collection swapped");
        Ok(old)
    }

    /// Release a user's live collection.
    ///
    /// Memory is reclaimed once the last in-flight reference drops.
    pub fn delete(&self, user_id: &str) -> Option<CollectionHandle> {
        self.live.write().unwrap().remove(user_id)
    }
}

impl Default for CollectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentChunk;

    fn embedded(source_id: &str, ordinal: usize, text: &str, embedding: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: DocumentChunk {
                chunk_id: format!("{}-{}", source_id, ordinal),
                source_id: source_id.to_string(),
                page_url: format!("https://site.test/{}", ordinal),
                ordinal,
                text: text.to_string(),
            },
            embedding,
        }
    }

    #[test]
    fn test_search_orders_by_score_then_ordinal() {
        let manager = CollectionManager::new();
        let handle = manager.create_empty("s1");
        manager.upsert(
            &handle,
            vec![
                embedded("s1", 0, "far", vec![0.0, 1.0]),
                // Two chunks with identical score, later ordinal first in
                // insertion order to exercise the tie-break.
                embedded("s1", 5, "tie-late", vec![1.0, 0.0]),
                embedded("s1", 2, "tie-early", vec![1.0, 0.0]),
            ],
        );

        let hits = manager.search(&handle, &[1.0, 0.0], 10, -1.0);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].chunk.ordinal, 2);
        assert_eq!(hits[1].chunk.ordinal, 5);
        assert_eq!(hits[2].chunk.text, "far");
        assert!(hits[0].score >= hits[1].score && hits[1].score >= hits[2].score);
    }

    #[test]
    fn test_search_min_score_and_top_k() {
        let manager = CollectionManager::new();
        let handle = manager.create_empty("s1");
        manager.upsert(
            &handle,
            vec![
                embedded("s1", 0, "hit", vec![1.0, 0.0]),
                embedded("s1", 1, "near", vec![0.9, 0.4]),
                embedded("s1", 2, "orthogonal", vec![0.0, 1.0]),
            ],
        );

        let hits = manager.search(&handle, &[1.0, 0.0], 10, 0.5);
        assert_eq!(hits.len(), 2);

        let hits = manager.search(&handle, &[1.0, 0.0], 1, 0.5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.text, "hit");
    }

    #[test]
    fn test_upsert_idempotent_by_chunk_id() {
        let manager = CollectionManager::new();
        let handle = manager.create_empty("s1");
        let chunk = embedded("s1", 0, "once", vec![1.0, 0.0]);
        manager.upsert(&handle, vec![chunk.clone()]);
        manager.upsert(&handle, vec![chunk]);
        assert_eq!(handle.len(), 1);
    }

    #[test]
    fn test_swap_returns_old_and_serves_new() {
        let manager = CollectionManager::new();
        let first = manager.create_empty("s1");
        manager.upsert(&first, vec![embedded("s1", 0, "old", vec![1.0, 0.0])]);
        assert!(manager.swap_live("u1", first.clone()).unwrap().is_none());

        let second = manager.create_empty("s2");
        manager.upsert(&second, vec![embedded("s2", 0, "new", vec![1.0, 0.0])]);
        let old = manager.swap_live("u1", second).unwrap().unwrap();
        assert_eq!(old.source_id(), "s1");
        assert_eq!(
            manager.live_handle("u1").unwrap().source_id(),
            "s2"
        );
    }

    #[test]
    fn test_in_flight_handle_survives_swap() {
        let manager = CollectionManager::new();
        let first = manager.create_empty("s1");
        manager.upsert(&first, vec![embedded("s1", 0, "old", vec![1.0, 0.0])]);
        manager.swap_live("u1", first).unwrap();

        // Query path: grab the handle as an ask() would.
        let held = manager.live_handle("u1").unwrap();

        let second = manager.create_empty("s2");
        manager.upsert(&second, vec![embedded("s2", 0, "new", vec![1.0, 0.0])]);
        drop(manager.swap_live("u1", second).unwrap());

        // The held handle still answers entirely from the old collection.
        let hits = manager.search(&held, &[1.0, 0.0], 10, -1.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.source_id, "s1");
    }

    #[test]
    fn test_same_source_different_handle_is_conflict() {
        let manager = CollectionManager::new();
        let first = manager.create_empty("s1");
        manager.swap_live("u1", first).unwrap();

        let rogue = manager.create_empty("s1");
        let err = manager.swap_live("u1", rogue).unwrap_err();
        assert!(matches!(err, EngineError::CollectionSwapConflict { .. }));
        // Previous live collection untouched.
        assert_eq!(manager.live_handle("u1").unwrap().source_id(), "s1");
    }

    #[test]
    fn test_delete_releases_live() {
        let manager = CollectionManager::new();
        let handle = manager.create_empty("s1");
        manager.swap_live("u1", handle).unwrap();
        assert!(manager.delete("u1").is_some());
        assert!(manager.live_handle("u1").is_none());
    }
}
