//! Per-user conversation sessions and answer-mode state.
//!
//! Mode state (grounded answering on/off, which source backs it) is
//! persisted through the [`KvStore`] so it survives restarts. Chat history
//! is in-memory only: bounded to `max_turns` per user and evicted after
//! `idle_timeout_secs` of inactivity.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::store::KvStore;

/// How a user's questions are answered.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ModeState {
    /// When true, answers are grounded in the user's live collection.
    pub rag_enabled: bool,
    /// The knowledge source backing grounded answers, once one is ready.
    pub active_source_id: Option<String>,
}

/// One question/answer exchange.
#[derive(Debug, Clone)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

struct ChatSession {
    turns: VecDeque<Turn>,
    last_active: Instant,
}

/// Owns per-user mode state and conversation history.
pub struct SessionState {
    kv: Arc<dyn KvStore>,
    config: SessionConfig,
    // Caches are guarded by std locks and never held across an await.
    modes: RwLock<HashMap<String, ModeState>>,
    chats: RwLock<HashMap<String, ChatSession>>,
}

fn mode_key(user_id: &str) -> String {
    format!("mode:{}", user_id)
}

impl SessionState {
    pub fn new(kv: Arc<dyn KvStore>, config: SessionConfig) -> Self {
        Self {
            kv,
            config,
            modes: RwLock::new(HashMap::new()),
            chats: RwLock::new(HashMap::new()),
        }
    }

    /// Current mode for a user, loading persisted state on first access.
    pub async fn mode(&self, user_id: &str) -> Result<ModeState> {
        if let Some(mode) = self.modes.read().unwrap().get(user_id).cloned() {
            return Ok(mode);
        }

        let mode = match self.kv.get(&mode_key(user_id)).await? {
            Some(value) => serde_json::from_value(value)?,
            None => ModeState::default(),
        };
        self.modes
            .write()
            .unwrap()
            .insert(user_id.to_string(), mode.clone());
        Ok(mode)
    }

    /// Toggle grounded answering. Enabling without a trained source is
    /// allowed; the orchestrator falls back to plain answers until one is
    /// ready.
    pub async fn set_rag_enabled(&self, user_id: &str, enabled: bool) -> Result<ModeState> {
        let mut mode = self.mode(user_id).await?;
        mode.rag_enabled = enabled;
        self.store_mode(user_id, mode.clone()).await?;
        Ok(mode)
    }

    /// Record a newly trained source and enable grounded answering.
    pub async fn set_active_source(&self, user_id: &str, source_id: &str) -> Result<()> {
        let mut mode = self.mode(user_id).await?;
        mode.active_source_id = Some(source_id.to_string());
        mode.rag_enabled = true;
        self.store_mode(user_id, mode).await
    }

    async fn store_mode(&self, user_id: &str, mode: ModeState) -> Result<()> {
        self.kv
            .put(&mode_key(user_id), &serde_json::to_value(&mode)?)
            .await?;
        self.modes
            .write()
            .unwrap()
            .insert(user_id.to_string(), mode);
        Ok(())
    }

    /// Append a completed exchange, bounding history to `max_turns`.
    pub fn record_turn(&self, user_id: &str, turn: Turn) {
        let mut chats = self.chats.write().unwrap();
        let session = chats.entry(user_id.to_string()).or_insert(ChatSession {
            turns: VecDeque::new(),
            last_active: Instant::now(),
        });
        if session.last_active.elapsed() >= self.idle_timeout() {
            session.turns.clear();
        }
        session.turns.push_back(turn);
        while session.turns.len() > self.config.max_turns {
            session.turns.pop_front();
        }
        session.last_active = Instant::now();
    }

    /// Conversation history for a user, oldest first. An idle session
    /// returns empty and is dropped.
    pub fn history(&self, user_id: &str) -> Vec<Turn> {
        let mut chats = self.chats.write().unwrap();
        match chats.get(user_id) {
            Some(session) if session.last_active.elapsed() < self.idle_timeout() => {
                session.turns.iter().cloned().collect()
            }
            Some(_) => {
                chats.remove(user_id);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Clear a user's conversation history. A soft reset: mode state and
    /// everything persisted survive.
    pub fn reset(&self, user_id: &str) {
        self.chats.write().unwrap().remove(user_id);
    }

    /// Drop all session state for a user, persisted mode included.
    pub async fn forget(&self, user_id: &str) -> Result<()> {
        self.chats.write().unwrap().remove(user_id);
        self.modes.write().unwrap().remove(user_id);
        self.kv.delete(&mode_key(user_id)).await
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    fn sessions(max_turns: usize, idle_secs: u64) -> SessionState {
        SessionState::new(
            Arc::new(MemoryKv::new()),
            SessionConfig {
                max_turns,
                idle_timeout_secs: idle_secs,
            },
        )
    }

    fn turn(n: usize) -> Turn {
        Turn {
            question: format!("q{}", n),
            answer: format!("a{}", n),
        }
    }

    #[tokio::test]
    async fn test_mode_defaults_off() {
        let state = sessions(20, 1800);
        let mode = state.mode("u1").await.unwrap();
        assert!(!mode.rag_enabled);
        assert!(mode.active_source_id.is_none());
    }

    #[tokio::test]
    async fn test_mode_persists_across_caches() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = SessionConfig {
            max_turns: 20,
            idle_timeout_secs: 1800,
        };

        let state = SessionState::new(kv.clone(), config.clone());
        state.set_active_source("u1", "s1").await.unwrap();

        // A fresh SessionState (fresh process) reloads from the store.
        let state = SessionState::new(kv, config);
        let mode = state.mode("u1").await.unwrap();
        assert!(mode.rag_enabled);
        assert_eq!(mode.active_source_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_history_bounded_to_max_turns() {
        let state = sessions(3, 1800);
        for n in 0..5 {
            state.record_turn("u1", turn(n));
        }
        let history = state.history("u1");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].question, "q2");
        assert_eq!(history[2].question, "q4");
    }

    #[tokio::test]
    async fn test_idle_session_evicted() {
        let state = sessions(20, 0);
        state.record_turn("u1", turn(0));
        assert!(state.history("u1").is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_history_but_keeps_mode() {
        let state = sessions(20, 1800);
        state.set_rag_enabled("u1", true).await.unwrap();
        state.record_turn("u1", turn(0));

        state.reset("u1");
        assert!(state.history("u1").is_empty());
        assert!(state.mode("u1").await.unwrap().rag_enabled);
    }

    #[tokio::test]
    async fn test_forget_clears_mode_too() {
        let state = sessions(20, 1800);
        state.set_rag_enabled("u1", true).await.unwrap();
        state.record_turn("u1", turn(0));

        state.forget("u1").await.unwrap();
        assert!(state.history("u1").is_empty());
        assert!(!state.mode("u1").await.unwrap().rag_enabled);
    }
}
