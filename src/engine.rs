//! Engine facade: wires capabilities together and exposes the public
//! operations — train, status, mode, ask, reset.

use std::sync::Arc;

use anyhow::Result;

use crate::collection::CollectionManager;
use crate::config::Config;
use crate::coordinator::{SourceRegistry, TrainingCoordinator};
use crate::embedding::{create_embedder, Embedder};
use crate::error::EngineError;
use crate::fetch::{HttpFetcher, TextFetcher};
use crate::generation::{create_generator, Generator};
use crate::models::{Answer, KnowledgeSource};
use crate::orchestrator::Orchestrator;
use crate::session::{ModeState, SessionState};
use crate::store::{KvStore, SqliteKv};

/// The external capabilities an engine runs on.
///
/// Production wiring comes from [`Engine::from_config`]; tests inject stubs.
pub struct Capabilities {
    pub fetcher: Arc<dyn TextFetcher>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub kv: Arc<dyn KvStore>,
}

pub struct Engine {
    coordinator: Arc<TrainingCoordinator>,
    orchestrator: Orchestrator,
    sessions: Arc<SessionState>,
}

impl Engine {
    /// Build an engine from a validated config and a capability set.
    pub fn new(config: Config, caps: Capabilities) -> Self {
        let collections = Arc::new(CollectionManager::new());
        let registry = Arc::new(SourceRegistry::new());
        let sessions = Arc::new(SessionState::new(caps.kv.clone(), config.session.clone()));

        let coordinator = Arc::new(TrainingCoordinator::new(
            config.clone(),
            caps.fetcher,
            caps.embedder.clone(),
            collections.clone(),
            sessions.clone(),
            registry.clone(),
            caps.kv,
        ));

        let orchestrator = Orchestrator::new(
            config,
            caps.embedder,
            caps.generator,
            collections,
            sessions.clone(),
            registry,
        );

        Self {
            coordinator,
            orchestrator,
            sessions,
        }
    }

    /// Production wiring: HTTP fetcher, configured providers, SQLite store.
    pub async fn from_config(config: Config) -> Result<Self> {
        let fetcher: Arc<dyn TextFetcher> = Arc::new(HttpFetcher::new(&config.crawl)?);
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::connect(&config.store.path).await?);

        Ok(Self::new(
            config,
            Capabilities {
                fetcher,
                embedder,
                generator,
                kv,
            },
        ))
    }

    /// Start (or restart) training a user's knowledge source from a website.
    pub async fn start_training(
        &self,
        user_id: &str,
        url: &str,
    ) -> Result<KnowledgeSource, EngineError> {
        self.coordinator.start_training(user_id, url).await
    }

    /// Current source record for a user, if any.
    pub async fn training_status(&self, user_id: &str) -> Option<KnowledgeSource> {
        self.coordinator.status(user_id).await
    }

    /// Toggle grounded answering for a user.
    pub async fn set_mode(&self, user_id: &str, enabled: bool) -> Result<ModeState> {
        self.sessions.set_rag_enabled(user_id, enabled).await
    }

    /// Answer one question for a user.
    pub async fn ask(&self, user_id: &str, question: &str) -> Result<Answer> {
        self.orchestrator.ask(user_id, question).await
    }

    /// Reset a user's conversation. Clears chat history only; the trained
    /// corpus, source record, and mode state all survive.
    pub fn reset(&self, user_id: &str) {
        self.sessions.reset(user_id);
    }

    /// Forget everything about a user: in-flight training, live collection,
    /// persisted source record, session history, and mode state.
    pub async fn forget(&self, user_id: &str) -> Result<()> {
        self.coordinator.forget(user_id).await;
        self.sessions.forget(user_id).await
    }
}
