//! Query orchestrator: mode dispatch, retrieval, prompt assembly.
//!
//! Every question takes one of three paths:
//! - **Grounded** — mode is on and a trained collection is live: retrieve,
//!   deduplicate, assemble a context prompt, answer with citations.
//! - **Plain** — mode is off or no collection is ready: answer from the
//!   model alone, no citations.
//! - **Degraded** — generation itself is unavailable after retries: a fixed
//!   retry message, never an error surfaced to the user.
//!
//! A retrieval-side failure (embedding down, nothing above the score
//! cutoff) downgrades the question to the plain path rather than failing it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::collection::CollectionManager;
use crate::config::Config;
use crate::coordinator::SourceRegistry;
use crate::embedding::{embed_query, Embedder};
use crate::error::EngineError;
use crate::generation::Generator;
use crate::models::{Answer, ScoredChunk, TrainingStatus};
use crate::session::{SessionState, Turn};

/// Answer shown when the generation capability stays down after retries.
pub const DEGRADED_ANSWER: &str =
    "The answer service is temporarily unavailable. Please try again in a moment.";

/// Characters of chunk text compared when filtering near-duplicates.
const DEDUP_PREFIX_CHARS: usize = 100;

pub struct Orchestrator {
    config: Config,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    collections: Arc<CollectionManager>,
    sessions: Arc<SessionState>,
    registry: Arc<SourceRegistry>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        collections: Arc<CollectionManager>,
        sessions: Arc<SessionState>,
        registry: Arc<SourceRegistry>,
    ) -> Self {
        Self {
            config,
            embedder,
            generator,
            collections,
            sessions,
            registry,
        }
    }

    /// Answer one question for a user.
    ///
    /// Only completed exchanges enter the conversation history; a degraded
    /// answer is never replayed as context in later prompts.
    pub async fn ask(&self, user_id: &str, question: &str) -> anyhow::Result<Answer> {
        let history = self.sessions.history(user_id);

        let generated = match self.retrieve_context(user_id, question).await {
            Some(hits) if !hits.is_empty() => {
                self.answer_grounded(question, &history, &hits).await
            }
            _ => self.answer_plain(question, &history).await,
        };

        let answer = match generated {
            Ok(answer) => {
                self.sessions.record_turn(
                    user_id,
                    Turn {
                        question: question.to_string(),
                        answer: answer.text.clone(),
                    },
                );
                answer
            }
            Err(e) => {
                warn!(user_id, error = %e, "generation failed, returning degraded answer");
                Answer::plain(DEGRADED_ANSWER.to_string())
            }
        };
        Ok(answer)
    }

    /// Retrieve deduplicated context chunks, or `None` when the question
    /// must take the plain path.
    async fn retrieve_context(&self, user_id: &str, question: &str) -> Option<Vec<ScoredChunk>> {
        let mode = match self.sessions.mode(user_id).await {
            Ok(mode) => mode,
            Err(e) => {
                warn!(user_id, error = %e, "failed to load mode state, answering plain");
                return None;
            }
        };
        if !mode.rag_enabled {
            return None;
        }

        let record = self.registry.get(user_id)?;
        if record.status != TrainingStatus::Ready {
            debug!(user_id, status = %record.status, "source not ready, answering plain");
            return None;
        }
        let handle = self.collections.live_handle(user_id)?;

        let query = match embed_query(self.embedder.as_ref(), question).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(user_id, error = %e, "query embedding failed, answering plain");
                return None;
            }
        };

        let retrieval = &self.config.retrieval;
        let candidates = self.collections.search(
            &handle,
            &query,
            retrieval.candidate_k,
            retrieval.min_score,
        );
        Some(dedup_candidates(candidates, retrieval.top_k))
    }

    async fn answer_grounded(
        &self,
        question: &str,
        history: &[Turn],
        hits: &[ScoredChunk],
    ) -> Result<Answer, EngineError> {
        let prompt = build_grounded_prompt(question, history, hits);
        let text = self.generator.generate(&prompt).await?;
        Ok(Answer {
            text,
            citations: citations(hits),
            grounded: true,
        })
    }

    async fn answer_plain(&self, question: &str, history: &[Turn]) -> Result<Answer, EngineError> {
        let prompt = build_plain_prompt(question, history);
        let text = self.generator.generate(&prompt).await?;
        Ok(Answer::plain(text))
    }
}

/// Drop near-duplicate hits, keeping the highest-ranked of each group.
///
/// Chunks whose first hundred characters match are treated as duplicates;
/// overlapping windows over the same passage routinely tie on score.
pub fn dedup_candidates(candidates: Vec<ScoredChunk>, top_k: usize) -> Vec<ScoredChunk> {
    let mut seen: Vec<String> = Vec::new();
    let mut unique = Vec::new();

    for hit in candidates {
        let prefix: String = hit.chunk.text.chars().take(DEDUP_PREFIX_CHARS).collect();
        if seen.contains(&prefix) {
            continue;
        }
        seen.push(prefix);
        unique.push(hit);
        if unique.len() == top_k {
            break;
        }
    }
    unique
}

/// Ordered, deduplicated page URLs backing a grounded answer.
pub fn citations(hits: &[ScoredChunk]) -> Vec<String> {
    let mut urls = Vec::new();
    for hit in hits {
        if !urls.contains(&hit.chunk.page_url) {
            urls.push(hit.chunk.page_url.clone());
        }
    }
    urls
}

fn push_history(prompt: &mut String, history: &[Turn]) {
    if history.is_empty() {
        return;
    }
    prompt.push_str("Conversation so far:\n");
    for turn in history {
        prompt.push_str("User: ");
        prompt.push_str(&turn.question);
        prompt.push('\n');
        prompt.push_str("Assistant: ");
        prompt.push_str(&turn.answer);
        prompt.push('\n');
    }
    prompt.push('\n');
}

/// Assemble the grounded prompt: context blocks first, then history, then
/// the question.
pub fn build_grounded_prompt(question: &str, history: &[Turn], hits: &[ScoredChunk]) -> String {
    let mut prompt = String::from(
        "You are a helpful assistant answering questions about a specific website. \
         Answer using only the context below. If the context does not contain \
         the answer, say so plainly instead of guessing.\n\nContext:\n",
    );
    for hit in hits {
        prompt.push_str("Source: ");
        prompt.push_str(&hit.chunk.page_url);
        prompt.push('\n');
        prompt.push_str(&hit.chunk.text);
        prompt.push_str("\n\n");
    }
    push_history(&mut prompt, history);
    prompt.push_str("Question: ");
    prompt.push_str(question);
    prompt
}

/// Assemble the plain prompt: persona, history, question. No context.
pub fn build_plain_prompt(question: &str, history: &[Turn]) -> String {
    let mut prompt = String::from(
        "You are a friendly, helpful assistant. Answer concisely and honestly; \
         say so when you are not sure.\n\n",
    );
    push_history(&mut prompt, history);
    prompt.push_str("Question: ");
    prompt.push_str(question);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentChunk;

    fn hit(ordinal: usize, url: &str, text: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: DocumentChunk {
                chunk_id: format!("c{}", ordinal),
                source_id: "s1".to_string(),
                page_url: url.to_string(),
                ordinal,
                text: text.to_string(),
            },
            score,
        }
    }

    #[test]
    fn test_dedup_keeps_highest_ranked_of_duplicates() {
        let shared: String = "same passage ".repeat(20);
        let candidates = vec![
            hit(0, "https://x/a", &shared, 0.9),
            hit(1, "https://x/a", &shared, 0.8),
            hit(2, "https://x/b", "a different passage of real length here", 0.7),
        ];
        let unique = dedup_candidates(candidates, 4);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].chunk.ordinal, 0);
        assert_eq!(unique[1].chunk.ordinal, 2);
    }

    #[test]
    fn test_dedup_respects_top_k() {
        let candidates = (0..8)
            .map(|n| hit(n, "https://x/p", &format!("distinct passage number {}", n), 0.5))
            .collect();
        assert_eq!(dedup_candidates(candidates, 4).len(), 4);
    }

    #[test]
    fn test_citations_unique_in_rank_order() {
        let hits = vec![
            hit(0, "https://x/b", "one", 0.9),
            hit(1, "https://x/a", "two", 0.8),
            hit(2, "https://x/b", "three", 0.7),
        ];
        assert_eq!(citations(&hits), vec!["https://x/b", "https://x/a"]);
    }

    #[test]
    fn test_grounded_prompt_contains_sources_and_instruction() {
        let hits = vec![hit(0, "https://x/docs", "Widgets ship in crates of twelve.", 0.9)];
        let prompt = build_grounded_prompt("How do widgets ship?", &[], &hits);
        assert!(prompt.contains("Source: https://x/docs"));
        assert!(prompt.contains("crates of twelve"));
        assert!(prompt.contains("does not contain"));
        assert!(prompt.ends_with("Question: How do widgets ship?"));
    }

    #[test]
    fn test_plain_prompt_includes_history() {
        let history = vec![Turn {
            question: "What is a widget?".to_string(),
            answer: "A small mechanical part.".to_string(),
        }];
        let prompt = build_plain_prompt("And a gadget?", &history);
        assert!(prompt.contains("User: What is a widget?"));
        assert!(prompt.contains("Assistant: A small mechanical part."));
        assert!(prompt.ends_with("Question: And a gadget?"));
    }
}
