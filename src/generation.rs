//! Generation capability: prompt → answer text.
//!
//! The [`Generator`] trait mirrors [`Embedder`](crate::embedding::Embedder):
//! one provider per backend, retry with backoff inside the provider, and a
//! single category error ([`EngineError::GenerationUnavailable`]) for the
//! orchestrator to degrade on. With the default `max_retries = 1` a failing
//! call is retried exactly once before the error surfaces.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::GenerationConfig;
use crate::error::EngineError;

/// External generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    /// Generate answer text for an assembled prompt.
    async fn generate(&self, prompt: &str) -> Result<String, EngineError>;
}

/// Create the configured [`Generator`].
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

// ============ OpenAI ============

/// Chat-completion generator for the OpenAI API.
pub struct OpenAiGenerator {
    model: String,
    api_key: String,
    endpoint: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            api_key,
            endpoint: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, EngineError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().await.map_err(|e| {
                                EngineError::GenerationUnavailable {
                                    reason: format!("invalid response body: {}", e),
                                }
                            })?;
                        return parse_openai_completion(&json);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(format!("HTTP {}", status));
                        continue;
                    }
                    return Err(EngineError::GenerationUnavailable {
                        reason: format!("HTTP {}", status),
                    });
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(EngineError::GenerationUnavailable {
            reason: last_err.unwrap_or_else(|| "retries exhausted".to_string()),
        })
    }
}

fn parse_openai_completion(json: &serde_json::Value) -> Result<String, EngineError> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| EngineError::GenerationUnavailable {
            reason: "missing message content in response".to_string(),
        })
}

// ============ Ollama ============

/// Generator for a local or remote Ollama instance (`POST /api/generate`).
pub struct OllamaGenerator {
    model: String,
    endpoint: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            endpoint: format!("{}/api/generate", base.trim_end_matches('/')),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, EngineError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = self.client.post(&self.endpoint).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().await.map_err(|e| {
                                EngineError::GenerationUnavailable {
                                    reason: format!("invalid response body: {}", e),
                                }
                            })?;
                        return json
                            .get("response")
                            .and_then(|r| r.as_str())
                            .map(|s| s.to_string())
                            .ok_or_else(|| EngineError::GenerationUnavailable {
                                reason: "missing response field".to_string(),
                            });
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(format!("HTTP {}", status));
                        continue;
                    }
                    return Err(EngineError::GenerationUnavailable {
                        reason: format!("HTTP {}", status),
                    });
                }
                Err(e) => {
                    last_err = Some(format!("connection error: {}", e));
                    continue;
                }
            }
        }

        Err(EngineError::GenerationUnavailable {
            reason: last_err.unwrap_or_else(|| "retries exhausted".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_completion() {
        let json = serde_json::json!({
            "choices": [
                { "message": { "role": "assistant", "content": "Grounded answer." } }
            ]
        });
        assert_eq!(parse_openai_completion(&json).unwrap(), "Grounded answer.");
    }

    #[test]
    fn test_parse_missing_content_is_unavailable() {
        let err = parse_openai_completion(&serde_json::json!({"choices": []})).unwrap_err();
        assert!(matches!(err, EngineError::GenerationUnavailable { .. }));
    }
}
