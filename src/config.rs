use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/sitewise.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    /// Maximum number of pages fetched per training run.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Maximum link depth from the origin URL (0 = origin page only).
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Pages whose cleaned text is shorter than this are skipped.
    #[serde(default = "default_min_page_chars")]
    pub min_page_chars: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            max_depth: default_max_depth(),
            page_timeout_secs: default_page_timeout_secs(),
            user_agent: default_user_agent(),
            min_page_chars: default_min_page_chars(),
        }
    }
}

fn default_max_pages() -> usize {
    12
}
fn default_max_depth() -> usize {
    2
}
fn default_page_timeout_secs() -> u64 {
    20
}
fn default_user_agent() -> String {
    "Sitewise/0.1 (+https://github.com/sitewise)".to_string()
}
fn default_min_page_chars() -> usize {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Upper bound on characters per chunk.
    #[serde(default = "default_max_chunk_len")]
    pub max_chunk_len: usize,
    /// Characters shared between consecutive chunks of the same page.
    #[serde(default = "default_overlap_len")]
    pub overlap_len: usize,
    /// Chunks shorter than this after trimming are dropped.
    #[serde(default = "default_min_chunk_len")]
    pub min_chunk_len: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_len: default_max_chunk_len(),
            overlap_len: default_overlap_len(),
            min_chunk_len: default_min_chunk_len(),
        }
    }
}

fn default_max_chunk_len() -> usize {
    1000
}
fn default_overlap_len() -> usize {
    50
}
fn default_min_chunk_len() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"` or `"ollama"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama host, or an OpenAI-compatible endpoint).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_embed_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embed_max_retries() -> u32 {
    3
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `"openai"` or `"ollama"`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Query-time generation retries once by default.
    #[serde(default = "default_gen_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_gen_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: None,
            max_retries: default_gen_max_retries(),
            timeout_secs: default_gen_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_gen_max_retries() -> u32 {
    1
}
fn default_gen_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Chunks included in the grounded prompt.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Chunks fetched before near-duplicate filtering.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Similarity cutoff; hits below this are excluded.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            min_score: default_min_score(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_candidate_k() -> usize {
    8
}
fn default_min_score() -> f32 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Turns of history kept per user.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Sessions idle longer than this are evicted.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_max_turns() -> usize {
    20
}
fn default_idle_timeout_secs() -> u64 {
    1800
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Upper bound on indexed chunks per knowledge source. The source still
    /// trains to Ready when truncated; the excess is logged and dropped.
    #[serde(default = "default_max_chunks_per_source")]
    pub max_chunks_per_source: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_chunks_per_source: default_max_chunks_per_source(),
        }
    }
}

fn default_max_chunks_per_source() -> usize {
    2000
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chunk_len == 0 {
        anyhow::bail!("chunking.max_chunk_len must be > 0");
    }
    if config.chunking.overlap_len >= config.chunking.max_chunk_len {
        anyhow::bail!("chunking.overlap_len must be < chunking.max_chunk_len");
    }
    if config.chunking.min_chunk_len > config.chunking.max_chunk_len {
        anyhow::bail!("chunking.min_chunk_len must be <= chunking.max_chunk_len");
    }

    if config.crawl.max_pages == 0 {
        anyhow::bail!("crawl.max_pages must be >= 1");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_k < config.retrieval.top_k {
        anyhow::bail!("retrieval.candidate_k must be >= retrieval.top_k");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_score) {
        anyhow::bail!("retrieval.min_score must be in [-1.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai or ollama.",
            other
        ),
    }
    if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
        anyhow::bail!(
            "embedding.dims must be > 0 for provider '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified for provider '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }

    match config.generation.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be openai or ollama.",
            other
        ),
    }
    if config.generation.model.is_none() {
        anyhow::bail!(
            "generation.model must be specified for provider '{}'",
            config.generation.provider
        );
    }

    if config.limits.max_chunks_per_source == 0 {
        anyhow::bail!("limits.max_chunks_per_source must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.embedding.model = Some("text-embedding-3-small".to_string());
        config.embedding.dims = Some(1536);
        config.generation.model = Some("gpt-4o-mini".to_string());
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chunking.max_chunk_len, 1000);
        assert_eq!(config.chunking.overlap_len, 50);
        assert_eq!(config.chunking.min_chunk_len, 50);
        assert_eq!(config.crawl.max_pages, 12);
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.session.max_turns, 20);
        assert_eq!(config.limits.max_chunks_per_source, 2000);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_overlap_must_be_less_than_chunk_len() {
        let mut config = valid_config();
        config.chunking.overlap_len = config.chunking.max_chunk_len;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut config = valid_config();
        config.embedding.provider = "gemini".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_dims_rejected() {
        let mut config = valid_config();
        config.embedding.dims = None;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_min_score_range() {
        let mut config = valid_config();
        config.retrieval.min_score = 1.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[store]
path = "/tmp/kb.sqlite"

[chunking]
max_chunk_len = 800
overlap_len = 40

[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 768

[generation]
provider = "ollama"
model = "llama3.1"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.chunking.max_chunk_len, 800);
        assert_eq!(config.embedding.provider, "ollama");
        assert_eq!(config.embedding.dims, Some(768));
        // Unspecified sections fall back to defaults.
        assert_eq!(config.retrieval.top_k, 4);
        assert!(validate(&config).is_ok());
    }
}
