//! Configuration parsing and validation.
//!
//! askapi is configured with a TOML file (default `./config/askapi.toml`).
//! Every section and key is optional; missing values take the defaults
//! below. The resulting [`Config`] is built once in `main` and passed by
//! reference to every component.
//!
//! ```toml
//! [storage]
//! db_path = "./data/askapi.sqlite"
//! cache_dir = "./data/cache"
//!
//! [llm]
//! primary = "openai"          # openai | ollama
//! fallback = "ollama"         # ollama | openai | none
//! openai_model = "gpt-4o-mini"
//! ollama_model = "llama3"
//!
//! [embedding]
//! provider = "openai"         # openai | ollama | local
//! fallback = "local"          # local | ollama | openai | none
//!
//! [indexing]
//! views = ["summary", "question", "example"]
//! concurrency = 4
//!
//! [retrieval]
//! top_k = 8
//! min_score = 0.25
//!
//! [server]
//! bind = "127.0.0.1:7860"
//! ```
//!
//! `OPENAI_API_KEY` is read from the environment inside [`load_config`]
//! and nowhere else.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use askapi_core::model::ViewKind;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub indexing: IndexingConfig,
    pub retrieval: RetrievalConfig,
    pub server: ServerConfig,
    /// Secrets taken from the environment, never from the file.
    #[serde(skip)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub openai_api_key: Option<String>,
}

impl Credentials {
    fn from_env() -> Self {
        Self {
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/askapi.sqlite"),
            cache_dir: PathBuf::from("./data/cache"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub primary: String,
    pub fallback: String,
    pub openai_model: String,
    pub openai_url: String,
    pub ollama_model: String,
    pub ollama_url: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            primary: "openai".to_string(),
            fallback: "ollama".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            openai_url: "https://api.openai.com/v1".to_string(),
            ollama_model: "llama3".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            temperature: 0.0,
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub fallback: String,
    /// Model name; defaults per provider (see [`EmbeddingConfig::model_for`]).
    pub model: Option<String>,
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible or Ollama endpoint).
    pub url: Option<String>,
    pub batch_size: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            fallback: "local".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 32,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl EmbeddingConfig {
    /// Model name and dimensionality for `provider`.
    ///
    /// The explicit `model`/`dims` keys apply to the primary provider only;
    /// a fallback provider always uses its own defaults.
    pub fn model_for(&self, provider: &str) -> (String, usize) {
        let (default_model, default_dims) = match provider {
            "openai" => ("text-embedding-3-small", 1536),
            "ollama" => ("nomic-embed-text", 768),
            _ => ("multilingual-e5-base", 768),
        };
        if provider == self.provider {
            let model = self.model.clone().unwrap_or_else(|| default_model.to_string());
            let dims = self
                .dims
                .unwrap_or_else(|| known_dims(&model).unwrap_or(default_dims));
            (model, dims)
        } else {
            (default_model.to_string(), default_dims)
        }
    }
}

fn known_dims(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        "all-minilm-l6-v2" | "bge-small-en-v1.5" | "multilingual-e5-small" => Some(384),
        "bge-base-en-v1.5" | "multilingual-e5-base" | "nomic-embed-text" => Some(768),
        "bge-large-en-v1.5" | "multilingual-e5-large" => Some(1024),
        _ => None,
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexingConfig {
    pub views: Vec<String>,
    pub concurrency: usize,
    pub fetch_timeout_secs: u64,
    /// Treat unreachable references as fatal.
    pub strict_refs: bool,
    /// Require an `openapi`/`swagger` version and a `paths` object.
    pub validate: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            views: vec![
                "summary".to_string(),
                "question".to_string(),
                "example".to_string(),
            ],
            concurrency: 4,
            fetch_timeout_secs: 20,
            strict_refs: false,
            validate: true,
        }
    }
}

impl IndexingConfig {
    /// Parsed view kinds, in configured order, without duplicates.
    pub fn view_kinds(&self) -> Result<Vec<ViewKind>> {
        parse_view_kinds(&self.views)
    }
}

/// Parse view kind names, rejecting unknown ones and `metadata`.
pub fn parse_view_kinds(names: &[String]) -> Result<Vec<ViewKind>> {
    let mut kinds = Vec::new();
    for name in names {
        let kind: ViewKind = name.parse().map_err(anyhow::Error::msg)?;
        if kind == ViewKind::Metadata {
            bail!("view kind 'metadata' is the fallback view and cannot be requested");
        }
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_score: f32,
    pub max_context_operations: usize,
    pub history_turns: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            min_score: 0.25,
            max_context_operations: 5,
            history_turns: 6,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_document_chars: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7860".to_string(),
            max_document_chars: 50_000,
        }
    }
}

impl Config {
    /// Parse and validate TOML text. Credentials are left empty.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.llm.primary.as_str() {
            "openai" | "ollama" => {}
            other => bail!(
                "Unknown llm.primary: '{}'. Must be openai or ollama.",
                other
            ),
        }
        match self.llm.fallback.as_str() {
            "openai" | "ollama" | "none" => {}
            other => bail!(
                "Unknown llm.fallback: '{}'. Must be openai, ollama, or none.",
                other
            ),
        }
        match self.embedding.provider.as_str() {
            "openai" | "ollama" | "local" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be openai, ollama, or local.",
                other
            ),
        }
        match self.embedding.fallback.as_str() {
            "openai" | "ollama" | "local" | "none" => {}
            other => bail!(
                "Unknown embedding.fallback: '{}'. Must be openai, ollama, local, or none.",
                other
            ),
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if self.indexing.concurrency == 0 {
            bail!("indexing.concurrency must be > 0");
        }
        if self.indexing.views.is_empty() {
            bail!("indexing.views must name at least one view kind");
        }
        self.indexing.view_kinds()?;
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.min_score) {
            bail!("retrieval.min_score must be in [-1.0, 1.0]");
        }
        if self.retrieval.max_context_operations == 0 {
            bail!("retrieval.max_context_operations must be >= 1");
        }
        Ok(())
    }
}

/// Read, parse and validate a config file, then attach credentials.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config = Config::from_toml_str(&content)?;
    config.credentials = Credentials::from_env();
    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        return load_config(path);
    }
    let config = Config {
        credentials: Credentials::from_env(),
        ..Config::default()
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.llm.openai_model, "gpt-4o-mini");
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.server.bind, "127.0.0.1:7860");
        assert_eq!(config.server.max_document_chars, 50_000);
        assert_eq!(
            config.indexing.view_kinds().unwrap(),
            vec![ViewKind::Summary, ViewKind::Question, ViewKind::Example]
        );
        assert!(config.credentials.openai_api_key.is_none());
    }

    #[test]
    fn test_partial_section() {
        let config = Config::from_toml_str(
            r#"
            [indexing]
            views = ["summary"]
            concurrency = 2

            [retrieval]
            min_score = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.indexing.concurrency, 2);
        assert_eq!(config.indexing.fetch_timeout_secs, 20);
        assert_eq!(config.retrieval.min_score, 0.5);
        assert_eq!(config.retrieval.top_k, 8);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(Config::from_toml_str("[indexing]\nconcurrency = 0").is_err());
        assert!(Config::from_toml_str("[indexing]\nviews = []").is_err());
        assert!(Config::from_toml_str("[indexing]\nviews = [\"poem\"]").is_err());
        assert!(Config::from_toml_str("[indexing]\nviews = [\"metadata\"]").is_err());
        assert!(Config::from_toml_str("[retrieval]\ntop_k = 0").is_err());
        assert!(Config::from_toml_str("[retrieval]\nmin_score = 1.5").is_err());
        assert!(Config::from_toml_str("[llm]\nprimary = \"claude\"").is_err());
        assert!(Config::from_toml_str("[embedding]\nprovider = \"bert\"").is_err());
        assert!(Config::from_toml_str("[embedding]\nbatch_size = 0").is_err());
    }

    #[test]
    fn test_embedding_model_defaults() {
        let config = EmbeddingConfig::default();
        assert_eq!(
            config.model_for("openai"),
            ("text-embedding-3-small".to_string(), 1536)
        );
        assert_eq!(
            config.model_for("local"),
            ("multilingual-e5-base".to_string(), 768)
        );

        let custom = EmbeddingConfig {
            provider: "local".into(),
            model: Some("bge-small-en-v1.5".into()),
            ..EmbeddingConfig::default()
        };
        assert_eq!(custom.model_for("local"), ("bge-small-en-v1.5".to_string(), 384));
    }

    #[test]
    fn test_missing_default_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.retrieval.top_k, 8);
        assert!(load_config(&dir.path().join("absent.toml")).is_err());
    }
}
