//! Embedding providers.
//!
//! Concrete [`Embedder`] implementations:
//! - **[`OpenAIEmbedder`]**: `POST {openai_url}/embeddings`, batched, with retry and backoff.
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama instance.
//! - **[`LocalEmbedder`]**: fastembed on the CPU (feature `local-embeddings`);
//!   no network calls after the first model download.
//!
//! # Provider Selection
//!
//! [`create_embedder`] resolves `[embedding]` once at startup. Unlike chat,
//! embedding providers are never swapped per call: vectors from two models
//! live in different spaces, so the fallback is only used when the primary
//! cannot be constructed (e.g. OpenAI without `OPENAI_API_KEY`).
//!
//! | Config Value | Provider | Default model |
//! |-------------|----------|---------------|
//! | `"openai"` | [`OpenAIEmbedder`] | `text-embedding-3-small` (1536) |
//! | `"ollama"` | [`OllamaEmbedder`] | `nomic-embed-text` (768) |
//! | `"local"` | [`LocalEmbedder`] | `multilingual-e5-base` (768) |

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use askapi_core::embedding::Embedder;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::llm::post_json_with_retry;

/// Embed `texts` in chunks of `batch_size` through `embed_batch`, checking
/// that each batch returns one vector per input.
async fn embed_in_batches<'a, F, Fut>(
    texts: &'a [String],
    batch_size: usize,
    mut embed_batch: F,
) -> Result<Vec<Vec<f32>>>
where
    F: FnMut(&'a [String]) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<Vec<f32>>>>,
{
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embed_batch(batch).await?;
        if vectors.len() != batch.len() {
            bail!(
                "embedding provider returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            );
        }
        out.extend(vectors);
    }
    Ok(out)
}

fn parse_vector(value: &Value) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow!("embedding is not an array"))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ OpenAI ============

pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    endpoint: String,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &Config, model: String, dims: usize) -> Result<Self> {
        let api_key = config
            .credentials
            .openai_api_key
            .clone()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let emb = &config.embedding;
        let base = emb
            .url
            .as_deref()
            .filter(|_| emb.provider == "openai")
            .unwrap_or(&config.llm.openai_url);
        Ok(Self {
            model,
            dims,
            endpoint: format!("{}/embeddings", base.trim_end_matches('/')),
            api_key,
            batch_size: emb.batch_size,
            max_retries: emb.max_retries,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(emb.timeout_secs))
                .build()?,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json_with_retry(
            &self.client,
            &self.endpoint,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_embeddings(&json)
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_in_batches(texts, self.batch_size, |batch| self.embed_batch(batch)).await
    }
}

/// `data[].embedding`, reordered by `data[].index` when present.
fn parse_openai_embeddings(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, parse_vector(embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &Config, model: String, dims: usize) -> Result<Self> {
        let emb = &config.embedding;
        let url = emb
            .url
            .clone()
            .filter(|_| emb.provider == "ollama")
            .unwrap_or_else(|| config.llm.ollama_url.clone());
        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            batch_size: emb.batch_size,
            max_retries: emb.max_retries,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(emb.timeout_secs))
                .build()?,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let endpoint = format!("{}/api/embed", self.url);
        let json = post_json_with_retry(
            &self.client,
            &endpoint,
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await
        .map_err(|e| anyhow!("{} (is Ollama running at {}?)", e, self.url))?;
        parse_ollama_embeddings(&json)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_in_batches(texts, self.batch_size, |batch| self.embed_batch(batch)).await
    }
}

fn parse_ollama_embeddings(json: &Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(parse_vector)
        .collect()
}

// ============ Local (fastembed) ============

/// Local CPU embeddings. The model is loaded on first use and kept for
/// the life of the process.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: std::sync::Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(config: &Config, model_name: String, dims: usize) -> Result<Self> {
        config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims,
            batch_size: config.embedding.batch_size,
            model: Default::default(),
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let slot = self.model.clone();
        let name = self.model_name.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                info!(model = %name, "loading local embedding model");
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(config_to_fastembed_model(&name)?)
                        .with_show_download_progress(true),
                )
                .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow!("local embedding model not loaded"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

fn build_embedder(provider: &str, config: &Config) -> Result<Box<dyn Embedder>> {
    let (model, dims) = config.embedding.model_for(provider);
    match provider {
        "openai" => Ok(Box::new(OpenAIEmbedder::new(config, model, dims)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config, model, dims)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Box::new(LocalEmbedder::new(config, model, dims)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Resolve the embedding provider for this process.
pub fn create_embedder(config: &Config) -> Result<Box<dyn Embedder>> {
    let emb = &config.embedding;
    match build_embedder(&emb.provider, config) {
        Ok(embedder) => {
            debug!(model = embedder.model_name(), dims = embedder.dims(), "embedder ready");
            Ok(embedder)
        }
        Err(e) if emb.fallback != "none" && emb.fallback != emb.provider => {
            let embedder = build_embedder(&emb.fallback, config).map_err(|fe| {
                anyhow!(
                    "embedding provider {} unavailable ({}); fallback {} failed: {}",
                    emb.provider,
                    e,
                    emb.fallback,
                    fe
                )
            })?;
            info!(
                primary = %emb.provider,
                reason = %e,
                model = embedder.model_name(),
                "primary embedding provider unavailable; using fallback"
            );
            Ok(embedder)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_openai_response_reordered_by_index() {
        let json = json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_embeddings(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_ollama_response() {
        let json = json!({"model": "nomic-embed-text", "embeddings": [[0.5, 0.5]]});
        assert_eq!(parse_ollama_embeddings(&json).unwrap(), vec![vec![0.5, 0.5]]);
        assert!(parse_ollama_embeddings(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_batches_are_split_and_checked() {
        let texts: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let mut sizes = Vec::new();
        let vectors = embed_in_batches(&texts, 2, |batch| {
            sizes.push(batch.len());
            let out = batch.iter().map(|_| vec![1.0]).collect();
            async move { Ok(out) }
        })
        .await
        .unwrap();
        assert_eq!(vectors.len(), 5);
        assert_eq!(sizes, vec![2, 2, 1]);

        let short = embed_in_batches(&texts, 5, |_| async { Ok(vec![vec![1.0]]) }).await;
        assert!(short.is_err());
    }

    #[test]
    fn test_openai_without_key_falls_back() {
        let mut config = Config::default();
        config.embedding.fallback = "ollama".to_string();
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.model_name(), "nomic-embed-text");
        assert_eq!(embedder.dims(), 768);
    }

    #[test]
    fn test_openai_with_key() {
        let mut config = Config::default();
        config.credentials.openai_api_key = Some("sk-test".to_string());
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.model_name(), "text-embedding-3-small");
        assert_eq!(embedder.dims(), 1536);
    }

    #[test]
    fn test_no_provider_available() {
        let mut config = Config::default();
        config.embedding.fallback = "none".to_string();
        assert!(create_embedder(&config).is_err());
    }
}
