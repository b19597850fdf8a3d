//! Chat model providers.
//!
//! Concrete [`ChatModel`] implementations used for view generation and
//! answer synthesis:
//! - **[`OpenAIChat`]**: `POST {openai_url}/chat/completions`.
//! - **[`OllamaChat`]**: `POST {ollama_url}/api/chat` with `stream: false`.
//! - **[`FallbackChat`]**: tries a primary model, then a secondary one.
//!
//! [`create_chat_model`] picks the combination from `[llm]` once at startup.
//! An OpenAI primary without `OPENAI_API_KEY` is skipped in favour of the
//! fallback rather than failing every call.
//!
//! # Retry Strategy
//!
//! Both HTTP providers retry transient failures with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network errors and timeouts → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! # Deadlines
//!
//! `timeout_secs` bounds a single HTTP attempt. [`provider_budget`] is the
//! worst case for one provider with every retry and backoff spent, and
//! [`FallbackChat`] gives each of its providers that budget separately.
//! [`chat_deadline`] is the outer bound for one `complete` call, covering
//! the primary and the fallback.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use askapi_core::llm::{ChatMessage, ChatModel};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{Config, LlmConfig};

// ============ Retry ============

/// POST `body` to `url`, retrying per the module-level strategy, and
/// return the parsed JSON response.
pub(crate) async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &Value,
    max_retries: u32,
    provider: &str,
) -> Result<Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow!("{} API error {}: {}", provider, status, body_text));
                    continue;
                }

                bail!("{} API error {}: {}", provider, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow!("{} request to {} failed: {}", provider, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} request failed after retries", provider)))
}

/// Worst-case wall time of one provider call under `[llm]`.
pub fn provider_budget(llm: &LlmConfig) -> Duration {
    let attempts = u64::from(llm.max_retries) + 1;
    let backoff: u64 = (1..=llm.max_retries)
        .map(|attempt| 1u64 << (attempt - 1).min(5))
        .sum();
    Duration::from_secs(llm.timeout_secs.saturating_mul(attempts).saturating_add(backoff))
}

/// Outer deadline for one chat completion, primary and fallback included.
pub fn chat_deadline(llm: &LlmConfig) -> Duration {
    let providers = if llm.fallback == "none" || llm.fallback == llm.primary {
        1
    } else {
        2
    };
    provider_budget(llm) * providers
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

// ============ OpenAI ============

pub struct OpenAIChat {
    label: String,
    model: String,
    endpoint: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config
            .credentials
            .openai_api_key
            .clone()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let llm = &config.llm;
        Ok(Self {
            label: format!("openai:{}", llm.openai_model),
            model: llm.openai_model.clone(),
            endpoint: format!("{}/chat/completions", llm.openai_url.trim_end_matches('/')),
            api_key,
            temperature: llm.temperature,
            max_retries: llm.max_retries,
            client: http_client(llm.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
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
        parse_openai_reply(&json)
    }
}

fn parse_openai_reply(json: &Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

// ============ Ollama ============

pub struct OllamaChat {
    label: String,
    model: String,
    endpoint: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &Config) -> Result<Self> {
        let llm = &config.llm;
        Ok(Self {
            label: format!("ollama:{}", llm.ollama_model),
            model: llm.ollama_model.clone(),
            endpoint: format!("{}/api/chat", llm.ollama_url.trim_end_matches('/')),
            temperature: llm.temperature,
            max_retries: llm.max_retries,
            client: http_client(llm.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        let json = post_json_with_retry(
            &self.client,
            &self.endpoint,
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        parse_ollama_reply(&json)
    }
}

fn parse_ollama_reply(json: &Value) -> Result<String> {
    json.pointer("/message/content")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing message.content"))
}

// ============ Fallback ============

/// Calls `primary`; on any error (or once its budget runs out) logs it and
/// calls `secondary`.
pub struct FallbackChat {
    label: String,
    primary: Box<dyn ChatModel>,
    secondary: Box<dyn ChatModel>,
    budget: Option<Duration>,
}

impl FallbackChat {
    pub fn new(primary: Box<dyn ChatModel>, secondary: Box<dyn ChatModel>) -> Self {
        Self {
            label: format!("{} (fallback {})", primary.name(), secondary.name()),
            primary,
            secondary,
            budget: None,
        }
    }

    /// Bound each provider's call to `budget`.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    async fn call(&self, chat: &dyn ChatModel, messages: &[ChatMessage]) -> Result<String> {
        match self.budget {
            Some(budget) => tokio::time::timeout(budget, chat.complete(messages))
                .await
                .unwrap_or_else(|_| Err(anyhow!("{} timed out after {:?}", chat.name(), budget))),
            None => chat.complete(messages).await,
        }
    }
}

#[async_trait]
impl ChatModel for FallbackChat {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        match self.call(self.primary.as_ref(), messages).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(
                    primary = self.primary.name(),
                    secondary = self.secondary.name(),
                    error = %e,
                    "primary chat provider failed; using fallback"
                );
                self.call(self.secondary.as_ref(), messages).await
            }
        }
    }
}

fn build_chat(provider: &str, config: &Config) -> Result<Box<dyn ChatModel>> {
    match provider {
        "openai" => Ok(Box::new(OpenAIChat::new(config)?)),
        "ollama" => Ok(Box::new(OllamaChat::new(config)?)),
        other => bail!("Unknown chat provider: {}", other),
    }
}

/// Build the chat model described by `[llm]`.
///
/// | primary usable | fallback | result |
/// |---|---|---|
/// | yes | `none` | primary |
/// | yes | other | [`FallbackChat`] |
/// | no | other | fallback alone |
/// | no | `none` | error |
pub fn create_chat_model(config: &Config) -> Result<Box<dyn ChatModel>> {
    let llm = &config.llm;
    let primary = build_chat(&llm.primary, config);
    let fallback = if llm.fallback == "none" || llm.fallback == llm.primary {
        None
    } else {
        Some(build_chat(&llm.fallback, config))
    };

    match (primary, fallback) {
        (Ok(primary), None) => Ok(primary),
        (Ok(primary), Some(Ok(secondary))) => Ok(Box::new(
            FallbackChat::new(primary, secondary).with_budget(provider_budget(llm)),
        )),
        (Ok(primary), Some(Err(e))) => {
            warn!(error = %e, "fallback chat provider unavailable");
            Ok(primary)
        }
        (Err(e), Some(Ok(secondary))) => {
            info!(
                primary = %llm.primary,
                reason = %e,
                using = secondary.name(),
                "primary chat provider unavailable; using fallback"
            );
            Ok(secondary)
        }
        (Err(e), _) => Err(e.context(format!("no usable chat provider (primary {})", llm.primary))),
    }
}
