//! View generation.
//!
//! For each requested [`ViewKind`] of a record the generator first asks the
//! [`ViewCache`]; only a miss reaches the chat model. Example views come
//! from the record's synthesized example call and never reach the model,
//! but they are still written through the cache.
//!
//! A failed view is logged and returned as a [`ViewGenerationError`]; the
//! record keeps whatever views succeeded. A record left with no views gets
//! a `metadata` view holding its rendered text so it stays searchable.

use std::sync::Arc;
use std::time::Duration;

use askapi_core::cache::ViewCache;
use askapi_core::error::ViewGenerationError;
use askapi_core::llm::ChatModel;
use askapi_core::model::{Record, View, ViewKind};
use askapi_core::prompt::view_messages;
use tracing::{debug, warn};

/// Views produced for one record, plus what it cost.
#[derive(Debug, Default)]
pub struct RecordViews {
    pub views: Vec<View>,
    pub errors: Vec<ViewGenerationError>,
    pub cache_hits: usize,
    pub llm_calls: usize,
    /// True when `views` holds only the metadata fallback.
    pub fallback: bool,
}

pub struct ViewGenerator {
    chat: Option<Arc<dyn ChatModel>>,
    cache: Arc<dyn ViewCache>,
    kinds: Vec<ViewKind>,
    /// Bound on a whole `complete` call, fallback provider included.
    timeout: Duration,
}

impl ViewGenerator {
    /// `chat` may be `None` when no provider is configured; summary and
    /// question views then fail per record and the build continues.
    pub fn new(
        chat: Option<Arc<dyn ChatModel>>,
        cache: Arc<dyn ViewCache>,
        kinds: Vec<ViewKind>,
        timeout: Duration,
    ) -> Self {
        Self {
            chat,
            cache,
            kinds,
            timeout,
        }
    }

    pub async fn generate(&self, record: &Record) -> RecordViews {
        let mut out = RecordViews::default();

        for &kind in &self.kinds {
            if let Some(text) = self.cache.get(&record.id, kind).await {
                debug!(record = %record.id, %kind, "view cache hit");
                out.cache_hits += 1;
                out.views.push(View::new(&record.id, kind, text));
                continue;
            }

            let generated = match kind {
                ViewKind::Example => match &record.example {
                    Some(example) => Ok(example.clone()),
                    None => continue,
                },
                _ => {
                    out.llm_calls += 1;
                    self.ask_model(kind, record).await
                }
            };

            match generated {
                Ok(text) => {
                    if let Err(e) = self.cache.put(&record.id, kind, &text).await {
                        warn!(record = %record.id, %kind, error = %e, "failed to write view cache");
                    }
                    out.views.push(View::new(&record.id, kind, text));
                }
                Err(message) => {
                    let err = ViewGenerationError {
                        record_id: record.id.clone(),
                        kind,
                        message,
                    };
                    warn!(record = %record.id, %kind, error = %err.message, "view generation failed");
                    out.errors.push(err);
                }
            }
        }

        if out.views.is_empty() {
            out.views
                .push(View::new(&record.id, ViewKind::Metadata, record.render()));
            out.fallback = true;
        }
        out
    }

    async fn ask_model(&self, kind: ViewKind, record: &Record) -> Result<String, String> {
        let messages =
            view_messages(kind, record).ok_or_else(|| format!("{} views are not generated", kind))?;
        let chat = self
            .chat
            .as_ref()
            .ok_or_else(|| "no chat provider configured".to_string())?;

        match tokio::time::timeout(self.timeout, chat.complete(&messages)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(Ok(_)) => Err(format!("{} returned an empty reply", chat.name())),
            Ok(Err(e)) => Err(format!("{}: {:#}", chat.name(), e)),
            Err(_) => Err(format!("{} timed out after {:?}", chat.name(), self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FallbackChat;
    use anyhow::{bail, Result};
    use askapi_core::builder::build_records;
    use askapi_core::cache::MemoryViewCache;
    use askapi_core::llm::ChatMessage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ChatModel for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("provider down");
            }
            Ok(format!("generated ({} chars)", messages[0].content.len()))
        }
    }

    /// Lends an `Arc`-held model to a `Box<dyn ChatModel>` slot.
    struct Shared(Arc<Counting>);

    #[async_trait]
    impl ChatModel for Shared {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            self.0.complete(messages).await
        }
    }

    struct Stuck;

    #[async_trait]
    impl ChatModel for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    fn operation() -> Record {
        let spec = json!({
            "openapi": "3.0.0",
            "info": {"title": "Pets", "version": "1"},
            "paths": {"/pets/{id}": {"get": {
                "operationId": "getPet",
                "summary": "Fetch a pet",
                "parameters": [{"name": "id", "in": "path", "required": true, "schema": {"type": "string"}}],
                "responses": {"200": {"description": "ok"}}
            }}}
        });
        build_records(&spec)
            .into_iter()
            .find(|r| r.id == "operation:getPet")
            .unwrap()
    }

    fn all_kinds() -> Vec<ViewKind> {
        ViewKind::GENERATED.to_vec()
    }

    #[tokio::test]
    async fn test_second_run_served_from_cache() {
        let chat = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let cache = Arc::new(MemoryViewCache::default());
        let generator = ViewGenerator::new(
            Some(chat.clone()),
            cache.clone(),
            all_kinds(),
            Duration::from_secs(5),
        );
        let record = operation();

        let first = generator.generate(&record).await;
        assert_eq!(first.views.len(), 3);
        assert_eq!(first.llm_calls, 2);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 2);

        let second = generator.generate(&record).await;
        assert_eq!(second.cache_hits, 3);
        assert_eq!(second.llm_calls, 0);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_example_view_needs_no_model() {
        let cache = Arc::new(MemoryViewCache::default());
        let generator =
            ViewGenerator::new(None, cache, vec![ViewKind::Example], Duration::from_secs(5));
        let out = generator.generate(&operation()).await;
        assert_eq!(out.views.len(), 1);
        assert!(out.views[0].text.contains("curl -X GET"));
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn test_all_failures_yield_metadata_view() {
        let chat = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let generator = ViewGenerator::new(
            Some(chat),
            Arc::new(MemoryViewCache::default()),
            vec![ViewKind::Summary, ViewKind::Question],
            Duration::from_secs(5),
        );
        let out = generator.generate(&operation()).await;
        assert_eq!(out.errors.len(), 2);
        assert!(out.fallback);
        assert_eq!(out.views.len(), 1);
        assert_eq!(out.views[0].kind, ViewKind::Metadata);
        assert!(out.views[0].text.contains("/pets/{id}"));
    }

    #[tokio::test]
    async fn test_slow_primary_falls_back_within_deadline() {
        let fallback = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let chat = FallbackChat::new(Box::new(Stuck), Box::new(Shared(fallback.clone())))
            .with_budget(Duration::from_millis(50));
        let generator = ViewGenerator::new(
            Some(Arc::new(chat)),
            Arc::new(MemoryViewCache::default()),
            vec![ViewKind::Summary],
            Duration::from_millis(500),
        );
        let out = generator.generate(&operation()).await;
        assert!(out.errors.is_empty(), "{:?}", out.errors);
        assert!(!out.fallback);
        assert_eq!(out.views.len(), 1);
        assert_eq!(out.views[0].kind, ViewKind::Summary);
        assert!(out.views[0].text.starts_with("generated"));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure_not_a_hang() {
        let generator = ViewGenerator::new(
            Some(Arc::new(Stuck)),
            Arc::new(MemoryViewCache::default()),
            vec![ViewKind::Summary],
            Duration::from_millis(50),
        );
        let out = generator.generate(&operation()).await;
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].message.contains("timed out"));
        assert!(out.fallback);
    }
}
