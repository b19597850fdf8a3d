//! Question answering over an indexed spec.
//!
//! 1. Embed the question (prefixed with the previous user turn, if any).
//! 2. Search the spec and auxiliary collections; drop hits below
//!    `retrieval.min_score`.
//! 3. Map every spec hit to its owning operation (parameters, bodies and
//!    responses point at their parent), keep each operation once, and
//!    attach the operation's child records as context.
//! 4. Ask the chat model to answer from that context only.
//!
//! Nothing relevant → [`AnswerError::NoRelevantContext`]; no collection →
//! [`AnswerError::IndexMissing`]. A collection whose build is still running
//! (or was cancelled) is searched as-is and the answer says so through
//! `index_complete`.

use std::collections::HashSet;
use std::sync::Arc;

use askapi_core::embedding::Embedder;
use askapi_core::error::AnswerError;
use askapi_core::llm::{ChatMessage, ChatModel};
use askapi_core::prompt::{answer_messages, format_context, retrieval_query, ContextSection};
use askapi_core::store::{VectorHit, VectorStore};
use serde::Serialize;
use tracing::debug;

use crate::config::RetrievalConfig;

/// Collections an engine answers from.
#[derive(Debug, Clone)]
pub struct Collections {
    pub spec: String,
    pub aux: String,
}

/// A record or document cited in an answer.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub record_id: String,
    pub label: String,
    pub collection: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Source>,
    pub index_complete: bool,
}

pub struct RetrievalEngine {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatModel>,
    config: RetrievalConfig,
}

fn provider(e: anyhow::Error) -> AnswerError {
    AnswerError::Provider(format!("{:#}", e))
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            chat,
            config,
        }
    }

    pub async fn answer(
        &self,
        collections: &Collections,
        question: &str,
        history: &[ChatMessage],
    ) -> Result<Answer, AnswerError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AnswerError::NoRelevantContext {
                question: String::new(),
            });
        }

        let info = self
            .store
            .collection(&collections.spec)
            .await
            .map_err(provider)?
            .ok_or_else(|| AnswerError::IndexMissing {
                collection: collections.spec.clone(),
            })?;

        let keep = history.len().saturating_sub(self.config.history_turns);
        let history = &history[keep..];

        let query = retrieval_query(question, history);
        let vector = self
            .embedder
            .embed(&[query])
            .await
            .map_err(provider)?
            .into_iter()
            .next()
            .ok_or_else(|| AnswerError::Provider("empty embedding response".to_string()))?;

        let hits: Vec<VectorHit> = self
            .store
            .search(
                &[collections.spec.clone(), collections.aux.clone()],
                &vector,
                self.config.top_k,
            )
            .await
            .map_err(provider)?
            .into_iter()
            .filter(|hit| hit.score >= self.config.min_score)
            .collect();
        debug!(hits = hits.len(), "retrieved views above threshold");
        if hits.is_empty() {
            return Err(AnswerError::NoRelevantContext {
                question: question.to_string(),
            });
        }

        let (sections, sources) = self.assemble(collections, &hits).await?;
        if sections.is_empty() {
            return Err(AnswerError::NoRelevantContext {
                question: question.to_string(),
            });
        }

        let messages = answer_messages(question, history, &format_context(&sections));
        let text = self.chat.complete(&messages).await.map_err(provider)?;

        Ok(Answer {
            answer: text,
            sources,
            index_complete: info.complete,
        })
    }

    /// One context section per distinct operation (or schema, or document
    /// chunk), in hit order, up to `max_context_operations`.
    async fn assemble(
        &self,
        collections: &Collections,
        hits: &[VectorHit],
    ) -> Result<(Vec<ContextSection>, Vec<Source>), AnswerError> {
        let mut seen = HashSet::new();
        let mut sections = Vec::new();
        let mut sources = Vec::new();

        for hit in hits {
            if sections.len() >= self.config.max_context_operations {
                break;
            }

            if hit.collection == collections.aux {
                if seen.insert(hit.record_id.clone()) {
                    let label = hit
                        .metadata
                        .get("label")
                        .and_then(|v| v.as_str())
                        .unwrap_or("document")
                        .to_string();
                    sections.push(ContextSection {
                        label: label.clone(),
                        body: hit.text.clone(),
                    });
                    sources.push(Source {
                        record_id: hit.record_id.clone(),
                        label,
                        collection: hit.collection.clone(),
                        score: hit.score,
                    });
                }
                continue;
            }

            let owner_id = match self
                .store
                .get_record(&hit.collection, &hit.record_id)
                .await
                .map_err(provider)?
            {
                Some(record) => record.parent_id.unwrap_or(record.id),
                None => continue,
            };
            if !seen.insert(owner_id.clone()) {
                continue;
            }
            let Some(owner) = self
                .store
                .get_record(&hit.collection, &owner_id)
                .await
                .map_err(provider)?
            else {
                continue;
            };

            let children = self
                .store
                .child_records(&hit.collection, &owner_id)
                .await
                .map_err(provider)?;
            let mut body = owner.text.clone();
            for child in &children {
                body.push_str("\n\n");
                body.push_str(&child.text);
            }

            let label = owner.label().to_string();
            sections.push(ContextSection {
                label: label.clone(),
                body,
            });
            sources.push(Source {
                record_id: owner_id,
                label,
                collection: hit.collection.clone(),
                score: hit.score,
            });
        }
        Ok((sections, sources))
    }
}
