//! Vector index: build/resume and auxiliary documents.
//!
//! One spec collection per fingerprint (`openapi_<api>_<fp12>`) plus an
//! auxiliary collection (`<that>__aux`) for user-supplied notes.
//!
//! # Resume protocol
//!
//! [`VectorIndex::open`] creates the collection if needed and snapshots the
//! content hash of every stored vector. For each record's views the index
//! then embeds only views whose hash is missing or different; views already
//! stored with the same model and text are skipped. A vector left behind by
//! a view the record no longer has (typically a `metadata` fallback that a
//! real summary has replaced) is deleted.

use std::collections::HashMap;
use std::sync::Arc;

use askapi_core::chunk::{chunk_document, DEFAULT_MAX_CHARS};
use askapi_core::embedding::{content_hash, Embedder};
use askapi_core::error::IndexWriteError;
use askapi_core::model::{view_id, Record, View, ViewKind};
use askapi_core::store::{CollectionRole, CollectionSpec, StoredRecord, VectorEntry, VectorStore};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::loader::LoadedSpec;

/// Existing vector hashes for a collection, taken when a build starts.
#[derive(Debug, Default)]
pub struct ResumeState {
    pub hashes: HashMap<String, String>,
    /// The collection already existed before this build.
    pub resumed: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViewsIndexed {
    pub embedded: usize,
    pub skipped: usize,
    pub removed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuxReport {
    pub chunks_indexed: usize,
    pub chunks_skipped: usize,
}

#[derive(Clone)]
pub struct VectorIndex {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl VectorIndex {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Ensure the spec collection exists and snapshot its vector hashes.
    pub async fn open(&self, spec: &LoadedSpec) -> Result<ResumeState, IndexWriteError> {
        let name = spec.collection_name();
        let err = |e: anyhow::Error| IndexWriteError::new(&name, format!("{:#}", e));

        let resumed = self.store.collection(&name).await.map_err(err)?.is_some();
        self.store
            .ensure_collection(&CollectionSpec {
                name: name.clone(),
                fingerprint: spec.fingerprint.to_string(),
                role: CollectionRole::Spec,
                api_name: spec.api_name.clone(),
            })
            .await
            .map_err(err)?;
        let hashes = self.store.vector_hashes(&name).await.map_err(err)?;

        if resumed {
            info!(collection = %name, vectors = hashes.len(), "resuming existing collection");
        } else {
            info!(collection = %name, "created collection");
        }
        Ok(ResumeState { hashes, resumed })
    }

    /// Store the rendered text of every record.
    pub async fn put_records(
        &self,
        collection: &str,
        records: &[Record],
    ) -> Result<(), IndexWriteError> {
        let stored: Vec<StoredRecord> = records.iter().map(stored_record).collect();
        self.store
            .upsert_records(collection, &stored)
            .await
            .map_err(|e| IndexWriteError::new(collection, format!("{:#}", e)))
    }

    /// Embed and upsert the views of one record, skipping unchanged ones.
    pub async fn index_views(
        &self,
        collection: &str,
        record: &Record,
        views: &[View],
        state: &ResumeState,
    ) -> Result<ViewsIndexed, IndexWriteError> {
        let err = |e: anyhow::Error| IndexWriteError::new(collection, format!("{:#}", e));
        let model = self.embedder.model_name().to_string();
        let mut outcome = ViewsIndexed::default();

        let mut pending = Vec::new();
        for view in views {
            let id = view.id();
            let hash = content_hash(&model, &view.text);
            if state.hashes.get(&id) == Some(&hash) {
                debug!(view = %id, "vector up to date");
                outcome.skipped += 1;
            } else {
                pending.push((view, id, hash));
            }
        }

        let current: Vec<String> = views.iter().map(View::id).collect();
        let stale: Vec<String> = [
            ViewKind::Summary,
            ViewKind::Question,
            ViewKind::Example,
            ViewKind::Metadata,
        ]
        .iter()
        .map(|&kind| view_id(&record.id, kind))
        .filter(|id| state.hashes.contains_key(id) && !current.contains(id))
        .collect();
        if !stale.is_empty() {
            outcome.removed = self
                .store
                .delete_vectors(collection, &stale)
                .await
                .map_err(err)?;
        }

        if pending.is_empty() {
            return Ok(outcome);
        }

        let texts: Vec<String> = pending.iter().map(|(v, _, _)| v.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await.map_err(err)?;
        if vectors.len() != pending.len() {
            return Err(IndexWriteError::new(
                collection,
                format!(
                    "embedder returned {} vectors for {} views",
                    vectors.len(),
                    pending.len()
                ),
            ));
        }

        let base = vector_metadata(record);
        let entries: Vec<VectorEntry> = pending
            .into_iter()
            .zip(vectors)
            .map(|((view, id, hash), vector)| {
                let mut metadata = base.clone();
                metadata["view_kind"] = json!(view.kind.as_str());
                VectorEntry {
                    id,
                    record_id: record.id.clone(),
                    kind: view.kind.as_str().to_string(),
                    text: view.text.clone(),
                    content_hash: hash,
                    model: model.clone(),
                    dims: vector.len(),
                    vector,
                    metadata,
                }
            })
            .collect();
        outcome.embedded = entries.len();
        self.store
            .upsert_vectors(collection, &entries)
            .await
            .map_err(err)?;
        Ok(outcome)
    }

    pub async fn finish(
        &self,
        collection: &str,
        complete: bool,
        run_id: &str,
    ) -> Result<(), IndexWriteError> {
        self.store
            .set_build_state(collection, complete, run_id)
            .await
            .map_err(|e| IndexWriteError::new(collection, format!("{:#}", e)))
    }

    /// Chunk `text` into the auxiliary collection. Chunks already present
    /// with the same text are skipped, so re-adding a document is a no-op.
    pub async fn add_auxiliary(
        &self,
        spec: &LoadedSpec,
        source: &str,
        text: &str,
        max_chars: usize,
    ) -> Result<AuxReport, IndexWriteError> {
        let name = spec.aux_collection_name();
        let err = |e: anyhow::Error| IndexWriteError::new(&name, format!("{:#}", e));

        self.store
            .ensure_collection(&CollectionSpec {
                name: name.clone(),
                fingerprint: spec.fingerprint.to_string(),
                role: CollectionRole::Auxiliary,
                api_name: spec.api_name.clone(),
            })
            .await
            .map_err(err)?;

        let truncated: String = text.chars().take(max_chars).collect();
        let chunks = chunk_document(source, &truncated, DEFAULT_MAX_CHARS);
        let existing = self.store.vector_hashes(&name).await.map_err(err)?;
        let model = self.embedder.model_name().to_string();

        let mut report = AuxReport::default();
        let mut pending = Vec::new();
        for chunk in chunks {
            let hash = content_hash(&model, &chunk.text);
            if existing.get(&chunk.id) == Some(&hash) {
                report.chunks_skipped += 1;
            } else {
                pending.push((chunk, hash));
            }
        }
        if pending.is_empty() {
            return Ok(report);
        }

        let texts: Vec<String> = pending.iter().map(|(c, _)| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await.map_err(err)?;
        if vectors.len() != pending.len() {
            return Err(IndexWriteError::new(
                &name,
                format!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    pending.len()
                ),
            ));
        }

        let mut records = Vec::with_capacity(pending.len());
        let mut entries = Vec::with_capacity(pending.len());
        for ((chunk, hash), vector) in pending.into_iter().zip(vectors) {
            let metadata = json!({
                "kind": "document",
                "record_id": chunk.id,
                "source": chunk.source,
                "chunk_index": chunk.index,
                "label": format!("document {}", chunk.source),
            });
            records.push(StoredRecord {
                id: chunk.id.clone(),
                parent_id: None,
                kind: "document".to_string(),
                text: chunk.text.clone(),
                metadata: metadata.clone(),
            });
            entries.push(VectorEntry {
                id: chunk.id.clone(),
                record_id: chunk.id,
                kind: "document".to_string(),
                text: chunk.text,
                content_hash: hash,
                model: model.clone(),
                dims: vector.len(),
                vector,
                metadata,
            });
        }
        report.chunks_indexed = entries.len();

        self.store
            .upsert_records(&name, &records)
            .await
            .map_err(err)?;
        self.store
            .upsert_vectors(&name, &entries)
            .await
            .map_err(err)?;
        self.store
            .set_build_state(&name, true, &uuid::Uuid::new_v4().to_string())
            .await
            .map_err(err)?;
        info!(
            collection = %name,
            source,
            indexed = report.chunks_indexed,
            skipped = report.chunks_skipped,
            "auxiliary document added"
        );
        Ok(report)
    }
}

fn vector_metadata(record: &Record) -> Value {
    let mut metadata = record.metadata_json();
    metadata["label"] = json!(record.label());
    metadata
}

/// Rendered record text followed by its example, as stored in `records`.
fn stored_record(record: &Record) -> StoredRecord {
    let text = match &record.example {
        Some(example) => format!("{}\nexample:\n{}", record.render(), example),
        None => record.render(),
    };
    StoredRecord {
        id: record.id.clone(),
        parent_id: record.parent.clone(),
        kind: record.kind().as_str().to_string(),
        text,
        metadata: vector_metadata(record),
    }
}
