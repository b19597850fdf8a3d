//! Vector store abstraction.
//!
//! The [`VectorStore`] trait covers everything the index and the retrieval
//! engine need from a backend: named collections with a build state,
//! record rows (the parents that views point back to), and vector rows
//! keyed by view ID.
//!
//! Implementations must be `Send + Sync` and make every upsert idempotent:
//! writing the same ID twice leaves exactly one row.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`ensure_collection`](VectorStore::ensure_collection) | Create a collection row if absent |
//! | [`set_build_state`](VectorStore::set_build_state) | Mark a build complete/incomplete |
//! | [`upsert_records`](VectorStore::upsert_records) | Insert or replace record rows |
//! | [`vector_hashes`](VectorStore::vector_hashes) | View ID → content hash, for resume |
//! | [`upsert_vectors`](VectorStore::upsert_vectors) | Insert or replace vectors |
//! | [`search`](VectorStore::search) | Cosine top-k across collections |

pub mod memory;

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a collection holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionRole {
    /// Views of records built from the spec.
    Spec,
    /// Chunks of user-supplied documents.
    Auxiliary,
}

impl CollectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionRole::Spec => "spec",
            CollectionRole::Auxiliary => "auxiliary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spec" => Some(CollectionRole::Spec),
            "auxiliary" => Some(CollectionRole::Auxiliary),
            _ => None,
        }
    }
}

impl fmt::Display for CollectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a collection, supplied when creating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub fingerprint: String,
    pub role: CollectionRole,
    pub api_name: String,
}

/// A collection row plus live counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub fingerprint: String,
    pub role: CollectionRole,
    pub api_name: String,
    /// True once a build ran to the end without cancellation.
    pub complete: bool,
    pub run_id: Option<String>,
    pub record_count: usize,
    pub vector_count: usize,
    /// Unix seconds.
    pub created_at: i64,
    pub updated_at: i64,
}

/// A parent row that views resolve back to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub kind: String,
    /// Text handed to the LLM as context.
    pub text: String,
    pub metadata: Value,
}

impl StoredRecord {
    /// Citation label stored in metadata, falling back to the ID.
    pub fn label(&self) -> &str {
        self.metadata
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or(&self.id)
    }
}

/// One embedded view (or auxiliary chunk).
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    /// View ID, unique within the collection.
    pub id: String,
    pub record_id: String,
    pub kind: String,
    pub text: String,
    pub content_hash: String,
    pub model: String,
    pub dims: usize,
    pub vector: Vec<f32>,
    pub metadata: Value,
}

/// A search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub collection: String,
    pub id: String,
    pub record_id: String,
    pub kind: String,
    pub text: String,
    pub score: f32,
    pub metadata: Value,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if it does not exist. Existing rows are kept.
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<()>;

    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>>;

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>>;

    /// Remove a collection and all its rows. Returns false if it was absent.
    async fn drop_collection(&self, name: &str) -> Result<bool>;

    async fn set_build_state(&self, name: &str, complete: bool, run_id: &str) -> Result<()>;

    async fn upsert_records(&self, collection: &str, records: &[StoredRecord]) -> Result<()>;

    async fn get_record(&self, collection: &str, id: &str) -> Result<Option<StoredRecord>>;

    /// Records whose `parent_id` is `parent_id`, ordered by ID.
    async fn child_records(&self, collection: &str, parent_id: &str) -> Result<Vec<StoredRecord>>;

    /// Content hash of every stored vector, keyed by view ID.
    async fn vector_hashes(&self, collection: &str) -> Result<HashMap<String, String>>;

    async fn upsert_vectors(&self, collection: &str, entries: &[VectorEntry]) -> Result<()>;

    /// Remove vectors by view ID. Returns how many existed.
    async fn delete_vectors(&self, collection: &str, ids: &[String]) -> Result<usize>;

    async fn vector_count(&self, collection: &str) -> Result<usize>;

    /// Top `limit` vectors by cosine similarity across `collections`.
    /// Missing collections are skipped; ties order by view ID.
    async fn search(
        &self,
        collections: &[String],
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>>;
}

/// Sort hits best-first with a stable tie-break, then truncate.
pub fn rank_hits(mut hits: Vec<VectorHit>, limit: usize) -> Vec<VectorHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.collection.cmp(&b.collection))
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(limit);
    hits
}
