//! In-memory [`VectorStore`] for tests.
//!
//! Collections live in a `BTreeMap` behind `std::sync::RwLock`; search is
//! brute-force cosine similarity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{
    rank_hits, CollectionInfo, CollectionSpec, StoredRecord, VectorEntry, VectorHit, VectorStore,
};
use crate::embedding::cosine_similarity;

struct MemCollection {
    spec: CollectionSpec,
    complete: bool,
    run_id: Option<String>,
    created_at: i64,
    updated_at: i64,
    records: BTreeMap<String, StoredRecord>,
    vectors: BTreeMap<String, VectorEntry>,
}

impl MemCollection {
    fn info(&self) -> CollectionInfo {
        CollectionInfo {
            name: self.spec.name.clone(),
            fingerprint: self.spec.fingerprint.clone(),
            role: self.spec.role,
            api_name: self.spec.api_name.clone(),
            complete: self.complete,
            run_id: self.run_id.clone(),
            record_count: self.records.len(),
            vector_count: self.vectors.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<BTreeMap<String, MemCollection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, MemCollection>>> {
        self.collections
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, MemCollection>>> {
        self.collections
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn missing(name: &str) -> anyhow::Error {
    anyhow!("collection {} does not exist", name)
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<()> {
        let mut collections = self.write()?;
        collections.entry(spec.name.clone()).or_insert_with(|| {
            let now = now_secs();
            MemCollection {
                spec: spec.clone(),
                complete: false,
                run_id: None,
                created_at: now,
                updated_at: now,
                records: BTreeMap::new(),
                vectors: BTreeMap::new(),
            }
        });
        Ok(())
    }

    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        Ok(self.read()?.get(name).map(MemCollection::info))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        Ok(self.read()?.values().map(MemCollection::info).collect())
    }

    async fn drop_collection(&self, name: &str) -> Result<bool> {
        Ok(self.write()?.remove(name).is_some())
    }

    async fn set_build_state(&self, name: &str, complete: bool, run_id: &str) -> Result<()> {
        let mut collections = self.write()?;
        let col = collections.get_mut(name).ok_or_else(|| missing(name))?;
        col.complete = complete;
        col.run_id = Some(run_id.to_string());
        col.updated_at = now_secs();
        Ok(())
    }

    async fn upsert_records(&self, collection: &str, records: &[StoredRecord]) -> Result<()> {
        let mut collections = self.write()?;
        let col = collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection))?;
        for record in records {
            col.records.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn get_record(&self, collection: &str, id: &str) -> Result<Option<StoredRecord>> {
        Ok(self
            .read()?
            .get(collection)
            .and_then(|c| c.records.get(id).cloned()))
    }

    async fn child_records(&self, collection: &str, parent_id: &str) -> Result<Vec<StoredRecord>> {
        Ok(self
            .read()?
            .get(collection)
            .map(|c| {
                c.records
                    .values()
                    .filter(|r| r.parent_id.as_deref() == Some(parent_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn vector_hashes(&self, collection: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .read()?
            .get(collection)
            .map(|c| {
                c.vectors
                    .values()
                    .map(|v| (v.id.clone(), v.content_hash.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_vectors(&self, collection: &str, entries: &[VectorEntry]) -> Result<()> {
        let mut collections = self.write()?;
        let col = collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection))?;
        for entry in entries {
            if entry.vector.len() != entry.dims {
                bail!(
                    "vector {} has {} values, expected {}",
                    entry.id,
                    entry.vector.len(),
                    entry.dims
                );
            }
            col.vectors.insert(entry.id.clone(), entry.clone());
        }
        col.updated_at = now_secs();
        Ok(())
    }

    async fn delete_vectors(&self, collection: &str, ids: &[String]) -> Result<usize> {
        let mut collections = self.write()?;
        let Some(col) = collections.get_mut(collection) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| col.vectors.remove(*id).is_some()).count())
    }

    async fn vector_count(&self, collection: &str) -> Result<usize> {
        Ok(self
            .read()?
            .get(collection)
            .map(|c| c.vectors.len())
            .unwrap_or(0))
    }

    async fn search(
        &self,
        collections: &[String],
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let guard = self.read()?;
        let mut hits = Vec::new();
        for name in collections {
            let Some(col) = guard.get(name) else {
                continue;
            };
            for entry in col.vectors.values().filter(|v| v.vector.len() == query.len()) {
                hits.push(VectorHit {
                    collection: name.clone(),
                    id: entry.id.clone(),
                    record_id: entry.record_id.clone(),
                    kind: entry.kind.clone(),
                    text: entry.text.clone(),
                    score: cosine_similarity(query, &entry.vector),
                    metadata: entry.metadata.clone(),
                });
            }
        }
        Ok(rank_hits(hits, limit))
    }
}
