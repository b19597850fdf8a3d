//! SQLite-backed [`VectorStore`].
//!
//! Schema (see `migrate.rs`):
//!
//! | Table | Key | Holds |
//! |---|---|---|
//! | `collections` | `name` | fingerprint, role, build state |
//! | `records` | `(collection, id)` | rendered record text and metadata |
//! | `vectors` | `(collection, id)` | view text, content hash, f32 BLOB |
//!
//! Every batch upsert runs in one transaction with
//! `INSERT .. ON CONFLICT DO UPDATE`, so re-writing a view ID replaces the
//! row in place. Search loads the requested collections' vectors and ranks
//! them by cosine similarity in process.

use std::collections::HashMap;

use anyhow::{bail, Result};
use askapi_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use askapi_core::store::{
    rank_hits, CollectionInfo, CollectionRole, CollectionSpec, StoredRecord, VectorEntry,
    VectorHit, VectorStore,
};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::{db, migrate};

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `storage.db_path` and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_metadata(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({}))
}

fn row_to_record(row: &SqliteRow) -> StoredRecord {
    let metadata: String = row.get("metadata_json");
    StoredRecord {
        id: row.get("id"),
        parent_id: row.get("parent_id"),
        kind: row.get("kind"),
        text: row.get("text"),
        metadata: parse_metadata(&metadata),
    }
}

const COLLECTION_SELECT: &str = r#"
    SELECT c.name, c.fingerprint, c.role, c.api_name, c.complete, c.run_id,
           c.created_at, c.updated_at,
           (SELECT COUNT(*) FROM records r WHERE r.collection = c.name) AS record_count,
           (SELECT COUNT(*) FROM vectors v WHERE v.collection = c.name) AS vector_count
    FROM collections c
"#;

fn row_to_collection(row: &SqliteRow) -> CollectionInfo {
    let role: String = row.get("role");
    let record_count: i64 = row.get("record_count");
    let vector_count: i64 = row.get("vector_count");
    CollectionInfo {
        name: row.get("name"),
        fingerprint: row.get("fingerprint"),
        role: CollectionRole::parse(&role).unwrap_or(CollectionRole::Spec),
        api_name: row.get("api_name"),
        complete: row.get::<i64, _>("complete") != 0,
        run_id: row.get("run_id"),
        record_count: record_count as usize,
        vector_count: vector_count as usize,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO collections (name, fingerprint, role, api_name, complete, run_id,
                                     created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, NULL, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.fingerprint)
        .bind(spec.role.as_str())
        .bind(&spec.api_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let row = sqlx::query(&format!("{} WHERE c.name = ?", COLLECTION_SELECT))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_collection))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let rows = sqlx::query(&format!("{} ORDER BY c.name", COLLECTION_SELECT))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_collection).collect())
    }

    async fn drop_collection(&self, name: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vectors WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM records WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn set_build_state(&self, name: &str, complete: bool, run_id: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE collections SET complete = ?, run_id = ?, updated_at = ? WHERE name = ?",
        )
        .bind(complete as i64)
        .bind(run_id)
        .bind(chrono::Utc::now().timestamp())
        .bind(name)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            bail!("collection {} does not exist", name);
        }
        Ok(())
    }

    async fn upsert_records(&self, collection: &str, records: &[StoredRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO records (collection, id, parent_id, kind, text, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    kind = excluded.kind,
                    text = excluded.text,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(collection)
            .bind(&record.id)
            .bind(&record.parent_id)
            .bind(&record.kind)
            .bind(&record.text)
            .bind(record.metadata.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_record(&self, collection: &str, id: &str) -> Result<Option<StoredRecord>> {
        let row = sqlx::query(
            "SELECT id, parent_id, kind, text, metadata_json FROM records WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_record))
    }

    async fn child_records(&self, collection: &str, parent_id: &str) -> Result<Vec<StoredRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, parent_id, kind, text, metadata_json FROM records
            WHERE collection = ? AND parent_id = ?
            ORDER BY id
            "#,
        )
        .bind(collection)
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn vector_hashes(&self, collection: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT id, content_hash FROM vectors WHERE collection = ?")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("id"), row.get("content_hash")))
            .collect())
    }

    async fn upsert_vectors(&self, collection: &str, entries: &[VectorEntry]) -> Result<()> {
        for entry in entries {
            if entry.vector.len() != entry.dims {
                bail!(
                    "vector {} has {} values, expected {}",
                    entry.id,
                    entry.vector.len(),
                    entry.dims
                );
            }
        }

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO vectors (collection, id, record_id, kind, text, content_hash,
                                     model, dims, embedding, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    record_id = excluded.record_id,
                    kind = excluded.kind,
                    text = excluded.text,
                    content_hash = excluded.content_hash,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(collection)
            .bind(&entry.id)
            .bind(&entry.record_id)
            .bind(&entry.kind)
            .bind(&entry.text)
            .bind(&entry.content_hash)
            .bind(&entry.model)
            .bind(entry.dims as i64)
            .bind(vec_to_blob(&entry.vector))
            .bind(entry.metadata.to_string())
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE collections SET updated_at = ? WHERE name = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_vectors(&self, collection: &str, ids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM vectors WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn vector_count(&self, collection: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn search(
        &self,
        collections: &[String],
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let mut hits = Vec::new();
        for name in collections {
            let rows = sqlx::query(
                r#"
                SELECT id, record_id, kind, text, embedding, metadata_json
                FROM vectors WHERE collection = ? AND dims = ?
                "#,
            )
            .bind(name)
            .bind(query.len() as i64)
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                let blob: Vec<u8> = row.get("embedding");
                let metadata: String = row.get("metadata_json");
                hits.push(VectorHit {
                    collection: name.clone(),
                    id: row.get("id"),
                    record_id: row.get("record_id"),
                    kind: row.get("kind"),
                    text: row.get("text"),
                    score: cosine_similarity(query, &blob_to_vec(&blob)),
                    metadata: parse_metadata(&metadata),
                });
            }
        }
        Ok(rank_hits(hits, limit))
    }
}
