//! On-disk view cache.
//!
//! Layout under `storage.cache_dir`:
//!
//! ```text
//! <cache_dir>/
//!   <fingerprint>/
//!     manifest.json                      # title, fingerprint, created_at
//!     <sha256(record_id)[..24]>.<kind>.json
//! ```
//!
//! One JSON file per `(record, kind)` cell. Every write goes to a unique
//! temp file in the same directory and is renamed into place, so a crash
//! mid-write never corrupts an existing cell. Directories for other
//! fingerprints are never read or deleted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use askapi_core::cache::ViewCache;
use askapi_core::fingerprint::{sha256_hex, SpecFingerprint};
use askapi_core::model::ViewKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const MANIFEST: &str = "manifest.json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct CacheCell {
    record_id: String,
    kind: ViewKind,
    text: String,
    created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    pub fingerprint: String,
    pub title: Option<String>,
    pub created_at: String,
}

/// File-backed [`ViewCache`] for one spec fingerprint.
///
/// All cells are read when the cache is opened; afterwards reads are served
/// from memory and writes go to memory and disk.
pub struct FileViewCache {
    dir: PathBuf,
    cells: RwLock<HashMap<(String, ViewKind), String>>,
}

impl FileViewCache {
    /// Open (creating if needed) the cache directory for `fingerprint`.
    pub async fn open(
        cache_dir: &Path,
        fingerprint: &SpecFingerprint,
        title: Option<&str>,
    ) -> Result<Self> {
        let dir = cache_dir.join(fingerprint.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;

        let manifest_path = dir.join(MANIFEST);
        if !manifest_path.exists() {
            let manifest = CacheManifest {
                fingerprint: fingerprint.to_string(),
                title: title.map(str::to_string),
                created_at: chrono::Utc::now().to_rfc3339(),
            };
            atomic_write(&manifest_path, &serde_json::to_vec_pretty(&manifest)?).await?;
        }

        let mut cells = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == MANIFEST || name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            match read_cell(&entry.path()).await {
                Ok(cell) if cell_file_name(&cell.record_id, cell.kind) == name => {
                    cells.insert((cell.record_id, cell.kind), cell.text);
                }
                Ok(_) => warn!(file = %name, "cache cell does not match its file name; skipped"),
                Err(e) => warn!(file = %name, error = %e, "unreadable cache cell; skipped"),
            }
        }
        debug!(dir = %dir.display(), cells = cells.len(), "view cache opened");

        Ok(Self {
            dir,
            cells: RwLock::new(cells),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ViewCache for FileViewCache {
    async fn get(&self, record_id: &str, kind: ViewKind) -> Option<String> {
        let cells = self.cells.read().ok()?;
        cells.get(&(record_id.to_string(), kind)).cloned()
    }

    async fn put(&self, record_id: &str, kind: ViewKind, text: &str) -> Result<()> {
        let cell = CacheCell {
            record_id: record_id.to_string(),
            kind,
            text: text.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let path = self.dir.join(cell_file_name(record_id, kind));
        atomic_write(&path, &serde_json::to_vec_pretty(&cell)?).await?;
        self.cells
            .write()
            .map_err(|_| anyhow!("view cache lock poisoned"))?
            .insert((record_id.to_string(), kind), text.to_string());
        Ok(())
    }

    async fn cell_count(&self) -> usize {
        self.cells.read().map(|c| c.len()).unwrap_or(0)
    }
}

/// `<sha256(record_id)[..24]>.<kind>.json`
fn cell_file_name(record_id: &str, kind: ViewKind) -> String {
    format!("{}.{}.json", &sha256_hex(record_id)[..24], kind)
}

async fn read_cell(path: &Path) -> Result<CacheCell> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write via a unique temp file in the same directory, then rename.
async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_file_name(format!(
        ".{}.{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        nanos,
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::write(&temp_path, content)
        .await
        .with_context(|| format!("Failed to write {}", temp_path.display()))?;
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e).with_context(|| format!("Failed to move cache cell into {}", path.display()));
    }
    Ok(())
}

/// Summary of one fingerprint directory, for `askapi cache list`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheDirInfo {
    pub fingerprint: String,
    pub title: Option<String>,
    pub created_at: Option<String>,
    pub cells: usize,
}

/// Every fingerprint directory under `cache_dir`, sorted by fingerprint.
pub async fn list_cache_dirs(cache_dir: &Path) -> Result<Vec<CacheDirInfo>> {
    let mut out = Vec::new();
    if !cache_dir.exists() {
        return Ok(out);
    }
    let mut entries = tokio::fs::read_dir(cache_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let dir = entry.path();
        let manifest: Option<CacheManifest> = tokio::fs::read(dir.join(MANIFEST))
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        let mut cells = 0;
        let mut files = tokio::fs::read_dir(&dir).await?;
        while let Some(file) = files.next_entry().await? {
            let name = file.file_name().to_string_lossy().to_string();
            if name != MANIFEST && !name.starts_with('.') && name.ends_with(".json") {
                cells += 1;
            }
        }
        out.push(CacheDirInfo {
            fingerprint: entry.file_name().to_string_lossy().to_string(),
            title: manifest.as_ref().and_then(|m| m.title.clone()),
            created_at: manifest.map(|m| m.created_at),
            cells,
        });
    }
    out.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp(seed: &str) -> SpecFingerprint {
        SpecFingerprint::of(&json!({ "seed": seed }))
    }

    #[tokio::test]
    async fn test_put_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let fingerprint = fp("a");
        {
            let cache = FileViewCache::open(tmp.path(), &fingerprint, Some("Pets")).await.unwrap();
            cache.put("operation:getPet", ViewKind::Summary, "Fetch a pet").await.unwrap();
            cache.put("operation:getPet", ViewKind::Question, "- how?").await.unwrap();
        }
        let cache = FileViewCache::open(tmp.path(), &fingerprint, None).await.unwrap();
        assert_eq!(cache.cell_count().await, 2);
        assert_eq!(
            cache.get("operation:getPet", ViewKind::Summary).await.as_deref(),
            Some("Fetch a pet")
        );
    }

    #[tokio::test]
    async fn test_other_fingerprint_is_isolated_and_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let old = FileViewCache::open(tmp.path(), &fp("old"), None).await.unwrap();
        old.put("operation:x", ViewKind::Summary, "old text").await.unwrap();

        let new = FileViewCache::open(tmp.path(), &fp("new"), None).await.unwrap();
        assert_eq!(new.get("operation:x", ViewKind::Summary).await, None);
        assert_eq!(new.cell_count().await, 0);

        let dirs = list_cache_dirs(tmp.path()).await.unwrap();
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs.iter().map(|d| d.cells).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_cell_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let fingerprint = fp("c");
        let cache = FileViewCache::open(tmp.path(), &fingerprint, None).await.unwrap();
        cache.put("schema:Pet", ViewKind::Summary, "A pet").await.unwrap();
        std::fs::write(cache.dir().join("garbage.summary.json"), b"{not json").unwrap();
        std::fs::write(cache.dir().join(".leftover.tmp"), b"partial").unwrap();

        let reopened = FileViewCache::open(tmp.path(), &fingerprint, None).await.unwrap();
        assert_eq!(reopened.cell_count().await, 1);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileViewCache::open(tmp.path(), &fp("t"), None).await.unwrap();
        cache.put("operation:a", ViewKind::Summary, "text").await.unwrap();
        let leftovers = std::fs::read_dir(cache.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
