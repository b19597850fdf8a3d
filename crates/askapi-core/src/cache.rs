//! View cache abstraction.
//!
//! A cache maps `(record ID, view kind)` to previously generated view text
//! for one spec fingerprint. The generator consults it before every LLM
//! call and writes to it after every successful one. Implementations:
//!
//! | Type | Crate | Backing |
//! |------|-------|---------|
//! | [`MemoryViewCache`] | core | `RwLock<HashMap>` |
//! | `FileViewCache` | app | one JSON file per cell, atomic rename |

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::model::ViewKind;

#[async_trait]
pub trait ViewCache: Send + Sync {
    /// Cached text for a cell, if any.
    async fn get(&self, record_id: &str, kind: ViewKind) -> Option<String>;
    /// Store text for a cell, replacing any previous value.
    async fn put(&self, record_id: &str, kind: ViewKind, text: &str) -> Result<()>;
    /// Number of cached cells.
    async fn cell_count(&self) -> usize;
}

/// Process-local cache, used in tests and for `--no-cache` style runs.
#[derive(Debug, Default)]
pub struct MemoryViewCache {
    cells: RwLock<HashMap<(String, ViewKind), String>>,
}

impl MemoryViewCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ViewCache for MemoryViewCache {
    async fn get(&self, record_id: &str, kind: ViewKind) -> Option<String> {
        let cells = self.cells.read().ok()?;
        cells.get(&(record_id.to_string(), kind)).cloned()
    }

    async fn put(&self, record_id: &str, kind: ViewKind, text: &str) -> Result<()> {
        let mut cells = self
            .cells
            .write()
            .map_err(|_| anyhow!("view cache lock poisoned"))?;
        cells.insert((record_id.to_string(), kind), text.to_string());
        Ok(())
    }

    async fn cell_count(&self) -> usize {
        self.cells.read().map(|c| c.len()).unwrap_or(0)
    }
}
