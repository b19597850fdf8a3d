//! Spec-to-index build.
//!
//! ```text
//! LoadedSpec ─▶ build_records ─▶ put_records
//!                     │
//!                     ▼  (bounded concurrency, cancellable between records)
//!              ViewGenerator::generate ─▶ VectorIndex::index_views
//!                     │
//!                     ▼
//!              set_build_state(complete, run_id)
//! ```
//!
//! View failures are absorbed into the [`BuildReport`]; a store or
//! embedding failure aborts the run with [`IndexWriteError`]. Either way
//! everything written so far stays valid and the next run resumes from it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use askapi_core::builder::build_records;
use askapi_core::error::{IndexWriteError, ViewGenerationError};
use askapi_core::model::Record;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, info_span, warn, Instrument};

use crate::index::VectorIndex;
use crate::loader::LoadedSpec;
use crate::progress::{BuildProgressEvent, BuildProgressReporter};
use crate::views::ViewGenerator;

/// Shared stop flag checked between records.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<CancelInner>);

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let notified = self.0.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[derive(Debug, Default, Serialize)]
pub struct BuildReport {
    pub collection: String,
    pub run_id: String,
    pub fingerprint: String,
    pub resumed: bool,
    pub records: usize,
    pub records_indexed: usize,
    pub views: usize,
    pub cache_hits: usize,
    pub llm_calls: usize,
    pub fallback_views: usize,
    pub vectors_embedded: usize,
    pub vectors_skipped: usize,
    pub vectors_removed: usize,
    pub failed_views: usize,
    #[serde(skip)]
    pub failures: Vec<ViewGenerationError>,
    pub complete: bool,
}

/// Build or resume the index for `spec`.
pub async fn build_index(
    spec: &LoadedSpec,
    generator: &ViewGenerator,
    index: &VectorIndex,
    concurrency: usize,
    progress: &dyn BuildProgressReporter,
    cancel: &CancelFlag,
) -> Result<BuildReport, IndexWriteError> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!("build", run_id = %run_id, fingerprint = %spec.fingerprint.short());
    run_build(spec, generator, index, concurrency, progress, cancel, run_id)
        .instrument(span)
        .await
}

async fn run_build(
    spec: &LoadedSpec,
    generator: &ViewGenerator,
    index: &VectorIndex,
    concurrency: usize,
    progress: &dyn BuildProgressReporter,
    cancel: &CancelFlag,
    run_id: String,
) -> Result<BuildReport, IndexWriteError> {
    let collection = spec.collection_name();
    let records = build_records(&spec.canonical);
    info!(collection = %collection, records = records.len(), "records built");

    let state = index.open(spec).await?;
    index.finish(&collection, false, &run_id).await?;
    index.put_records(&collection, &records).await?;

    let mut report = BuildReport {
        collection: collection.clone(),
        run_id: run_id.clone(),
        fingerprint: spec.fingerprint.to_string(),
        resumed: state.resumed,
        records: records.len(),
        ..BuildReport::default()
    };
    let total = records.len() as u64;
    progress.report(BuildProgressEvent::Started {
        collection: collection.clone(),
        total,
    });

    let state = &state;
    let collection_ref = collection.as_str();
    let mut results = stream::iter(records.iter())
        .map(|record: &Record| async move {
            if cancel.is_cancelled() {
                return None;
            }
            let views = generator.generate(record).await;
            let indexed = index
                .index_views(collection_ref, record, &views.views, state)
                .await;
            Some((views, indexed))
        })
        .buffer_unordered(concurrency.max(1));

    while let Some(result) = results.next().await {
        let Some((views, indexed)) = result else {
            continue;
        };
        let indexed = indexed?;

        report.records_indexed += 1;
        report.views += views.views.len();
        report.cache_hits += views.cache_hits;
        report.llm_calls += views.llm_calls;
        report.fallback_views += views.fallback as usize;
        report.failed_views += views.errors.len();
        report.failures.extend(views.errors);
        report.vectors_embedded += indexed.embedded;
        report.vectors_skipped += indexed.skipped;
        report.vectors_removed += indexed.removed;

        progress.report(BuildProgressEvent::Indexing {
            collection: collection.clone(),
            n: report.records_indexed as u64,
            total,
            cache_hits: report.cache_hits as u64,
            llm_calls: report.llm_calls as u64,
        });
    }
    drop(results);

    report.complete = !cancel.is_cancelled() && report.records_indexed == report.records;
    index.finish(&collection, report.complete, &run_id).await?;
    progress.report(BuildProgressEvent::Finished {
        collection: collection.clone(),
        n: report.records_indexed as u64,
        total,
        complete: report.complete,
    });

    if report.complete {
        info!(
            collection = %collection,
            records = report.records,
            cache_hits = report.cache_hits,
            llm_calls = report.llm_calls,
            embedded = report.vectors_embedded,
            skipped = report.vectors_skipped,
            "index complete"
        );
    } else {
        warn!(
            collection = %collection,
            indexed = report.records_indexed,
            records = report.records,
            "build stopped before all records were indexed; rerun to resume"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        tokio::task::yield_now().await;
        flag.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
