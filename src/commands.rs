//! CLI command implementations.
//!
//! Each `run_*` function backs one `askapi` subcommand. Command output goes
//! to stdout; logs and progress go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use askapi_core::builder::build_records;
use askapi_core::embedding::Embedder;
use askapi_core::llm::ChatModel;
use askapi_core::model::ViewKind;
use askapi_core::store::VectorStore;
use tracing::{info, warn};

use crate::cache::{list_cache_dirs, FileViewCache};
use crate::config::{parse_view_kinds, Config};
use crate::embedding::create_embedder;
use crate::index::VectorIndex;
use crate::llm::{chat_deadline, create_chat_model};
use crate::loader::{load_spec, LoadedSpec, SpecSource};
use crate::pipeline::{build_index, BuildReport, CancelFlag};
use crate::progress::ProgressMode;
use crate::rag::{Collections, RetrievalEngine};
use crate::server::{run_server, AppState};
use crate::sqlite_store::SqliteVectorStore;
use crate::views::ViewGenerator;

/// Per-invocation overrides of `[indexing]`.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub views: Option<Vec<String>>,
    pub concurrency: Option<usize>,
    pub progress: ProgressMode,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            views: None,
            concurrency: None,
            progress: ProgressMode::default_for_tty(),
        }
    }
}

/// Load and resolve a spec, logging absorbed reference problems.
pub async fn load(spec_arg: &str, config: &Config) -> Result<LoadedSpec> {
    let spec = load_spec(&SpecSource::from_arg(spec_arg), &config.indexing)
        .await
        .with_context(|| format!("Failed to load spec {}", spec_arg))?;
    for warning in &spec.warnings {
        warn!(%warning, "reference not inlined");
    }
    info!(
        origin = %spec.origin,
        fingerprint = %spec.fingerprint,
        documents = spec.document_count,
        "spec loaded"
    );
    Ok(spec)
}

async fn open_store(config: &Config) -> Result<Arc<SqliteVectorStore>> {
    Ok(Arc::new(SqliteVectorStore::open(config).await?))
}

fn collections_for(spec: &LoadedSpec) -> Collections {
    Collections {
        spec: spec.collection_name(),
        aux: spec.aux_collection_name(),
    }
}

// ============ init ============

pub async fn run_init(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    store.close().await;
    println!(
        "Database initialized successfully at {}.",
        config.storage.db_path.display()
    );
    Ok(())
}

// ============ fingerprint / records ============

pub async fn run_fingerprint(spec_arg: &str, config: &Config) -> Result<()> {
    let spec = load(spec_arg, config).await?;
    println!("fingerprint:  {}", spec.fingerprint);
    println!("api:          {}", spec.api_name);
    println!("collection:   {}", spec.collection_name());
    println!("auxiliary:    {}", spec.aux_collection_name());
    println!("documents:    {}", spec.document_count);
    println!("warnings:     {}", spec.warnings.len());
    Ok(())
}

pub async fn run_records(spec_arg: &str, config: &Config, json: bool) -> Result<()> {
    let spec = load(spec_arg, config).await?;
    let records = build_records(&spec.canonical);

    if json {
        let rows: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "kind": r.kind().as_str(),
                    "parent": r.parent,
                    "method": r.meta.method,
                    "path": r.meta.path,
                    "label": r.label(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for record in &records {
        println!(
            "{:<13} {:<7} {:<40} {}",
            record.kind().as_str(),
            record.meta.method.as_deref().unwrap_or("-"),
            record.meta.path.as_deref().unwrap_or("-"),
            record.id
        );
    }
    println!();
    println!("{} records", records.len());
    Ok(())
}

// ============ index / serve ============

struct Built {
    spec: LoadedSpec,
    report: BuildReport,
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    chat: Option<Arc<dyn ChatModel>>,
}

async fn build(
    spec_arg: &str,
    config: &Config,
    options: &BuildOptions,
    cancel: &CancelFlag,
) -> Result<Built> {
    let kinds: Vec<ViewKind> = match &options.views {
        Some(views) => parse_view_kinds(views)?,
        None => config.indexing.view_kinds()?,
    };
    let concurrency = options.concurrency.unwrap_or(config.indexing.concurrency);
    if concurrency == 0 {
        bail!("--concurrency must be > 0");
    }

    let spec = load(spec_arg, config).await?;
    let store = open_store(config).await?;
    let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(config)?);
    let chat: Option<Arc<dyn ChatModel>> = match create_chat_model(config) {
        Ok(chat) => Some(Arc::from(chat)),
        Err(e) => {
            warn!(error = %e, "no chat provider; summary and question views will fall back");
            None
        }
    };

    let cache = FileViewCache::open(
        &config.storage.cache_dir,
        &spec.fingerprint,
        spec.title.as_deref(),
    )
    .await?;
    let generator = ViewGenerator::new(
        chat.clone(),
        Arc::new(cache),
        kinds,
        chat_deadline(&config.llm),
    );
    let index = VectorIndex::new(store, embedder.clone());

    let reporter = options.progress.reporter();
    let report = build_index(
        &spec,
        &generator,
        &index,
        concurrency,
        reporter.as_ref(),
        cancel,
    )
    .await?;

    Ok(Built {
        spec,
        report,
        index,
        embedder,
        chat,
    })
}

fn print_report(report: &BuildReport) {
    println!(
        "Index {}{}",
        report.collection,
        if report.resumed { " (resumed)" } else { "" }
    );
    println!(
        "  records:       {} ({} indexed)",
        report.records, report.records_indexed
    );
    println!(
        "  views:         {} (cache {}, llm {}, fallback {})",
        report.views, report.cache_hits, report.llm_calls, report.fallback_views
    );
    println!(
        "  vectors:       {} embedded, {} unchanged, {} removed",
        report.vectors_embedded, report.vectors_skipped, report.vectors_removed
    );
    println!("  failed views:  {}", report.failed_views);
    for failure in report.failures.iter().take(10) {
        println!("    {}", failure);
    }
    if report.failures.len() > 10 {
        println!("    ... and {} more", report.failures.len() - 10);
    }
    println!(
        "  status:        {}",
        if report.complete {
            "complete"
        } else {
            "incomplete (rerun to resume)"
        }
    );
}

pub async fn run_index(
    spec_arg: &str,
    config: &Config,
    options: &BuildOptions,
    cancel: &CancelFlag,
    json: bool,
) -> Result<()> {
    let built = build(spec_arg, config, options, cancel).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&built.report)?);
    } else {
        print_report(&built.report);
    }
    Ok(())
}

pub async fn run_serve(
    spec_arg: &str,
    config: &Config,
    options: &BuildOptions,
    cancel: &CancelFlag,
) -> Result<()> {
    let built = build(spec_arg, config, options, cancel).await?;
    print_report(&built.report);
    if cancel.is_cancelled() {
        return Ok(());
    }
    let chat = built.chat.context(
        "serving answers needs a chat provider (set OPENAI_API_KEY or configure llm.fallback)",
    )?;

    let engine = RetrievalEngine::new(
        built.index.store().clone(),
        built.embedder,
        chat,
        config.retrieval.clone(),
    );
    let state = AppState {
        spec: Arc::new(built.spec),
        engine: Arc::new(engine),
        index: built.index,
        max_document_chars: config.server.max_document_chars,
    };
    let shutdown = {
        let cancel = cancel.clone();
        async move { cancel.cancelled().await }
    };
    run_server(state, &config.server.bind, shutdown).await
}

// ============ ask / add ============

pub async fn run_ask(spec_arg: &str, question: &str, config: &Config) -> Result<()> {
    let spec = load(spec_arg, config).await?;
    let store = open_store(config).await?;
    let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(config)?);
    let chat: Arc<dyn ChatModel> = Arc::from(create_chat_model(config)?);
    let engine = RetrievalEngine::new(store, embedder, chat, config.retrieval.clone());

    let answer = engine
        .answer(&collections_for(&spec), question, &[])
        .await?;

    println!("{}", answer.answer);
    if !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        for source in &answer.sources {
            println!("  {:.3}  {}", source.score, source.label);
        }
    }
    if !answer.index_complete {
        eprintln!("note: the index for this spec is incomplete; run `askapi index` to finish it");
    }
    Ok(())
}

pub async fn run_add(
    spec_arg: &str,
    text: Option<&str>,
    files: &[PathBuf],
    config: &Config,
) -> Result<()> {
    if text.is_none() && files.is_empty() {
        bail!("nothing to add: pass --text or one or more files");
    }

    for path in files {
        match path.extension().and_then(|e| e.to_str()) {
            Some("txt") | Some("md") | Some("markdown") => {}
            _ => bail!("{}: only .txt and .md files can be added", path.display()),
        }
    }

    let mut documents = Vec::new();
    if let Some(text) = text {
        documents.push(("pasted".to_string(), text.to_string()));
    }
    for path in files {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        documents.push((source, content));
    }

    let spec = load(spec_arg, config).await?;
    let store = open_store(config).await?;
    let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(config)?);
    let index = VectorIndex::new(store, embedder);
    let max_chars = config.server.max_document_chars;

    for (source, content) in documents {
        let report = index
            .add_auxiliary(&spec, &source, &content, max_chars)
            .await?;
        println!(
            "{}: {} chunks indexed, {} unchanged",
            source, report.chunks_indexed, report.chunks_skipped
        );
    }
    Ok(())
}

// ============ collections / cache ============

pub async fn run_collections_list(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let collections = store.list_collections().await?;
    if collections.is_empty() {
        println!("No collections.");
        return Ok(());
    }
    println!(
        "{:<50} {:<10} {:>8} {:>8}  {}",
        "NAME", "ROLE", "RECORDS", "VECTORS", "STATE"
    );
    for c in &collections {
        println!(
            "{:<50} {:<10} {:>8} {:>8}  {}",
            c.name,
            c.role.as_str(),
            c.record_count,
            c.vector_count,
            if c.complete { "complete" } else { "incomplete" }
        );
    }
    Ok(())
}

pub async fn run_collections_drop(name: &str, config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    if store.drop_collection(name).await? {
        println!("Dropped collection {}.", name);
        Ok(())
    } else {
        bail!("collection {} does not exist", name)
    }
}

pub async fn run_cache_list(config: &Config) -> Result<()> {
    let dirs = list_cache_dirs(&config.storage.cache_dir).await?;
    if dirs.is_empty() {
        println!("View cache is empty ({}).", config.storage.cache_dir.display());
        return Ok(());
    }
    for dir in &dirs {
        println!(
            "{}  {:>6} views  {}",
            dir.fingerprint,
            dir.cells,
            dir.title.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
