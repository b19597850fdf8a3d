//! # askapi CLI
//!
//! The `askapi` binary turns an OpenAPI/Swagger document into a
//! question-answering index and answers questions against it.
//!
//! ## Usage
//!
//! ```bash
//! askapi --config ./config/askapi.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `askapi init` | Create the SQLite database and run schema migrations |
//! | `askapi index <spec>` | Build or resume the index for a spec |
//! | `askapi ask <spec> "<question>"` | Answer a question from an existing index |
//! | `askapi add <spec> [--text T] [FILES..]` | Add auxiliary documents |
//! | `askapi serve <spec>` | Build/resume, then serve the HTTP API |
//! | `askapi records <spec>` | List the records a spec produces |
//! | `askapi fingerprint <spec>` | Print the fingerprint and collection names |
//! | `askapi collections list\|drop` | Inspect or drop vector collections |
//! | `askapi cache list` | List fingerprints in the view cache |
//!
//! `<spec>` is a local path or an `http(s)://` URL, JSON or YAML.

use std::path::PathBuf;

use anyhow::bail;
use askapi::commands::{self, BuildOptions};
use askapi::config;
use askapi::pipeline::CancelFlag;
use askapi::progress::ProgressMode;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// askapi: ask questions about an HTTP API from its OpenAPI document.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means defaults. See `config/askapi.example.toml`.
#[derive(Parser)]
#[command(
    name = "askapi",
    about = "Ask questions about an HTTP API from its OpenAPI document",
    version,
    long_about = "askapi resolves an OpenAPI/Swagger document, splits it into operation, \
    parameter, body, response and schema records, generates LLM views of each record, \
    embeds them into a resumable SQLite vector index, and answers questions with \
    retrieval-augmented generation from the CLI or an HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/askapi.toml")]
    config: PathBuf,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Shortcut for `--log-level debug`.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Build or resume the index for a spec.
    ///
    /// Records whose views and vectors are already stored are skipped, so
    /// an interrupted build picks up where it stopped. Ctrl-C stops the
    /// build between records.
    Index {
        /// Spec path or URL.
        spec: String,

        /// View kinds to generate (summary, question, example).
        #[arg(long, value_delimiter = ',')]
        views: Option<Vec<String>>,

        /// Records processed in parallel.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Progress on stderr: human, json, or off.
        #[arg(long)]
        progress: Option<String>,

        /// Print the build report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Answer a question from an existing index.
    Ask {
        /// Spec path or URL.
        spec: String,
        /// The question.
        question: String,
    },

    /// Add auxiliary documents (.txt or .md) next to a spec's index.
    Add {
        /// Spec path or URL.
        spec: String,

        /// Inline text to add.
        #[arg(long)]
        text: Option<String>,

        /// Files to add.
        files: Vec<PathBuf>,
    },

    /// Build or resume the index, then serve the HTTP API.
    ///
    /// Binds to `[server].bind`.
    Serve {
        /// Spec path or URL.
        spec: String,

        /// Progress on stderr: human, json, or off.
        #[arg(long)]
        progress: Option<String>,
    },

    /// List the records a spec produces. No provider is contacted.
    Records {
        /// Spec path or URL.
        spec: String,

        #[arg(long)]
        json: bool,
    },

    /// Print a spec's fingerprint and collection names.
    Fingerprint {
        /// Spec path or URL.
        spec: String,
    },

    /// Inspect or drop vector collections.
    Collections {
        #[command(subcommand)]
        action: CollectionsAction,
    },

    /// Inspect the view cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CollectionsAction {
    /// List collections with counts and build state.
    List,
    /// Drop a collection and all of its rows.
    Drop {
        /// Collection name (see `collections list`).
        name: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List fingerprint directories in the view cache.
    List,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn progress_mode(arg: Option<&str>) -> anyhow::Result<ProgressMode> {
    match arg {
        None => Ok(ProgressMode::default_for_tty()),
        Some(s) => match ProgressMode::parse(s) {
            Some(mode) => Ok(mode),
            None => bail!("--progress must be human, json, or off (got {})", s),
        },
    }
}

/// First Ctrl-C cancels the running build or server; a second one exits.
fn install_ctrl_c(cancel: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received; stopping after in-flight records (Ctrl-C again to abort)");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(if cli.debug { "debug" } else { &cli.log_level });

    let cfg = config::load_config_or_default(&cli.config)?;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::Index {
            spec,
            views,
            concurrency,
            progress,
            json,
        } => {
            let options = BuildOptions {
                views,
                concurrency,
                progress: progress_mode(progress.as_deref())?,
            };
            let cancel = CancelFlag::new();
            install_ctrl_c(cancel.clone());
            commands::run_index(&spec, &cfg, &options, &cancel, json).await?;
        }
        Commands::Ask { spec, question } => {
            commands::run_ask(&spec, &question, &cfg).await?;
        }
        Commands::Add { spec, text, files } => {
            commands::run_add(&spec, text.as_deref(), &files, &cfg).await?;
        }
        Commands::Serve { spec, progress } => {
            let options = BuildOptions {
                progress: progress_mode(progress.as_deref())?,
                ..BuildOptions::default()
            };
            let cancel = CancelFlag::new();
            install_ctrl_c(cancel.clone());
            commands::run_serve(&spec, &cfg, &options, &cancel).await?;
        }
        Commands::Records { spec, json } => {
            commands::run_records(&spec, &cfg, json).await?;
        }
        Commands::Fingerprint { spec } => {
            commands::run_fingerprint(&spec, &cfg).await?;
        }
        Commands::Collections { action } => match action {
            CollectionsAction::List => commands::run_collections_list(&cfg).await?,
            CollectionsAction::Drop { name } => commands::run_collections_drop(&name, &cfg).await?,
        },
        Commands::Cache { action } => match action {
            CacheAction::List => commands::run_cache_list(&cfg).await?,
        },
    }

    Ok(())
}
