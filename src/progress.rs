//! Build progress reporting.
//!
//! Reports how far an `askapi index` (or the build inside `askapi serve`)
//! has got, so users can see records processed against the total and how
//! many views came from the cache. Progress goes to **stderr** so stdout
//! stays parseable for scripts.

use std::io::Write;

/// A single progress event for a build.
#[derive(Clone, Debug)]
pub enum BuildProgressEvent {
    /// Records have been built; view generation is about to start.
    Started { collection: String, total: u64 },
    /// `n` of `total` records have views generated and vectors written.
    Indexing {
        collection: String,
        n: u64,
        total: u64,
        cache_hits: u64,
        llm_calls: u64,
    },
    /// The build stopped, either finished or cancelled.
    Finished {
        collection: String,
        n: u64,
        total: u64,
        complete: bool,
    },
}

/// Reports build progress. Implementations write to stderr (human or JSON).
pub trait BuildProgressReporter: Send + Sync {
    fn report(&self, event: BuildProgressEvent);
}

/// Human-friendly progress: "index openapi_pets_0123abcd  indexing  12 / 40 records (cache 20, llm 4)".
pub struct StderrProgress;

impl BuildProgressReporter for StderrProgress {
    fn report(&self, event: BuildProgressEvent) {
        let line = match &event {
            BuildProgressEvent::Started { collection, total } => {
                format!("index {}  {} records\n", collection, format_number(*total))
            }
            BuildProgressEvent::Indexing {
                collection,
                n,
                total,
                cache_hits,
                llm_calls,
            } => format!(
                "index {}  indexing  {} / {} records (cache {}, llm {})\n",
                collection,
                format_number(*n),
                format_number(*total),
                format_number(*cache_hits),
                format_number(*llm_calls)
            ),
            BuildProgressEvent::Finished {
                collection,
                n,
                total,
                complete,
            } => format!(
                "index {}  {}  {} / {} records\n",
                collection,
                if *complete { "complete" } else { "incomplete" },
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BuildProgressReporter for JsonProgress {
    fn report(&self, event: BuildProgressEvent) {
        let obj = match &event {
            BuildProgressEvent::Started { collection, total } => serde_json::json!({
                "event": "progress",
                "collection": collection,
                "phase": "started",
                "total": total
            }),
            BuildProgressEvent::Indexing {
                collection,
                n,
                total,
                cache_hits,
                llm_calls,
            } => serde_json::json!({
                "event": "progress",
                "collection": collection,
                "phase": "indexing",
                "n": n,
                "total": total,
                "cache_hits": cache_hits,
                "llm_calls": llm_calls
            }),
            BuildProgressEvent::Finished {
                collection,
                n,
                total,
                complete,
            } => serde_json::json!({
                "event": "progress",
                "collection": collection,
                "phase": "finished",
                "n": n,
                "total": total,
                "complete": complete
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl BuildProgressReporter for NoProgress {
    fn report(&self, _event: BuildProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn BuildProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
