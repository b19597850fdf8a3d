//! SpecLoader: read a spec file or URL into a canonical, dereferenced tree.
//!
//! # Pipeline
//!
//! 1. Read the root document (local path, `http(s)://` URL, or raw text).
//! 2. Parse it as JSON or YAML. The format comes from the file extension
//!    when there is one, otherwise from the first non-blank character.
//! 3. Optionally check that it looks like OpenAPI 3.x / Swagger 2.0.
//! 4. Fetch every external document reachable through `$ref`s,
//!    breadth-first. Each document is fetched at most once per load.
//! 5. Resolve references with [`askapi_core::resolve::resolve`].
//! 6. Fingerprint the canonical tree.
//!
//! Unreachable references become warnings on [`LoadedSpec`] unless
//! `indexing.strict_refs` is set, in which case loading fails.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use askapi_core::builder::api_slug;
use askapi_core::error::{ParseError, RefFailure, RefResolutionError};
use askapi_core::fingerprint::SpecFingerprint;
use askapi_core::resolve::{external_documents, resolve, DocumentSet};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::IndexingConfig;

/// Identity used for specs supplied as raw text.
pub const MEMORY_ROOT: &str = "memory:///spec.json";

/// Where the root document comes from.
#[derive(Debug, Clone)]
pub enum SpecSource {
    Path(PathBuf),
    Url(Url),
    Text { text: String, format: Option<Format> },
}

impl SpecSource {
    /// Interpret a CLI argument: `http(s)://` is a URL, anything else a path.
    pub fn from_arg(arg: &str) -> Self {
        if arg.starts_with("http://") || arg.starts_with("https://") {
            if let Ok(url) = Url::parse(arg) {
                return SpecSource::Url(url);
            }
        }
        SpecSource::Path(PathBuf::from(arg))
    }

    /// Human label for logs and errors.
    pub fn origin(&self) -> String {
        match self {
            SpecSource::Path(p) => p.display().to_string(),
            SpecSource::Url(u) => u.to_string(),
            SpecSource::Text { .. } => "<text>".to_string(),
        }
    }
}

/// Serialization of a spec document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    fn name(&self) -> &'static str {
        match self {
            Format::Json => "JSON",
            Format::Yaml => "YAML",
        }
    }

    /// Format from a path or URL path extension.
    pub fn from_extension(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".json") {
            Some(Format::Json)
        } else if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            Some(Format::Yaml)
        } else {
            None
        }
    }

    /// Guess from content: objects and arrays that open with `{`/`[` are JSON.
    pub fn sniff(text: &str) -> Self {
        match text.trim_start().chars().next() {
            Some('{') | Some('[') => Format::Json,
            _ => Format::Yaml,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {origin}: {message}")]
    Read { origin: String, message: String },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{count} unresolved reference(s); first: {first}")]
    Unresolved {
        count: usize,
        first: RefResolutionError,
    },
}

/// A loaded, dereferenced and fingerprinted spec.
#[derive(Debug, Clone)]
pub struct LoadedSpec {
    pub origin: String,
    pub canonical: Value,
    pub fingerprint: SpecFingerprint,
    /// Slug of `info.title`.
    pub api_name: String,
    pub title: Option<String>,
    /// Cycles broken and references omitted while resolving.
    pub warnings: Vec<RefResolutionError>,
    /// Number of documents that took part (root + external).
    pub document_count: usize,
}

impl LoadedSpec {
    /// Vector collection holding this spec's views.
    pub fn collection_name(&self) -> String {
        format!("openapi_{}_{}", self.api_name, self.fingerprint.short())
    }

    /// Collection for auxiliary documents scoped to this spec.
    pub fn aux_collection_name(&self) -> String {
        format!("{}__aux", self.collection_name())
    }
}

/// Load, resolve and fingerprint a spec.
pub async fn load_spec(source: &SpecSource, config: &IndexingConfig) -> Result<LoadedSpec, LoadError> {
    let origin = source.origin();
    let fetcher = Fetcher::new(Duration::from_secs(config.fetch_timeout_secs));

    let (root_id, text, format) = match source {
        SpecSource::Path(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| LoadError::Read {
                    origin: origin.clone(),
                    message: e.to_string(),
                })?;
            let format = Format::from_extension(&path.to_string_lossy())
                .unwrap_or_else(|| Format::sniff(&text));
            (path_identity(path), text, format)
        }
        SpecSource::Url(url) => {
            let text = fetcher.fetch(url).await.map_err(|reason| LoadError::Read {
                origin: origin.clone(),
                message: reason.to_string(),
            })?;
            let format = Format::from_extension(url.path()).unwrap_or_else(|| Format::sniff(&text));
            let mut id = url.clone();
            id.set_fragment(None);
            (id.to_string(), text, format)
        }
        SpecSource::Text { text, format } => (
            MEMORY_ROOT.to_string(),
            text.clone(),
            format.unwrap_or_else(|| Format::sniff(text)),
        ),
    };

    let root = parse_document(&text, format, &origin)?;
    if config.validate {
        validate_structure(&root, &origin)?;
    }

    let mut docs = DocumentSet::new(root_id.clone(), root);
    let mut queue: VecDeque<String> = external_documents(docs.root(), &root_id).into_iter().collect();
    while let Some(doc_id) = queue.pop_front() {
        if docs.is_known(&doc_id) {
            continue;
        }
        match fetcher.fetch_document(&doc_id).await {
            Ok(doc) => {
                debug!(document = %doc_id, "external document loaded");
                queue.extend(external_documents(&doc, &doc_id));
                docs.insert(doc_id, doc);
            }
            Err(reason) => {
                warn!(document = %doc_id, %reason, "external document unavailable");
                docs.mark_unavailable(doc_id, reason);
            }
        }
    }

    let resolution = resolve(&docs);
    for warning in &resolution.warnings {
        if warning.is_cycle() {
            debug!(reference = %warning.reference, "reference cycle replaced by a named stub");
        } else {
            warn!(reference = %warning.reference, base = %warning.base, reason = %warning.reason, "unresolved reference");
        }
    }
    if config.strict_refs {
        let mut unresolved = resolution.warnings.iter().filter(|w| !w.is_cycle());
        if let Some(first) = unresolved.next() {
            return Err(LoadError::Unresolved {
                count: 1 + unresolved.count(),
                first: first.clone(),
            });
        }
    }

    let fingerprint = SpecFingerprint::of(&resolution.canonical);
    let title = resolution
        .canonical
        .get("info")
        .and_then(|i| i.get("title"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let api_name = api_slug(&resolution.canonical);
    info!(
        origin = %origin,
        fingerprint = %fingerprint.short(),
        api = %api_name,
        documents = docs.len(),
        warnings = resolution.warnings.len(),
        "spec loaded"
    );

    Ok(LoadedSpec {
        origin,
        canonical: resolution.canonical,
        fingerprint,
        api_name,
        title,
        warnings: resolution.warnings,
        document_count: docs.len(),
    })
}

/// `file://` URL of a local path, made absolute so relative refs join.
fn path_identity(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    Url::from_file_path(&absolute)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| format!("file://{}", absolute.display()))
}

/// Parse JSON or YAML text into a JSON tree.
pub fn parse_document(text: &str, format: Format, origin: &str) -> Result<Value, ParseError> {
    let syntax = |message: String| ParseError::Syntax {
        origin: origin.to_string(),
        format: format.name(),
        message,
    };
    match format {
        Format::Json => serde_json::from_str(text).map_err(|e| syntax(e.to_string())),
        Format::Yaml => {
            let yaml: serde_yaml::Value =
                serde_yaml::from_str(text).map_err(|e| syntax(e.to_string()))?;
            Ok(yaml_to_json(yaml))
        }
    }
}

/// Convert YAML to JSON. Non-string keys (e.g. status codes written as
/// bare `200:`) become their string form.
fn yaml_to_json(value: serde_yaml::Value) -> Value {
    use serde_yaml::Value as Y;
    match value {
        Y::Null => Value::Null,
        Y::Bool(b) => Value::Bool(b),
        Y::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        Y::String(s) => Value::String(s),
        Y::Sequence(items) => Value::Array(items.into_iter().map(yaml_to_json).collect()),
        Y::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(yaml_key(k), yaml_to_json(v));
            }
            Value::Object(out)
        }
        Y::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

fn yaml_key(key: serde_yaml::Value) -> String {
    use serde_yaml::Value as Y;
    match key {
        Y::String(s) => s,
        Y::Number(n) => n.to_string(),
        Y::Bool(b) => b.to_string(),
        Y::Null => "null".to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

fn validate_structure(root: &Value, origin: &str) -> Result<(), ParseError> {
    let not_openapi = |reason: &str| ParseError::NotOpenApi {
        origin: origin.to_string(),
        reason: reason.to_string(),
    };
    let obj = root
        .as_object()
        .ok_or_else(|| not_openapi("top level is not an object"))?;
    let version = obj
        .get("openapi")
        .or_else(|| obj.get("swagger"))
        .ok_or_else(|| not_openapi("missing `openapi` or `swagger` version"))?;
    if !(version.is_string() || version.is_number()) {
        return Err(not_openapi("version field is not a string"));
    }
    match obj.get("paths") {
        Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(not_openapi("`paths` is not an object")),
        None => Err(not_openapi("missing `paths`")),
    }
}

// ============ Fetching ============

struct Fetcher {
    client: Option<reqwest::Client>,
    timeout: Duration,
}

impl Fetcher {
    fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(timeout).build().ok();
        Self { client, timeout }
    }

    async fn fetch_document(&self, doc_id: &str) -> Result<Value, RefFailure> {
        let url = Url::parse(doc_id).map_err(|e| RefFailure::Fetch(e.to_string()))?;
        let text = self.fetch(&url).await?;
        let format = Format::from_extension(url.path()).unwrap_or_else(|| Format::sniff(&text));
        parse_document(&text, format, doc_id).map_err(|e| RefFailure::Unparsable(e.to_string()))
    }

    async fn fetch(&self, url: &Url) -> Result<String, RefFailure> {
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| RefFailure::Fetch(format!("invalid file URL {}", url)))?;
                match tokio::time::timeout(self.timeout, tokio::fs::read_to_string(&path)).await {
                    Ok(Ok(text)) => Ok(text),
                    Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(RefFailure::Fetch(format!("{} not found", path.display())))
                    }
                    Ok(Err(e)) => Err(RefFailure::Fetch(e.to_string())),
                    Err(_) => Err(RefFailure::Timeout),
                }
            }
            "http" | "https" => {
                let client = self
                    .client
                    .as_ref()
                    .ok_or_else(|| RefFailure::Fetch("HTTP client unavailable".to_string()))?;
                let response = client.get(url.clone()).send().await.map_err(|e| {
                    if e.is_timeout() {
                        RefFailure::Timeout
                    } else {
                        RefFailure::Fetch(e.to_string())
                    }
                })?;
                let status = response.status();
                if !status.is_success() {
                    return Err(RefFailure::Status(status.as_u16()));
                }
                response.text().await.map_err(|e| {
                    if e.is_timeout() {
                        RefFailure::Timeout
                    } else {
                        RefFailure::Fetch(e.to_string())
                    }
                })
            }
            other => Err(RefFailure::Fetch(format!("unsupported scheme `{}`", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askapi_core::resolve::UNRESOLVED_MARKER;

    const YAML_SPEC: &str = r#"
openapi: 3.0.3
info:
  title: Pet Store
  version: "1.0"
paths:
  /pets/{id}:
    get:
      operationId: getPet
      responses:
        200:
          description: ok
          content:
            application/json:
              schema:
                $ref: '#/components/schemas/Pet'
components:
  schemas:
    Pet:
      type: object
      properties:
        name:
          type: string
"#;

    fn config() -> IndexingConfig {
        IndexingConfig::default()
    }

    fn text(text: &str) -> SpecSource {
        SpecSource::Text {
            text: text.to_string(),
            format: None,
        }
    }

    #[test]
    fn test_sniff_and_extension() {
        assert_eq!(Format::sniff("  {\"openapi\": \"3.0.0\"}"), Format::Json);
        assert_eq!(Format::sniff("openapi: 3.0.0"), Format::Yaml);
        assert_eq!(Format::from_extension("api.YML"), Some(Format::Yaml));
        assert_eq!(Format::from_extension("/v1/openapi.json"), Some(Format::Json));
        assert_eq!(Format::from_extension("spec"), None);
    }

    #[test]
    fn test_yaml_numeric_keys_become_strings() {
        let value = parse_document(YAML_SPEC, Format::Yaml, "test").unwrap();
        let responses = &value["paths"]["/pets/{id}"]["get"]["responses"];
        assert!(responses.get("200").is_some());
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = parse_document("{\"openapi\": ", Format::Json, "broken.json").unwrap_err();
        assert!(matches!(err, ParseError::Syntax { format: "JSON", .. }));
    }

    #[tokio::test]
    async fn test_json_and_yaml_share_fingerprint() {
        let yaml = load_spec(&text(YAML_SPEC), &config()).await.unwrap();
        let tree = parse_document(YAML_SPEC, Format::Yaml, "test").unwrap();
        let json = load_spec(&text(&serde_json::to_string_pretty(&tree).unwrap()), &config())
            .await
            .unwrap();
        assert_eq!(yaml.fingerprint, json.fingerprint);
        assert_eq!(yaml.api_name, "pet_store");
        assert!(yaml.collection_name().starts_with("openapi_pet_store_"));
        assert!(yaml.aux_collection_name().ends_with("__aux"));
    }

    #[tokio::test]
    async fn test_not_openapi_rejected() {
        let err = load_spec(&text("{\"hello\": \"world\"}"), &config()).await.unwrap_err();
        assert!(matches!(err, LoadError::Parse(ParseError::NotOpenApi { .. })));

        let lenient = IndexingConfig {
            validate: false,
            ..config()
        };
        assert!(load_spec(&text("{\"hello\": \"world\"}"), &lenient).await.is_ok());
    }

    #[tokio::test]
    async fn test_external_file_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("models")).unwrap();
        std::fs::write(
            dir.path().join("models/pet.yaml"),
            "Pet:\n  type: object\n  properties:\n    name:\n      type: string\n",
        )
        .unwrap();
        let spec_path = dir.path().join("api.json");
        std::fs::write(
            &spec_path,
            r##"{
                "openapi": "3.0.0",
                "info": {"title": "Ext"},
                "paths": {"/pets": {"get": {"responses": {"200": {
                    "description": "ok",
                    "content": {"application/json": {"schema": {"$ref": "models/pet.yaml#/Pet"}}}
                }}}}}
            }"##,
        )
        .unwrap();

        let loaded = load_spec(&SpecSource::Path(spec_path), &config()).await.unwrap();
        assert!(loaded.warnings.is_empty(), "{:?}", loaded.warnings);
        assert_eq!(loaded.document_count, 2);
        let schema = &loaded.canonical["paths"]["/pets"]["get"]["responses"]["200"]["content"]
            ["application/json"]["schema"];
        assert_eq!(schema["properties"]["name"]["type"], "string");
    }

    #[tokio::test]
    async fn test_missing_external_file_is_warning_or_strict_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec_path = dir.path().join("api.json");
        std::fs::write(
            &spec_path,
            r##"{
                "openapi": "3.0.0",
                "paths": {"/pets": {"get": {"responses": {"200": {
                    "description": "ok",
                    "content": {"application/json": {"schema": {"$ref": "missing.yaml#/Pet"}}}
                }}}}}
            }"##,
        )
        .unwrap();

        let loaded = load_spec(&SpecSource::Path(spec_path.clone()), &config()).await.unwrap();
        assert_eq!(loaded.warnings.len(), 1);
        let schema = &loaded.canonical["paths"]["/pets"]["get"]["responses"]["200"]["content"]
            ["application/json"]["schema"];
        assert!(schema.get(UNRESOLVED_MARKER).is_some());

        let strict = IndexingConfig {
            strict_refs: true,
            ..config()
        };
        let err = load_spec(&SpecSource::Path(spec_path), &strict).await.unwrap_err();
        assert!(matches!(err, LoadError::Unresolved { count: 1, .. }));
    }

    #[tokio::test]
    async fn test_missing_root_file_is_read_error() {
        let err = load_spec(&SpecSource::Path(PathBuf::from("/nonexistent/api.yaml")), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
    }

    #[test]
    fn test_source_from_arg() {
        assert!(matches!(SpecSource::from_arg("https://x.io/openapi.json"), SpecSource::Url(_)));
        assert!(matches!(SpecSource::from_arg("./openapi.yaml"), SpecSource::Path(_)));
    }
}
