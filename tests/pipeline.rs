//! End-to-end pipeline tests: load → build → resume → answer, over the
//! SQLite store with deterministic fake providers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use askapi::cache::FileViewCache;
use askapi::config::{Config, IndexingConfig, RetrievalConfig};
use askapi::index::VectorIndex;
use askapi::loader::{load_spec, LoadedSpec, SpecSource};
use askapi::pipeline::{build_index, BuildReport, CancelFlag};
use askapi::progress::NoProgress;
use askapi::rag::{Collections, RetrievalEngine};
use askapi::sqlite_store::SqliteVectorStore;
use askapi::views::ViewGenerator;
use askapi_core::embedding::Embedder;
use askapi_core::error::AnswerError;
use askapi_core::llm::{ChatMessage, ChatModel, Role};
use askapi_core::model::ViewKind;
use askapi_core::store::VectorStore;
use async_trait::async_trait;
use tempfile::TempDir;

const PETSTORE: &str = r##"
openapi: 3.0.0
info:
  title: Petstore
  version: "1.0"
servers:
  - url: https://petstore.example.com/v1
paths:
  /pets:
    get:
      operationId: listPets
      summary: List all pets
      parameters:
        - name: limit
          in: query
          schema:
            type: integer
      responses:
        "200":
          description: A page of pets
          content:
            application/json:
              schema:
                type: array
                items:
                  $ref: "#/components/schemas/Pet"
    post:
      operationId: createPet
      summary: Create a pet
      requestBody:
        required: true
        content:
          application/json:
            schema:
              $ref: "#/components/schemas/Pet"
      responses:
        "201":
          description: Created
  /pets/{petId}:
    delete:
      summary: Delete a pet
      parameters:
        - name: petId
          in: path
          required: true
          schema:
            type: string
      responses:
        "204":
          description: Deleted
components:
  schemas:
    Pet:
      type: object
      required: [name]
      properties:
        name:
          type: string
        tag:
          type: string
    Node:
      type: object
      properties:
        value:
          type: string
        children:
          type: array
          items:
            $ref: "#/components/schemas/Node"
"##;

// ============ Fakes ============

/// Echoes its input so answers carry the retrieved context verbatim.
struct EchoChat {
    calls: AtomicUsize,
}

impl EchoChat {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for EchoChat {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(messages
            .iter()
            .filter(|m| m.role == Role::User || m.content.starts_with("Context:"))
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

struct FailingChat;

#[async_trait]
impl ChatModel for FailingChat {
    fn name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
        bail!("provider unavailable")
    }
}

/// Bag-of-words embedder: each lowercase alphanumeric token is hashed
/// into one of `DIMS` buckets.
struct BagOfWords;

const DIMS: usize = 512;

fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for token in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        token.to_ascii_lowercase().hash(&mut hasher);
        v[(hasher.finish() as usize) % DIMS] += 1.0;
    }
    v
}

#[async_trait]
impl Embedder for BagOfWords {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

// ============ Harness ============

struct Env {
    _tmp: TempDir,
    spec_path: PathBuf,
    cache_dir: PathBuf,
    store: Arc<SqliteVectorStore>,
}

async fn env() -> Env {
    let tmp = TempDir::new().unwrap();
    let spec_path = tmp.path().join("petstore.yaml");
    std::fs::write(&spec_path, PETSTORE).unwrap();
    let mut config = Config::default();
    config.storage.db_path = tmp.path().join("data").join("askapi.sqlite");
    config.storage.cache_dir = tmp.path().join("data").join("cache");
    let store = Arc::new(SqliteVectorStore::open(&config).await.unwrap());
    Env {
        cache_dir: config.storage.cache_dir.clone(),
        spec_path,
        store,
        _tmp: tmp,
    }
}

async fn load(path: &Path) -> LoadedSpec {
    load_spec(
        &SpecSource::from_arg(path.to_str().unwrap()),
        &IndexingConfig::default(),
    )
    .await
    .unwrap()
}

async fn build(
    env: &Env,
    spec: &LoadedSpec,
    chat: Option<Arc<dyn ChatModel>>,
    kinds: Vec<ViewKind>,
) -> BuildReport {
    let cache = FileViewCache::open(&env.cache_dir, &spec.fingerprint, spec.title.as_deref())
        .await
        .unwrap();
    let generator = ViewGenerator::new(chat, Arc::new(cache), kinds, Duration::from_secs(5));
    let index = VectorIndex::new(env.store.clone(), Arc::new(BagOfWords));
    build_index(spec, &generator, &index, 2, &NoProgress, &CancelFlag::new())
        .await
        .unwrap()
}

fn all_kinds() -> Vec<ViewKind> {
    vec![ViewKind::Summary, ViewKind::Question, ViewKind::Example]
}

fn engine(env: &Env, chat: Arc<dyn ChatModel>) -> RetrievalEngine {
    RetrievalEngine::new(
        env.store.clone(),
        Arc::new(BagOfWords),
        chat,
        RetrievalConfig {
            top_k: 20,
            min_score: 0.05,
            max_context_operations: 10,
            history_turns: 6,
        },
    )
}

fn collections(spec: &LoadedSpec) -> Collections {
    Collections {
        spec: spec.collection_name(),
        aux: spec.aux_collection_name(),
    }
}

// ============ Loading ============

#[tokio::test]
async fn test_cyclic_spec_loads_with_named_stub() {
    let env = env().await;
    let spec = load(&env.spec_path).await;

    assert!(!spec.warnings.is_empty());
    assert!(spec.warnings.iter().all(|w| w.is_cycle()));
    let text = serde_json::to_string(&spec.canonical).unwrap();
    assert!(!text.contains("\"$ref\""));
    assert!(text.contains("x-askapi-cycle"));
}

#[tokio::test]
async fn test_fingerprint_ignores_format_and_key_order() {
    let env = env().await;
    let yaml = load(&env.spec_path).await;

    let value: serde_json::Value = serde_yaml::from_str(PETSTORE).unwrap();
    let json_path = env.spec_path.with_extension("json");
    std::fs::write(&json_path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    let json = load(&json_path).await;

    assert_eq!(yaml.fingerprint, json.fingerprint);
    assert_eq!(yaml.collection_name(), json.collection_name());
}

// ============ Building ============

#[tokio::test]
async fn test_build_then_resume_embeds_nothing_new() {
    let env = env().await;
    let spec = load(&env.spec_path).await;
    let chat = EchoChat::new();

    let first = build(&env, &spec, Some(chat.clone()), all_kinds()).await;
    assert!(first.complete);
    assert!(!first.resumed);
    assert_eq!(first.records_indexed, first.records);
    assert!(first.vectors_embedded > 0);
    assert_eq!(first.failed_views, 0);

    let calls = chat.calls();
    let second = build(&env, &spec, Some(chat.clone()), all_kinds()).await;
    assert!(second.complete);
    assert!(second.resumed);
    assert_eq!(second.vectors_embedded, 0);
    assert_eq!(second.vectors_skipped, first.vectors_embedded);
    assert_eq!(second.llm_calls, 0);
    assert_eq!(chat.calls(), calls);

    let info = env
        .store
        .collection(&spec.collection_name())
        .await
        .unwrap()
        .unwrap();
    assert!(info.complete);
    assert_eq!(info.record_count, first.records);
    assert_eq!(info.vector_count, first.vectors_embedded);
}

#[tokio::test]
async fn test_view_cache_survives_dropped_collection() {
    let env = env().await;
    let spec = load(&env.spec_path).await;
    let chat = EchoChat::new();

    let first = build(&env, &spec, Some(chat.clone()), all_kinds()).await;
    assert!(first.llm_calls > 0);
    assert!(env
        .store
        .drop_collection(&spec.collection_name())
        .await
        .unwrap());

    let calls = chat.calls();
    let rebuilt = build(&env, &spec, Some(chat.clone()), all_kinds()).await;
    assert!(!rebuilt.resumed);
    assert_eq!(rebuilt.llm_calls, 0);
    assert_eq!(rebuilt.cache_hits, first.views);
    assert_eq!(rebuilt.vectors_embedded, first.vectors_embedded);
    assert_eq!(chat.calls(), calls);
}

#[tokio::test]
async fn test_failing_provider_falls_back_to_metadata_views() {
    let env = env().await;
    let spec = load(&env.spec_path).await;

    let report = build(
        &env,
        &spec,
        Some(Arc::new(FailingChat)),
        vec![ViewKind::Summary, ViewKind::Question],
    )
    .await;

    assert!(report.complete);
    assert_eq!(report.fallback_views, report.records);
    assert_eq!(report.failed_views, report.records * 2);
    assert_eq!(report.vectors_embedded, report.records);
}

#[tokio::test]
async fn test_metadata_view_replaced_once_provider_recovers() {
    let env = env().await;
    let spec = load(&env.spec_path).await;
    let kinds = vec![ViewKind::Summary];

    let degraded = build(&env, &spec, Some(Arc::new(FailingChat)), kinds.clone()).await;
    assert_eq!(degraded.fallback_views, degraded.records);

    let recovered = build(&env, &spec, Some(EchoChat::new()), kinds).await;
    assert!(recovered.resumed);
    assert_eq!(recovered.fallback_views, 0);
    assert_eq!(recovered.vectors_embedded, recovered.records);
    assert_eq!(recovered.vectors_removed, recovered.records);

    let count = env
        .store
        .vector_count(&spec.collection_name())
        .await
        .unwrap();
    assert_eq!(count, recovered.records);
}

#[tokio::test]
async fn test_cancelled_build_is_incomplete_and_resumable() {
    let env = env().await;
    let spec = load(&env.spec_path).await;
    let cache = FileViewCache::open(&env.cache_dir, &spec.fingerprint, None)
        .await
        .unwrap();
    let generator = ViewGenerator::new(
        Some(EchoChat::new()),
        Arc::new(cache),
        all_kinds(),
        Duration::from_secs(5),
    );
    let index = VectorIndex::new(env.store.clone(), Arc::new(BagOfWords));
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = build_index(&spec, &generator, &index, 2, &NoProgress, &cancel)
        .await
        .unwrap();
    assert!(!report.complete);
    assert_eq!(report.records_indexed, 0);
    let info = env
        .store
        .collection(&spec.collection_name())
        .await
        .unwrap()
        .unwrap();
    assert!(!info.complete);

    let resumed = build(&env, &spec, Some(EchoChat::new()), all_kinds()).await;
    assert!(resumed.complete);
}

// ============ Answering ============

#[tokio::test]
async fn test_answer_cites_owning_operation() {
    let env = env().await;
    let spec = load(&env.spec_path).await;
    build(&env, &spec, Some(EchoChat::new()), all_kinds()).await;

    let answer = engine(&env, EchoChat::new())
        .answer(&collections(&spec), "delete pets petId", &[])
        .await
        .unwrap();

    assert!(answer.index_complete);
    assert!(answer.answer.contains("DELETE /pets/{petId}"));
    assert!(!answer.sources.is_empty());
    let ids: Vec<&str> = answer.sources.iter().map(|s| s.record_id.as_str()).collect();
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), ids.len(), "sources repeat an owner: {:?}", ids);
    assert!(ids.iter().all(|id| !id.contains("/param/") && !id.contains("/response/")));
}

#[tokio::test]
async fn test_unrelated_question_has_no_context() {
    let env = env().await;
    let spec = load(&env.spec_path).await;
    build(&env, &spec, Some(EchoChat::new()), all_kinds()).await;

    let chat = EchoChat::new();
    let err = engine(&env, chat.clone())
        .answer(&collections(&spec), "???", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AnswerError::NoRelevantContext { .. }));
    assert_eq!(chat.calls(), 0);
}

#[tokio::test]
async fn test_missing_index_is_reported() {
    let env = env().await;
    let spec = load(&env.spec_path).await;

    let err = engine(&env, EchoChat::new())
        .answer(&collections(&spec), "list pets", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AnswerError::IndexMissing { .. }));
}

#[tokio::test]
async fn test_auxiliary_document_is_retrieved() {
    let env = env().await;
    let spec = load(&env.spec_path).await;
    build(&env, &spec, Some(EchoChat::new()), all_kinds()).await;

    let index = VectorIndex::new(env.store.clone(), Arc::new(BagOfWords));
    let doc = "Rate limiting: clients may send 100 requests per minute. \
               Exceeding the quota returns HTTP 429 with a Retry-After header.";
    let first = index
        .add_auxiliary(&spec, "limits.md", doc, 10_000)
        .await
        .unwrap();
    assert!(first.chunks_indexed > 0);
    let again = index
        .add_auxiliary(&spec, "limits.md", doc, 10_000)
        .await
        .unwrap();
    assert_eq!(again.chunks_indexed, 0);
    assert_eq!(again.chunks_skipped, first.chunks_indexed);

    let answer = engine(&env, EchoChat::new())
        .answer(&collections(&spec), "quota Retry-After minute", &[])
        .await
        .unwrap();
    assert!(answer
        .sources
        .iter()
        .any(|s| s.collection == spec.aux_collection_name()));
    assert!(answer.answer.contains("Retry-After"));
}
