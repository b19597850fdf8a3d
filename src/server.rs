//! HTTP query interface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/status` | Spec fingerprint, collections, vector counts, build state |
//! | `POST` | `/ask` | `{question, history?}` → `{answer, sources, index_complete}` |
//! | `POST` | `/documents` | `{text, source?}` → `{chunks_indexed, chunks_skipped}` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no indexed content is relevant to: ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `index_missing` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser chat UIs can
//! call the API directly.

use std::sync::Arc;

use askapi_core::error::AnswerError;
use askapi_core::llm::ChatMessage;
use askapi_core::store::CollectionInfo;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::index::{AuxReport, VectorIndex};
use crate::loader::LoadedSpec;
use crate::rag::{Answer, Collections, RetrievalEngine};

/// Shared state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub spec: Arc<LoadedSpec>,
    pub engine: Arc<RetrievalEngine>,
    pub index: VectorIndex,
    pub max_document_chars: usize,
}

impl AppState {
    fn collections(&self) -> Collections {
        Collections {
            spec: self.spec.collection_name(),
            aux: self.spec.aux_collection_name(),
        }
    }
}

/// Build the router. Split from [`run_server`] so tests can bind it on an
/// ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/ask", post(handle_ask))
        .route("/documents", post(handle_documents))
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn run_server<F>(state: AppState, bind_addr: &str, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "askapi listening");
    eprintln!("askapi listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    let message = message.into();
    error!(error = %message, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message,
    }
}

impl From<AnswerError> for AppError {
    fn from(err: AnswerError) -> Self {
        match &err {
            AnswerError::NoRelevantContext { .. } => AppError {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message: err.to_string(),
            },
            AnswerError::IndexMissing { .. } => AppError {
                status: StatusCode::CONFLICT,
                code: "index_missing",
                message: err.to_string(),
            },
            AnswerError::Provider(_) => internal(err.to_string()),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /status ============

#[derive(Serialize)]
struct StatusResponse {
    api: String,
    title: Option<String>,
    fingerprint: String,
    index_complete: bool,
    collections: Vec<CollectionInfo>,
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let names = state.collections();
    let store = state.index.store();
    let mut collections = Vec::new();
    for name in [&names.spec, &names.aux] {
        if let Some(info) = store
            .collection(name)
            .await
            .map_err(|e| internal(format!("{:#}", e)))?
        {
            collections.push(info);
        }
    }
    let index_complete = collections
        .iter()
        .find(|c| c.name == names.spec)
        .map(|c| c.complete)
        .unwrap_or(false);

    Ok(Json(StatusResponse {
        api: state.spec.api_name.clone(),
        title: state.spec.title.clone(),
        fingerprint: state.spec.fingerprint.to_string(),
        index_complete,
        collections,
    }))
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<Answer>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let answer = state
        .engine
        .answer(&state.collections(), &req.question, &req.history)
        .await?;
    Ok(Json(answer))
}

// ============ POST /documents ============

#[derive(Deserialize)]
struct DocumentRequest {
    text: String,
    #[serde(default)]
    source: Option<String>,
}

async fn handle_documents(
    State(state): State<AppState>,
    Json(req): Json<DocumentRequest>,
) -> Result<Json<AuxReport>, AppError> {
    if req.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    let source = req.source.unwrap_or_else(|| "pasted".to_string());
    let report = state
        .index
        .add_auxiliary(&state.spec, &source, &req.text, state.max_document_chars)
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(report))
}
