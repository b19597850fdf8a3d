//! Error taxonomy for the spec-to-index pipeline.
//!
//! Each failure class has its own type so callers can decide what is fatal:
//!
//! | Type | Raised by | Policy |
//! |------|-----------|--------|
//! | [`ParseError`] | loader | fatal, nothing is built |
//! | [`RefResolutionError`] | resolver | cycles and unreachable refs are recorded as warnings |
//! | [`ViewGenerationError`] | view generator | absorbed, the record keeps its other views |
//! | [`IndexWriteError`] | vector index | fatal for the current build, resumable |
//! | [`AnswerError`] | retrieval engine | surfaced to the caller as "not found" |

use std::fmt;

use thiserror::Error;

use crate::model::ViewKind;

/// The input document could not be turned into a tree.
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON or YAML syntax error.
    #[error("malformed {format} in {origin}: {message}")]
    Syntax {
        origin: String,
        format: &'static str,
        message: String,
    },
    /// Well-formed, but not an OpenAPI / Swagger document.
    #[error("{origin} is not an OpenAPI or Swagger document: {reason}")]
    NotOpenApi { origin: String, reason: String },
}

/// Why a `$ref` could not be substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefFailure {
    /// The pointer does not exist in the target document.
    NotFound,
    /// The reference closes a cycle; a named marker was substituted.
    Cycle,
    /// The external document could not be read or fetched.
    Fetch(String),
    /// The external server answered with an error status.
    Status(u16),
    /// The external fetch exceeded its deadline.
    Timeout,
    /// The external document was fetched but is not valid JSON/YAML.
    Unparsable(String),
}

impl fmt::Display for RefFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefFailure::NotFound => write!(f, "target not found"),
            RefFailure::Cycle => write!(f, "reference cycle"),
            RefFailure::Fetch(msg) => write!(f, "fetch failed: {}", msg),
            RefFailure::Status(code) => write!(f, "HTTP status {}", code),
            RefFailure::Timeout => write!(f, "fetch timed out"),
            RefFailure::Unparsable(msg) => write!(f, "unparsable document: {}", msg),
        }
    }
}

/// A `$ref` whose target could not be inlined.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot resolve `{reference}` (from {base}): {reason}")]
pub struct RefResolutionError {
    /// The reference as written in the document.
    pub reference: String,
    /// Identity of the document that contains the reference.
    pub base: String,
    pub reason: RefFailure,
}

impl RefResolutionError {
    /// True when the reference was a cycle that got a placeholder.
    pub fn is_cycle(&self) -> bool {
        self.reason == RefFailure::Cycle
    }
}

/// A provider call for one view of one record failed.
#[derive(Debug, Clone, Error)]
#[error("{kind} view for record {record_id} failed: {message}")]
pub struct ViewGenerationError {
    pub record_id: String,
    pub kind: ViewKind,
    pub message: String,
}

/// The vector store rejected a write or is unreachable.
#[derive(Debug, Clone, Error)]
#[error("vector store write failed for collection {collection}: {message}")]
pub struct IndexWriteError {
    pub collection: String,
    pub message: String,
}

impl IndexWriteError {
    pub fn new(collection: &str, err: impl fmt::Display) -> Self {
        Self {
            collection: collection.to_string(),
            message: err.to_string(),
        }
    }
}

/// A question could not be answered from the index.
#[derive(Debug, Error)]
pub enum AnswerError {
    /// Nothing scored above the similarity threshold.
    #[error("no indexed content is relevant to: {question}")]
    NoRelevantContext { question: String },
    /// The spec has never been indexed.
    #[error("collection {collection} does not exist; run `askapi index` first")]
    IndexMissing { collection: String },
    /// Embedding the question or synthesizing the answer failed.
    #[error("provider failure while answering: {0}")]
    Provider(String),
}
