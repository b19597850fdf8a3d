//! # askapi core
//!
//! I/O-free pieces of the spec-to-index pipeline: `$ref` resolution over
//! loaded documents, the content fingerprint, the typed record model and
//! document builder, deterministic example synthesis, prompt construction,
//! and the cache, store and provider traits the app crate implements.
//!
//! This crate contains no tokio, sqlx, network or filesystem access.

pub mod builder;
pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod example;
pub mod fingerprint;
pub mod llm;
pub mod model;
pub mod prompt;
pub mod resolve;
pub mod store;
