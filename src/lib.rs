//! # askapi
//!
//! Turn an OpenAPI/Swagger document into a question-answering index.
//!
//! askapi loads a spec (local or remote, JSON or YAML), inlines every
//! `$ref`, fingerprints the result, splits it into operation, parameter,
//! request-body, response and schema records, generates LLM "views" of each
//! record, and embeds those views into a SQLite vector index that a later
//! run can resume. Questions are answered by retrieving the most relevant
//! views, mapping them back to their operations, and asking a chat model
//! to answer from that context.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │ SpecLoader │──▶│ build_records│──▶│ ViewGenerator│──▶│  SQLite  │
//! │ $ref + fp  │   │  (core)      │   │ LLM + cache  │   │  vectors │
//! └────────────┘   └──────────────┘   └──────────────┘   └────┬─────┘
//!                                                             │
//!                                    ┌────────────────────────┤
//!                                    ▼                        ▼
//!                              ┌──────────┐            ┌──────────┐
//!                              │   CLI    │            │   HTTP   │
//!                              │ (askapi) │            │  (axum)  │
//!                              └──────────┘            └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`loader`] | Spec loading, `$ref` resolution, fingerprinting |
//! | [`llm`] | OpenAI/Ollama chat providers with fallback |
//! | [`embedding`] | OpenAI/Ollama/local embedding providers |
//! | [`cache`] | On-disk view cache keyed by fingerprint |
//! | [`views`] | Per-record view generation |
//! | [`index`] | Resumable vector index over a [`VectorStore`](askapi_core::store::VectorStore) |
//! | [`pipeline`] | The cancellable build loop |
//! | [`progress`] | Build progress reporting |
//! | [`rag`] | Retrieval and answering |
//! | [`server`] | HTTP API |
//! | [`sqlite_store`] | SQLite vector store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`commands`] | CLI command implementations |

pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod index;
pub mod llm;
pub mod loader;
pub mod migrate;
pub mod pipeline;
pub mod progress;
pub mod rag;
pub mod server;
pub mod sqlite_store;
pub mod views;
