//! # docrag
//!
//! Document ingestion and cited retrieval over a local vector index.
//!
//! Raw document bytes (plain text, PDF, DOCX, CSV, images) are extracted to
//! text, normalized, cut into overlapping offset-tracked chunks, embedded,
//! and stored in a SQLite-backed vector index. A query is embedded, matched
//! against the index, deduplicated, and assembled into a bounded context
//! with per-chunk citations.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────────┐   ┌──────────┐   ┌──────────────┐
//! │ Extractor │──▶│ Normalize + │──▶│ Embedder │──▶│ Vector Index │
//! │ (+ OCR)   │   │   Chunker   │   │          │   │   (SQLite)   │
//! └───────────┘   └─────────────┘   └──────────┘   └──────┬───────┘
//!                                                         │
//!                        query ──▶ Embedder ──▶ search ───┤
//!                                                         ▼
//!                                               ┌──────────────────┐
//!                                               │ Context Assembler│
//!                                               └──────────────────┘
//! ```
//!
//! Runtime-agnostic pieces (models, chunking, the embedding and index
//! traits, context assembly) live in the `docrag-core` crate. This crate
//! adds configuration, storage, extraction, providers and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`extract`] | Text extraction for every supported media type |
//! | [`ocr`] | `tesseract` / `pdftoppm` wrappers |
//! | [`embedding`] | Embedding providers (hash, local, OpenAI, Ollama) |
//! | [`sqlite_store`] | SQLite vector index and document status store |
//! | [`pipeline`] | [`RagContext`](pipeline::RagContext): ingest, delete, query |
//! | [`ingest`] | `docrag ingest` file scanning |
//! | [`query`] | `docrag query` output |
//! | [`get`] | `docrag get`, `list`, `delete` |
//! | [`stats`] | `docrag stats`, `clear` |

pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod ocr;
pub mod pipeline;
pub mod query;
pub mod sqlite_store;
pub mod stats;
