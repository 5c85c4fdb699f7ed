//! # docrag core
//!
//! Runtime-agnostic logic for docrag: data models, the error taxonomy,
//! text normalization and chunking, the embedding trait, the vector index
//! and status store traits, and context assembly.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! runtime-specific dependencies.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod retrieve;
pub mod store;

pub use error::{ErrorKind, RagError, Result};
