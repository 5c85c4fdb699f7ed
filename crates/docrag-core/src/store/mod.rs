//! Storage abstractions for docrag.
//!
//! Two traits sit at the storage seam:
//!
//! - [`VectorIndex`]: (chunk, vector, text, metadata) entries keyed by
//!   document id, with brute-force or accelerated nearest-neighbour search.
//! - [`DocumentStatusStore`]: the narrow write path for document status
//!   transitions; the metadata store behind it is owned by the host.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! In-memory implementations live in [`memory`]; the SQLite-backed ones live
//! in the `docrag` app crate.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{ErrorKind, RagError, Result};
use crate::models::{Document, DocumentStatus, IndexEntry, MetadataFilter, ScoredEntry};

/// Abstract vector index.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Atomically replace all entries of a document |
/// | [`delete`](VectorIndex::delete) | Remove all entries of a document (idempotent) |
/// | [`search`](VectorIndex::search) | Top-k cosine search with optional metadata filter |
/// | [`document_entries`](VectorIndex::document_entries) | Entries of one document, by chunk index |
/// | [`count`](VectorIndex::count) | Total number of entries |
/// | [`clear`](VectorIndex::clear) | Drop every entry and reset provenance |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Dimensionality every stored vector must have.
    fn dims(&self) -> usize;

    /// Embedding model the index was built with.
    fn model(&self) -> &str;

    /// Replace every entry of `document_id` with `entries`, all or nothing.
    ///
    /// Fails with [`RagError::DimensionMismatch`] if any vector has the wrong
    /// length, in which case nothing changes. Returns the number of entries
    /// written.
    async fn upsert(&self, document_id: &str, entries: Vec<IndexEntry>) -> Result<usize>;

    /// Remove every entry of `document_id`. Returns how many were removed;
    /// deleting an unknown document returns `0`.
    async fn delete(&self, document_id: &str) -> Result<usize>;

    /// Top `top_k` entries by cosine similarity to `query`, descending; ties
    /// keep insertion order.
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredEntry>>;

    /// All entries of one document, ordered by chunk index.
    async fn document_entries(&self, document_id: &str) -> Result<Vec<IndexEntry>>;

    async fn count(&self) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}

/// Check a batch before it touches an index of `dims` dimensions.
pub fn validate_entries(dims: usize, document_id: &str, entries: &[IndexEntry]) -> Result<()> {
    for e in entries {
        if e.vector.len() != dims {
            return Err(RagError::DimensionMismatch {
                expected: dims,
                actual: e.vector.len(),
            });
        }
        if e.document_id != document_id {
            return Err(RagError::Validation(format!(
                "entry {} belongs to document {}, not {}",
                e.chunk_id, e.document_id, document_id
            )));
        }
    }
    Ok(())
}

/// Check a query vector against an index of `dims` dimensions.
pub fn validate_query(dims: usize, query: &[f32]) -> Result<()> {
    if query.len() != dims {
        return Err(RagError::DimensionMismatch {
            expected: dims,
            actual: query.len(),
        });
    }
    Ok(())
}

/// One status change for a document.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: DocumentStatus,
    pub error: Option<(ErrorKind, String)>,
    pub chunk_count: Option<usize>,
}

impl StatusUpdate {
    pub fn to(status: DocumentStatus) -> Self {
        Self {
            status,
            error: None,
            chunk_count: None,
        }
    }

    pub fn failed(err: &RagError) -> Self {
        Self {
            status: DocumentStatus::Failed,
            error: Some((err.kind(), err.to_string())),
            chunk_count: None,
        }
    }

    pub fn with_chunk_count(mut self, n: usize) -> Self {
        self.chunk_count = Some(n);
        self
    }
}

/// Number of documents in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub extracted: usize,
    pub chunked: usize,
    pub indexed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: DocumentStatus, n: usize) {
        match status {
            DocumentStatus::Pending => self.pending += n,
            DocumentStatus::Extracted => self.extracted += n,
            DocumentStatus::Chunked => self.chunked += n,
            DocumentStatus::Indexed => self.indexed += n,
            DocumentStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.extracted + self.chunked + self.indexed + self.failed
    }
}

/// Narrow write path into the host's document metadata store.
#[async_trait]
pub trait DocumentStatusStore: Send + Sync {
    /// Insert `doc`, or reset an existing record with the same id (re-upload).
    async fn register(&self, doc: &Document) -> Result<()>;

    /// Apply a forward status transition. Unknown ids and backward moves are
    /// [`RagError::Validation`] errors.
    async fn set_status(&self, id: &str, update: StatusUpdate) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Document>>;

    /// Documents ordered newest first, then by id.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Document>>;

    /// Remove a record; `false` if it did not exist.
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    async fn counts(&self) -> Result<StatusCounts>;
}

/// Shared transition check for status store implementations.
pub fn check_transition(id: &str, from: DocumentStatus, to: DocumentStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(RagError::Validation(format!(
            "document {}: illegal status transition {} -> {}",
            id, from, to
        )))
    }
}
