//! In-memory [`VectorIndex`] and [`DocumentStatusStore`] implementations.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity over all stored vectors. A single write
//! lock covers each upsert, so readers see a document either entirely
//! before or entirely after it.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::cosine_similarity;
use crate::error::{RagError, Result};
use crate::models::{Document, IndexEntry, MetadataFilter, ScoredEntry};

use super::{
    check_transition, validate_entries, validate_query, DocumentStatusStore, StatusCounts,
    StatusUpdate, VectorIndex,
};

struct StoredEntry {
    seq: u64,
    entry: IndexEntry,
}

#[derive(Default)]
struct IndexState {
    next_seq: u64,
    entries: Vec<StoredEntry>,
}

/// In-memory vector index for tests and ephemeral use.
pub struct InMemoryIndex {
    dims: usize,
    model: String,
    state: RwLock<IndexState>,
}

impl InMemoryIndex {
    pub fn new(dims: usize, model: &str) -> Self {
        Self {
            dims,
            model: model.to_string(),
            state: RwLock::new(IndexState::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexState>> {
        self.state
            .read()
            .map_err(|_| RagError::IndexUnavailable("index lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexState>> {
        self.state
            .write()
            .map_err(|_| RagError::IndexUnavailable("index lock poisoned".into()))
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn upsert(&self, document_id: &str, entries: Vec<IndexEntry>) -> Result<usize> {
        validate_entries(self.dims, document_id, &entries)?;

        let mut state = self.write()?;
        state.entries.retain(|s| s.entry.document_id != document_id);
        let n = entries.len();
        for entry in entries {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push(StoredEntry { seq, entry });
        }
        Ok(n)
    }

    async fn delete(&self, document_id: &str) -> Result<usize> {
        let mut state = self.write()?;
        let before = state.entries.len();
        state.entries.retain(|s| s.entry.document_id != document_id);
        Ok(before - state.entries.len())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredEntry>> {
        validate_query(self.dims, query)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let state = self.read()?;
        let mut scored: Vec<(f32, u64, &IndexEntry)> = state
            .entries
            .iter()
            .filter(|s| filter.map_or(true, |f| f.matches(&s.entry.metadata)))
            .map(|s| (cosine_similarity(query, &s.entry.vector), s.seq, &s.entry))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, _, entry)| ScoredEntry {
                entry: entry.clone(),
                score,
            })
            .collect())
    }

    async fn document_entries(&self, document_id: &str) -> Result<Vec<IndexEntry>> {
        let state = self.read()?;
        let mut entries: Vec<IndexEntry> = state
            .entries
            .iter()
            .filter(|s| s.entry.document_id == document_id)
            .map(|s| s.entry.clone())
            .collect();
        entries.sort_by_key(|e| e.chunk_index);
        Ok(entries)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.entries.len())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.write()?;
        state.entries.clear();
        state.next_seq = 0;
        Ok(())
    }
}

/// In-memory document status store.
#[derive(Default)]
pub struct InMemoryStatusStore {
    docs: RwLock<HashMap<String, Document>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Document>>> {
        self.docs
            .read()
            .map_err(|_| RagError::IndexUnavailable("status store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Document>>> {
        self.docs
            .write()
            .map_err(|_| RagError::IndexUnavailable("status store lock poisoned".into()))
    }
}

#[async_trait]
impl DocumentStatusStore for InMemoryStatusStore {
    async fn register(&self, doc: &Document) -> Result<()> {
        self.write()?.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn set_status(&self, id: &str, update: StatusUpdate) -> Result<()> {
        let mut docs = self.write()?;
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| RagError::Validation(format!("unknown document: {}", id)))?;
        check_transition(id, doc.status, update.status)?;

        doc.status = update.status;
        doc.updated_at = Utc::now();
        if let Some((kind, message)) = update.error {
            doc.error_kind = Some(kind);
            doc.error_message = Some(message);
        }
        if update.chunk_count.is_some() {
            doc.chunk_count = update.chunk_count;
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Document>> {
        let docs = self.read()?;
        let mut all: Vec<&Document> = docs.values().collect();
        all.sort_by(|a, b| b.ingested_at.cmp(&a.ingested_at).then(a.id.cmp(&b.id)));
        Ok(all.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.write()?.remove(id).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for doc in self.read()?.values() {
            counts.add(doc.status, 1);
        }
        Ok(counts)
    }
}
