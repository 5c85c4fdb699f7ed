//! Ingestion and query orchestration.
//!
//! [`RagContext`] holds everything an operation needs: configuration, the
//! extractor, the embedding provider, the vector index and the document
//! status store. There is no global state; open a context, pass it around,
//! close it when done.
//!
//! # Write path
//!
//! ```text
//! bytes ──► extract ──► normalize ──► chunk ──► embed ──► index upsert
//!  pending    extracted            chunked              indexed
//! ```
//!
//! Stages of one document run in order. Different documents run in
//! parallel, bounded by `ingest.document_concurrency`; extraction and
//! embedding additionally sit behind their own semaphores. Writes to the
//! same document id are serialized by a per-document lock.
//!
//! Document-scoped failures (bad bytes, empty text, embedding rejects,
//! timeouts, cancellation) mark the document `failed` and come back as an
//! [`IngestOutcome`]. Index-scoped failures (`IndexUnavailable`,
//! `DimensionMismatch`) also mark the document but are returned as `Err`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docrag_core::chunk::{chunk_text, normalize_text};
use docrag_core::embedding::{embed_query, embed_texts, EmbeddingProvider};
use docrag_core::models::{
    Document, DocumentStatus, IndexEntry, MediaType, Metadata, MetadataFilter,
};
use docrag_core::retrieve::{retrieve_by_vector, RetrievedContext};
use docrag_core::store::{DocumentStatusStore, StatusCounts, StatusUpdate, VectorIndex};
use docrag_core::{ErrorKind, RagError, Result};

use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::extract::Extractor;
use crate::migrate;
use crate::ocr::OcrEngine;
use crate::sqlite_store::{SqliteIndex, SqliteStatusStore};

/// One document handed in by an upload handler.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Caller-assigned, stable document id.
    pub id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Declared media type: a MIME type (optionally with `; charset=`) or a
    /// short name such as `pdf`.
    pub media_type: String,
    pub tags: Metadata,
    pub cancel: Option<CancellationToken>,
}

impl UploadRequest {
    pub fn new(id: &str, filename: &str, bytes: Vec<u8>, media_type: &str) -> Self {
        Self {
            id: id.to_string(),
            filename: filename.to_string(),
            bytes,
            media_type: media_type.to_string(),
            tags: Metadata::new(),
            cancel: None,
        }
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Final state of one ingested document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub document_id: String,
    pub status: DocumentStatus,
    pub chunk_count: usize,
    /// The chunk cap cut the document short.
    pub truncated: bool,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

impl IngestOutcome {
    fn indexed(document_id: &str, chunk_count: usize, truncated: bool) -> Self {
        Self {
            document_id: document_id.to_string(),
            status: DocumentStatus::Indexed,
            chunk_count,
            truncated,
            error_kind: None,
            error: None,
        }
    }

    fn failed(document_id: &str, err: &RagError) -> Self {
        Self {
            document_id: document_id.to_string(),
            status: DocumentStatus::Failed,
            chunk_count: 0,
            truncated: false,
            error_kind: Some(err.kind()),
            error: Some(err.to_string()),
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.status == DocumentStatus::Indexed
    }
}

/// Per-query overrides of the `[retrieval]` defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub max_context_chars: Option<usize>,
    pub filter: Option<MetadataFilter>,
}

/// Result of deleting a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub entries_removed: usize,
    pub record_removed: bool,
}

/// A document record together with its indexed chunks.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentDetail {
    pub document: Document,
    pub entries: Vec<IndexEntry>,
}

/// Snapshot of index and document counts.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub documents: StatusCounts,
    pub entries: usize,
    pub dims: usize,
    pub model: String,
    pub provider: String,
}

/// Explicit context for every pipeline operation.
pub struct RagContext {
    config: Config,
    pool: Option<SqlitePool>,
    extractor: Extractor,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    status: Arc<dyn DocumentStatusStore>,
    embed_permits: Semaphore,
    doc_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RagContext {
    /// Open the configured database (creating the schema if needed), build
    /// the embedding provider, and open the index.
    ///
    /// With the provider disabled the index is opened with whatever
    /// provenance it already has, which is enough for list, get, delete,
    /// stats and clear.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;

        let embedder = create_provider(&config.embedding)?;
        let index = if config.embedding.is_enabled() {
            SqliteIndex::open(pool.clone(), embedder.dims(), embedder.model_name()).await?
        } else {
            SqliteIndex::open_existing(pool.clone()).await?
        };
        let status = SqliteStatusStore::new(pool.clone());

        let mut ctx = Self::from_parts(config, Arc::new(index), embedder, Arc::new(status));
        ctx.pool = Some(pool);
        Ok(ctx)
    }

    /// Assemble a context from already-built parts (e.g. in-memory stores).
    pub fn from_parts(
        config: Config,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        status: Arc<dyn DocumentStatusStore>,
    ) -> Self {
        let extractor = Extractor::new(
            OcrEngine::new(config.ocr.clone()),
            config.ingest.extract_concurrency,
        );
        Self {
            embed_permits: Semaphore::new(config.ingest.embed_concurrency.max(1)),
            config,
            pool: None,
            extractor,
            index,
            embedder,
            status,
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Release the database pool, if this context owns one.
    pub async fn close(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    pub fn status_store(&self) -> &dyn DocumentStatusStore {
        self.status.as_ref()
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Run one document through extract → chunk → embed → index.
    pub async fn ingest_document(&self, req: UploadRequest) -> Result<IngestOutcome> {
        if req.id.trim().is_empty() {
            return Err(RagError::Validation("document id must not be empty".into()));
        }

        // An unknown type cannot be represented in the document record.
        let media_type = match req.media_type.parse::<MediaType>() {
            Ok(m) => m,
            Err(e) => {
                warn!(document_id = %req.id, media_type = %req.media_type, "unsupported media type");
                return Ok(IngestOutcome::failed(&req.id, &e));
            }
        };

        let id = req.id.clone();
        self.with_document_lock(&id, self.ingest_locked(req, media_type))
            .await
    }

    async fn ingest_locked(&self, req: UploadRequest, media_type: MediaType) -> Result<IngestOutcome> {
        let doc = Document::pending(
            &req.id,
            &req.filename,
            media_type,
            req.bytes.len() as u64,
            req.tags.clone(),
        );
        self.status.register(&doc).await?;

        match self.run_stages(&req, media_type).await {
            Ok(outcome) => {
                info!(
                    document_id = %req.id,
                    chunks = outcome.chunk_count,
                    truncated = outcome.truncated,
                    "document indexed"
                );
                Ok(outcome)
            }
            Err(err) => {
                // A failed document must not keep answering queries with a
                // previous version's chunks.
                let purged = self.index.delete(&req.id).await;
                self.status
                    .set_status(&req.id, StatusUpdate::failed(&err))
                    .await?;
                if err.is_index_scoped() {
                    if let Err(purge_err) = purged {
                        warn!(document_id = %req.id, error = %purge_err, "could not drop stale entries");
                    }
                    error!(document_id = %req.id, error = %err, "index error; aborting");
                    return Err(err);
                }
                let stale = purged?;
                if stale > 0 {
                    debug!(document_id = %req.id, entries = stale, "dropped stale entries");
                }
                info!(
                    document_id = %req.id,
                    kind = %err.kind(),
                    error = %err,
                    "document failed"
                );
                Ok(IngestOutcome::failed(&req.id, &err))
            }
        }
    }

    async fn run_stages(&self, req: &UploadRequest, media_type: MediaType) -> Result<IngestOutcome> {
        let cancel = req.cancel.as_ref();
        let ingest = &self.config.ingest;
        check_cancel(cancel)?;

        if req.bytes.len() as u64 > ingest.max_document_bytes {
            return Err(RagError::Validation(format!(
                "document is {} bytes, limit is {}",
                req.bytes.len(),
                ingest.max_document_bytes
            )));
        }

        // Extract
        let raw = {
            let slot = self
                .extractor
                .reserve()
                .await
                .map_err(|_| RagError::Cancelled)?;
            guarded(
                cancel,
                Duration::from_secs(ingest.extract_timeout_secs),
                RagError::Extraction,
                async {
                    self.extractor
                        .extract(&slot, &req.bytes, &req.media_type)
                        .await
                        .map_err(RagError::from)
                },
            )
            .await?
        };
        let text = normalize_text(&raw);
        if text.is_empty() {
            return Err(RagError::Extraction("no extractable text".into()));
        }
        debug!(document_id = %req.id, chars = text.chars().count(), "extracted");
        self.status
            .set_status(&req.id, StatusUpdate::to(DocumentStatus::Extracted))
            .await?;
        check_cancel(cancel)?;

        // Chunk
        let mut base = req.tags.clone();
        base.insert("filename".into(), req.filename.clone().into());
        base.insert("media_type".into(), media_type.as_str().into());
        let set = chunk_text(&req.id, &text, &self.config.chunking.params(), &base)?;
        let chunk_count = set.chunks.len();
        debug!(document_id = %req.id, chunks = chunk_count, "chunked");
        self.status
            .set_status(
                &req.id,
                StatusUpdate::to(DocumentStatus::Chunked).with_chunk_count(chunk_count),
            )
            .await?;
        check_cancel(cancel)?;

        // Embed
        let texts: Vec<String> = set.chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = {
            let _permit = self
                .embed_permits
                .acquire()
                .await
                .map_err(|_| RagError::Cancelled)?;
            guarded(
                cancel,
                Duration::from_secs(ingest.embed_timeout_secs),
                RagError::Embedding,
                embed_texts(
                    self.embedder.as_ref(),
                    &texts,
                    self.config.embedding.batch_size,
                ),
            )
            .await?
        };
        debug!(document_id = %req.id, vectors = vectors.len(), "embedded");
        check_cancel(cancel)?;

        // Index
        let entries: Vec<IndexEntry> = set
            .chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry::from_chunk(chunk, vector))
            .collect();
        self.index.upsert(&req.id, entries).await?;
        self.status
            .set_status(&req.id, StatusUpdate::to(DocumentStatus::Indexed))
            .await?;

        Ok(IngestOutcome::indexed(&req.id, chunk_count, set.truncated))
    }

    /// Ingest many documents, up to `ingest.document_concurrency` at a time.
    /// Outcomes come back in request order.
    ///
    /// The first index-scoped error cancels the documents still in flight
    /// and is returned.
    pub async fn ingest_batch(&self, requests: Vec<UploadRequest>) -> Result<Vec<IngestOutcome>> {
        let abort = CancellationToken::new();
        // Cancelled on return as well, which ends the forwarding tasks of
        // caller-supplied tokens.
        let _finished = abort.clone().drop_guard();
        let concurrency = self.config.ingest.document_concurrency.max(1);

        let results: Vec<Result<IngestOutcome>> = stream::iter(requests)
            .map(|mut req| {
                let abort = abort.clone();
                async move {
                    let token = match req.cancel.take() {
                        Some(own) => link_tokens(own, &abort),
                        None => abort.child_token(),
                    };
                    req.cancel = Some(token);
                    let result = self.ingest_document(req).await;
                    if result.is_err() {
                        abort.cancel();
                    }
                    result
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            outcomes.push(result?);
        }
        Ok(outcomes)
    }

    /// Remove a document's index entries and its record. Idempotent.
    pub async fn delete_document(&self, id: &str) -> Result<DeleteOutcome> {
        self.with_document_lock(id, async {
            let entries_removed = self.index.delete(id).await?;
            let record_removed = self.status.remove(id).await?;
            info!(document_id = id, entries_removed, record_removed, "document deleted");
            Ok(DeleteOutcome {
                entries_removed,
                record_removed,
            })
        })
        .await
    }

    // ── Read path ───────────────────────────────────────────────────────

    /// Embed `query`, search, and assemble a cited context. No match above
    /// the similarity floor gives an empty context, not an error.
    pub async fn query(&self, query: &str, opts: &QueryOptions) -> Result<RetrievedContext> {
        let mut params = self.config.retrieval.params();
        if let Some(k) = opts.top_k {
            params.top_k = k;
        }
        if let Some(chars) = opts.max_context_chars {
            params.max_context_chars = chars;
        }

        params.validate()?;

        let query_vec = guarded(
            None,
            Duration::from_secs(self.config.ingest.embed_timeout_secs),
            RagError::Embedding,
            embed_query(self.embedder.as_ref(), query),
        )
        .await?;
        retrieve_by_vector(self.index.as_ref(), &query_vec, &params, opts.filter.as_ref()).await
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<DocumentDetail>> {
        let Some(document) = self.status.get(id).await? else {
            return Ok(None);
        };
        let entries = self.index.document_entries(id).await?;
        Ok(Some(DocumentDetail { document, entries }))
    }

    pub async fn list_documents(&self, limit: usize, offset: usize) -> Result<Vec<Document>> {
        self.status.list(limit, offset).await
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        Ok(IndexStats {
            documents: self.status.counts().await?,
            entries: self.index.count().await?,
            dims: self.index.dims(),
            model: self.index.model().to_string(),
            provider: self.config.embedding.provider.clone(),
        })
    }

    /// Drop every index entry and document record.
    pub async fn clear(&self) -> Result<()> {
        self.index.clear().await?;
        self.status.clear().await?;
        warn!("index and document records cleared");
        Ok(())
    }

    // ── Per-document locking ────────────────────────────────────────────

    async fn with_document_lock<T, F>(&self, id: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let lock = self.document_lock(id)?;
        let result = {
            let _guard = lock.lock().await;
            fut.await
        };
        drop(lock);
        self.release_document_lock(id);
        result
    }

    fn document_lock(&self, id: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .doc_locks
            .lock()
            .map_err(|_| RagError::IndexUnavailable("document lock table poisoned".into()))?;
        Ok(locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    fn release_document_lock(&self, id: &str) {
        if let Ok(mut locks) = self.doc_locks.lock() {
            // Only the table still holds it: nobody is waiting.
            if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(id);
            }
        }
    }
}

fn check_cancel(token: Option<&CancellationToken>) -> Result<()> {
    match token {
        Some(t) if t.is_cancelled() => Err(RagError::Cancelled),
        _ => Ok(()),
    }
}

/// Run one stage under a timeout, abandoning it if `cancel` fires.
async fn guarded<T, F>(
    cancel: Option<&CancellationToken>,
    limit: Duration,
    on_timeout: fn(String) -> RagError,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let timed = tokio::time::timeout(limit, fut);
    let result = match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => return Err(RagError::Cancelled),
            r = timed => r,
        },
        None => timed.await,
    };
    result.map_err(|_| on_timeout(format!("timed out after {}s", limit.as_secs())))?
}

/// A token cancelled when either `own` or `abort` is.
fn link_tokens(own: CancellationToken, abort: &CancellationToken) -> CancellationToken {
    let linked = abort.child_token();
    if own.is_cancelled() {
        linked.cancel();
        return linked;
    }
    let forward = linked.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = own.cancelled() => forward.cancel(),
            _ = forward.cancelled() => {}
        }
    });
    linked
}

#[cfg(test)]
mod tests {
    use super::*;
    use docrag_core::embedding::HashProvider;
    use docrag_core::store::memory::{InMemoryIndex, InMemoryStatusStore};

    fn config() -> Config {
        let mut config: Config = toml::from_str(
            r#"
            [db]
            path = "unused.sqlite"

            [embedding]
            provider = "hash"
            dims = 64

            [chunking]
            chunk_size = 200
            overlap = 40

            [ocr]
            enabled = false
            "#,
        )
        .unwrap();
        config.retrieval.min_score = 0.1;
        config
    }

    fn context_with(index_dims: usize) -> RagContext {
        let embedder = Arc::new(HashProvider::new(64));
        let index = Arc::new(InMemoryIndex::new(index_dims, "hash-v1-64"));
        RagContext::from_parts(config(), index, embedder, Arc::new(InMemoryStatusStore::new()))
    }

    const FIRE_CODE: &str = "Stairwell doors must be self-closing and rated for ninety minutes. \
        Sprinkler heads are required in every corridor longer than twenty feet.";

    #[tokio::test]
    async fn text_document_is_indexed_and_found() {
        let ctx = context_with(64);
        let outcome = ctx
            .ingest_document(
                UploadRequest::new("fire", "fire.txt", FIRE_CODE.as_bytes().to_vec(), "text/plain")
                    .with_tag("project", "tower-b"),
            )
            .await
            .unwrap();
        assert!(outcome.is_indexed());
        assert_eq!(outcome.chunk_count, 1);

        let doc = ctx.status_store().get("fire").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        assert_eq!(doc.chunk_count, Some(1));

        let found = ctx.query(FIRE_CODE, &QueryOptions::default()).await.unwrap();
        assert_eq!(found.chunks[0].document_id, "fire");
        assert_eq!(found.chunks[0].metadata["project"], "tower-b");
        assert_eq!(found.chunks[0].metadata["media_type"], "text");
    }

    #[tokio::test]
    async fn unsupported_type_fails_without_record() {
        let ctx = context_with(64);
        let outcome = ctx
            .ingest_document(UploadRequest::new("x", "x.bin", vec![1, 2, 3], "application/zip"))
            .await
            .unwrap();
        assert_eq!(outcome.error_kind, Some(ErrorKind::UnsupportedMediaType));
        assert!(ctx.status_store().get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blank_text_is_an_extraction_failure() {
        let ctx = context_with(64);
        let outcome = ctx
            .ingest_document(UploadRequest::new("blank", "b.txt", b" \n\t ".to_vec(), "text"))
            .await
            .unwrap();
        assert_eq!(outcome.status, DocumentStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::ExtractionError));
        let doc = ctx.status_store().get("blank").await.unwrap().unwrap();
        assert_eq!(doc.error_kind, Some(ErrorKind::ExtractionError));
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let mut cfg = config();
        cfg.ingest.max_document_bytes = 10;
        let ctx = RagContext::from_parts(
            cfg,
            Arc::new(InMemoryIndex::new(64, "m")),
            Arc::new(HashProvider::new(64)),
            Arc::new(InMemoryStatusStore::new()),
        );
        let outcome = ctx
            .ingest_document(UploadRequest::new("big", "big.txt", vec![b'a'; 11], "text"))
            .await
            .unwrap();
        assert_eq!(outcome.error_kind, Some(ErrorKind::ValidationError));
    }

    #[tokio::test]
    async fn dimension_mismatch_aborts_and_marks_failed() {
        let ctx = context_with(768);
        let err = ctx
            .ingest_document(UploadRequest::new("d", "d.txt", FIRE_CODE.into(), "text"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RagError::DimensionMismatch {
                expected: 768,
                actual: 64
            }
        );
        assert_eq!(ctx.index().count().await.unwrap(), 0);
        let doc = ctx.status_store().get("d").await.unwrap().unwrap();
        assert_eq!(doc.error_kind, Some(ErrorKind::DimensionMismatch));
    }

    #[tokio::test]
    async fn cancelled_document_fails_with_cancelled() {
        let ctx = context_with(64);
        let token = CancellationToken::new();
        token.cancel();
        let outcome = ctx
            .ingest_document(
                UploadRequest::new("c", "c.txt", FIRE_CODE.into(), "text").with_cancel(token),
            )
            .await
            .unwrap();
        assert_eq!(outcome.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(ctx.index().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_keeps_going_past_document_failures() {
        let ctx = context_with(64);
        let outcomes = ctx
            .ingest_batch(vec![
                UploadRequest::new("a", "a.txt", FIRE_CODE.into(), "text"),
                UploadRequest::new("b", "b.pdf", b"not a pdf".to_vec(), "pdf"),
                UploadRequest::new("c", "c.csv", b"room,area\nlobby,120\n".to_vec(), "text/csv"),
            ])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_indexed());
        assert_eq!(outcomes[1].error_kind, Some(ErrorKind::ExtractionError));
        assert!(outcomes[2].is_indexed());

        let stats = ctx.stats().await.unwrap();
        assert_eq!(stats.documents.indexed, 2);
        assert_eq!(stats.documents.failed, 1);
    }

    #[tokio::test]
    async fn reingest_replaces_and_delete_is_idempotent() {
        let ctx = context_with(64);
        let long = FIRE_CODE.repeat(6);
        ctx.ingest_document(UploadRequest::new("r", "r.txt", long.into_bytes(), "text"))
            .await
            .unwrap();
        let before = ctx.index().document_entries("r").await.unwrap().len();
        assert!(before > 1);

        ctx.ingest_document(UploadRequest::new("r", "r.txt", FIRE_CODE.into(), "text"))
            .await
            .unwrap();
        assert_eq!(ctx.index().document_entries("r").await.unwrap().len(), 1);

        let first = ctx.delete_document("r").await.unwrap();
        assert_eq!(first.entries_removed, 1);
        assert!(first.record_removed);
        let second = ctx.delete_document("r").await.unwrap();
        assert_eq!(
            second,
            DeleteOutcome {
                entries_removed: 0,
                record_removed: false
            }
        );
        assert!(ctx.query(FIRE_CODE, &QueryOptions::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_document_are_serialized() {
        let ctx = Arc::new(context_with(64));
        let mut handles = Vec::new();
        for i in 0..8 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let body = format!("{} revision {}", FIRE_CODE, i);
                ctx.ingest_document(UploadRequest::new("same", "s.txt", body.into_bytes(), "text"))
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().unwrap().is_indexed());
        }
        assert_eq!(ctx.index().document_entries("same").await.unwrap().len(), 1);
        assert!(ctx.doc_locks.lock().unwrap().is_empty());
    }

    /// Delegates to an in-memory index; optionally slow to search or
    /// refusing writes for one document.
    struct ScriptedIndex {
        inner: InMemoryIndex,
        search_delay: Duration,
        reject: Option<&'static str>,
    }

    impl ScriptedIndex {
        fn new(dims: usize) -> Self {
            Self {
                inner: InMemoryIndex::new(dims, "hash-v1-64"),
                search_delay: Duration::ZERO,
                reject: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl VectorIndex for ScriptedIndex {
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        fn model(&self) -> &str {
            self.inner.model()
        }
        async fn upsert(&self, document_id: &str, entries: Vec<IndexEntry>) -> Result<usize> {
            if self.reject == Some(document_id) {
                return Err(RagError::DimensionMismatch {
                    expected: 128,
                    actual: self.inner.dims(),
                });
            }
            self.inner.upsert(document_id, entries).await
        }
        async fn delete(&self, document_id: &str) -> Result<usize> {
            self.inner.delete(document_id).await
        }
        async fn search(
            &self,
            query: &[f32],
            top_k: usize,
            filter: Option<&MetadataFilter>,
        ) -> Result<Vec<docrag_core::models::ScoredEntry>> {
            tokio::time::sleep(self.search_delay).await;
            self.inner.search(query, top_k, filter).await
        }
        async fn document_entries(&self, document_id: &str) -> Result<Vec<IndexEntry>> {
            self.inner.document_entries(document_id).await
        }
        async fn count(&self) -> Result<usize> {
            self.inner.count().await
        }
        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    /// Hash embeddings that take an hour to arrive.
    struct StalledEmbedder(HashProvider);

    #[async_trait::async_trait]
    impl EmbeddingProvider for StalledEmbedder {
        fn model_name(&self) -> &str {
            self.0.model_name()
        }
        fn dims(&self) -> usize {
            self.0.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            self.0.embed(texts).await
        }
    }

    fn context_from(index: ScriptedIndex, embedder: Arc<dyn EmbeddingProvider>) -> RagContext {
        let mut cfg = config();
        cfg.ingest.embed_timeout_secs = 5;
        RagContext::from_parts(cfg, Arc::new(index), embedder, Arc::new(InMemoryStatusStore::new()))
    }

    #[tokio::test]
    async fn failed_reupload_drops_previous_chunks() {
        let ctx = context_with(64);
        ctx.ingest_document(UploadRequest::new("r", "r.txt", FIRE_CODE.into(), "text"))
            .await
            .unwrap();
        assert_eq!(ctx.index().document_entries("r").await.unwrap().len(), 1);

        let outcome = ctx
            .ingest_document(UploadRequest::new("r", "r.pdf", b"not a pdf".to_vec(), "pdf"))
            .await
            .unwrap();
        assert_eq!(outcome.status, DocumentStatus::Failed);

        let doc = ctx.status_store().get("r").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(ctx.index().document_entries("r").await.unwrap().is_empty());
        assert!(ctx.query(FIRE_CODE, &QueryOptions::default()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn embedding_timeout_fails_the_document() {
        let ctx = context_from(
            ScriptedIndex::new(64),
            Arc::new(StalledEmbedder(HashProvider::new(64))),
        );
        let outcome = ctx
            .ingest_document(UploadRequest::new("slow", "slow.txt", FIRE_CODE.into(), "text"))
            .await
            .unwrap();
        assert_eq!(outcome.status, DocumentStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::EmbeddingError));
        assert!(outcome.error.unwrap().contains("timed out after 5s"));

        let doc = ctx.status_store().get("slow").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.error_kind, Some(ErrorKind::EmbeddingError));
        assert_eq!(ctx.index().count().await.unwrap(), 0);

        let err = ctx.query(FIRE_CODE, &QueryOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingError);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_search_is_not_an_embedding_timeout() {
        let mut index = ScriptedIndex::new(64);
        index.search_delay = Duration::from_secs(60);
        let ctx = context_from(index, Arc::new(HashProvider::new(64)));
        ctx.ingest_document(UploadRequest::new("fire", "fire.txt", FIRE_CODE.into(), "text"))
            .await
            .unwrap();

        let found = ctx.query(FIRE_CODE, &QueryOptions::default()).await.unwrap();
        assert_eq!(found.chunks[0].document_id, "fire");
    }

    #[tokio::test]
    async fn index_error_aborts_the_rest_of_the_batch() {
        let mut index = ScriptedIndex::new(64);
        index.reject = Some("bad");
        let mut cfg = config();
        cfg.ingest.document_concurrency = 1;
        let ctx = RagContext::from_parts(
            cfg,
            Arc::new(index),
            Arc::new(HashProvider::new(64)),
            Arc::new(InMemoryStatusStore::new()),
        );

        let err = ctx
            .ingest_batch(vec![
                UploadRequest::new("a", "a.txt", FIRE_CODE.into(), "text"),
                UploadRequest::new("bad", "bad.txt", FIRE_CODE.into(), "text"),
                UploadRequest::new("c", "c.txt", FIRE_CODE.into(), "text"),
                UploadRequest::new("d", "d.txt", FIRE_CODE.into(), "text"),
                UploadRequest::new("e", "e.txt", FIRE_CODE.into(), "text"),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);

        let bad = ctx.status_store().get("bad").await.unwrap().unwrap();
        assert_eq!(bad.error_kind, Some(ErrorKind::DimensionMismatch));
        let a = ctx.status_store().get("a").await.unwrap().unwrap();
        assert_eq!(a.status, DocumentStatus::Indexed);
        assert_eq!(ctx.index().document_entries("a").await.unwrap().len(), 1);

        // One at a time: everything after "bad" starts on a cancelled token.
        for id in ["c", "d", "e"] {
            let doc = ctx.status_store().get(id).await.unwrap().unwrap();
            assert_eq!(doc.status, DocumentStatus::Failed, "{}", id);
            assert_eq!(doc.error_kind, Some(ErrorKind::Cancelled), "{}", id);
            assert!(ctx.index().document_entries(id).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn caller_tokens_do_not_outlive_the_batch() {
        let ctx = context_with(64);
        let parent = CancellationToken::new();
        let stopped = CancellationToken::new();
        stopped.cancel();

        let metrics = tokio::runtime::Handle::current().metrics();
        let before = metrics.num_alive_tasks();

        let mut requests: Vec<UploadRequest> = (0..20)
            .map(|i| {
                UploadRequest::new(&format!("t{}", i), "t.txt", FIRE_CODE.into(), "text")
                    .with_cancel(parent.child_token())
            })
            .collect();
        requests.push(
            UploadRequest::new("stopped", "s.txt", FIRE_CODE.into(), "text").with_cancel(stopped),
        );
        let outcomes = ctx.ingest_batch(requests).await.unwrap();
        assert!(outcomes[..20].iter().all(|o| o.is_indexed()));
        assert_eq!(outcomes[20].error_kind, Some(ErrorKind::Cancelled));
        assert!(!parent.is_cancelled());

        for _ in 0..100 {
            if metrics.num_alive_tasks() == before {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(metrics.num_alive_tasks(), before);
    }
}
