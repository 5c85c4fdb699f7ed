//! SQLite-backed [`VectorIndex`] and [`DocumentStatusStore`].
//!
//! Vectors are stored as little-endian f32 BLOBs and searched by brute-force
//! cosine similarity. Each upsert runs in a single transaction, so readers
//! see a document either entirely before or entirely after the write.
//!
//! The `index_meta` table records the dimensionality and model the index was
//! built with; reopening with a different provider is refused.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use docrag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docrag_core::models::{Document, IndexEntry, Metadata, MetadataFilter, ScoredEntry};
use docrag_core::store::{
    check_transition, validate_entries, validate_query, DocumentStatusStore, StatusCounts,
    StatusUpdate, VectorIndex,
};
use docrag_core::{ErrorKind, RagError, Result};

/// Map a sqlx error onto the taxonomy: storage trouble is retryable
/// [`RagError::IndexUnavailable`], anything about the data itself is not.
pub fn map_sqlx(e: sqlx::Error) -> RagError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RagError::IndexUnavailable(e.to_string()),
        sqlx::Error::Database(db) => {
            // SQLITE_BUSY, SQLITE_LOCKED, SQLITE_IOERR, SQLITE_CANTOPEN (and extended codes)
            let primary = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xFF);
            match primary {
                Some(5) | Some(6) | Some(10) | Some(14) => {
                    RagError::IndexUnavailable(e.to_string())
                }
                _ => RagError::Validation(format!("database error: {}", e)),
            }
        }
        _ => RagError::Validation(format!("index data error: {}", e)),
    }
}

fn parse_metadata(json: &str) -> Result<Metadata> {
    serde_json::from_str(json).map_err(|e| RagError::Validation(format!("bad metadata: {}", e)))
}

fn metadata_json(metadata: &Metadata) -> Result<String> {
    serde_json::to_string(metadata).map_err(|e| RagError::Validation(e.to_string()))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Dimensionality and model recorded for an existing index, if any.
pub async fn stored_provenance(pool: &SqlitePool) -> Result<Option<(usize, String)>> {
    let rows = sqlx::query("SELECT key, value FROM index_meta")
        .fetch_all(pool)
        .await
        .map_err(map_sqlx)?;

    let mut dims = None;
    let mut model = None;
    for row in &rows {
        let key: String = row.get("key");
        let value: String = row.get("value");
        match key.as_str() {
            "dims" => dims = value.parse::<usize>().ok(),
            "model" => model = Some(value),
            _ => {}
        }
    }
    Ok(dims.zip(model))
}

/// Persistent vector index over the `index_entries` table.
pub struct SqliteIndex {
    pool: SqlitePool,
    dims: usize,
    model: String,
}

impl SqliteIndex {
    /// Open the index for a provider producing `dims`-dimensional vectors
    /// from `model`.
    ///
    /// A fresh index records the provenance. An existing one must match it:
    /// a different dimensionality is [`RagError::DimensionMismatch`], a
    /// different model [`RagError::ModelMismatch`].
    pub async fn open(pool: SqlitePool, dims: usize, model: &str) -> Result<Self> {
        match stored_provenance(&pool).await? {
            Some((stored_dims, stored_model)) => {
                if stored_dims != dims {
                    return Err(RagError::DimensionMismatch {
                        expected: stored_dims,
                        actual: dims,
                    });
                }
                if stored_model != model {
                    return Err(RagError::ModelMismatch {
                        expected: stored_model,
                        actual: model.to_string(),
                    });
                }
            }
            None => {
                write_provenance(&pool, dims, model).await?;
                info!(dims, model, "initialised vector index provenance");
            }
        }
        Ok(Self {
            pool,
            dims,
            model: model.to_string(),
        })
    }

    /// Open with whatever provenance is stored, without an embedding
    /// provider. Used for maintenance commands (list, delete, stats, clear).
    pub async fn open_existing(pool: SqlitePool) -> Result<Self> {
        let (dims, model) = stored_provenance(&pool).await?.unwrap_or((0, String::new()));
        Ok(Self { pool, dims, model })
    }

    fn row_to_entry(row: &SqliteRow) -> Result<IndexEntry> {
        let chunk_index: i64 = row.get("chunk_index");
        let start: i64 = row.get("start_offset");
        let end: i64 = row.get("end_offset");
        let total: i64 = row.get("total_chunks");
        let meta: String = row.get("metadata_json");
        let blob: Vec<u8> = row.get("embedding");
        Ok(IndexEntry {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            chunk_index: chunk_index as usize,
            start: start as usize,
            end: end as usize,
            total_chunks: total as usize,
            text: row.get("text"),
            metadata: parse_metadata(&meta)?,
            vector: blob_to_vec(&blob),
        })
    }
}

async fn write_provenance(pool: &SqlitePool, dims: usize, model: &str) -> Result<()> {
    let mut tx = pool.begin().await.map_err(map_sqlx)?;
    for (key, value) in [("dims", dims.to_string()), ("model", model.to_string())] {
        sqlx::query("INSERT OR IGNORE INTO index_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
    }
    tx.commit().await.map_err(map_sqlx)?;
    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn upsert(&self, document_id: &str, entries: Vec<IndexEntry>) -> Result<usize> {
        validate_entries(self.dims, document_id, &entries)?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        if self.dims > 0 {
            // provenance may have been dropped by clear()
            for (key, value) in [("dims", self.dims.to_string()), ("model", self.model.clone())] {
                sqlx::query("INSERT OR IGNORE INTO index_meta (key, value) VALUES (?, ?)")
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
            }
        }

        sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        for e in &entries {
            sqlx::query(
                r#"
                INSERT INTO index_entries
                    (chunk_id, document_id, chunk_index, start_offset, end_offset,
                     total_chunks, text, metadata_json, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&e.chunk_id)
            .bind(&e.document_id)
            .bind(e.chunk_index as i64)
            .bind(e.start as i64)
            .bind(e.end as i64)
            .bind(e.total_chunks as i64)
            .bind(&e.text)
            .bind(metadata_json(&e.metadata)?)
            .bind(vec_to_blob(&e.vector))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        debug!(document_id, entries = entries.len(), "index upsert committed");
        Ok(entries.len())
    }

    async fn delete(&self, document_id: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() as usize)
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

        // Narrow by document id in SQL when the filter pins one
        let pinned_doc = filter.and_then(|f| f.equals.get("document_id"));
        let rows = match pinned_doc {
            Some(doc_id) => {
                sqlx::query("SELECT * FROM index_entries WHERE document_id = ? ORDER BY seq ASC")
                    .bind(doc_id)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM index_entries ORDER BY seq ASC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx)?;

        let mut scored: Vec<(f32, i64, IndexEntry)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let entry = Self::row_to_entry(row)?;
            if let Some(f) = filter {
                if !f.matches(&entry.metadata) {
                    continue;
                }
            }
            let seq: i64 = row.get("seq");
            let score = cosine_similarity(query, &entry.vector);
            scored.push((score, seq, entry));
        }

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, _, entry)| ScoredEntry { entry, score })
            .collect())
    }

    async fn document_entries(&self, document_id: &str) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM index_entries WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(n as usize)
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("DELETE FROM index_entries")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        sqlx::query("DELETE FROM index_meta")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }
}

/// Document status store over the `documents` table.
pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_document(row: &SqliteRow) -> Result<Document> {
        let media_type: String = row.get("media_type");
        let status: String = row.get("status");
        let error_kind: Option<String> = row.get("error_kind");
        let byte_len: i64 = row.get("byte_len");
        let chunk_count: Option<i64> = row.get("chunk_count");
        let tags: String = row.get("tags_json");

        Ok(Document {
            id: row.get("id"),
            filename: row.get("filename"),
            media_type: media_type.parse()?,
            byte_len: byte_len as u64,
            ingested_at: from_millis(row.get("ingested_at")),
            updated_at: from_millis(row.get("updated_at")),
            status: status.parse()?,
            error_kind: error_kind.map(|k| k.parse::<ErrorKind>()).transpose()?,
            error_message: row.get("error_message"),
            chunk_count: chunk_count.map(|n| n as usize),
            tags: parse_metadata(&tags)?,
        })
    }
}

#[async_trait]
impl DocumentStatusStore for SqliteStatusStore {
    async fn register(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, filename, media_type, byte_len, ingested_at, updated_at,
                 status, error_kind, error_message, chunk_count, tags_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                media_type = excluded.media_type,
                byte_len = excluded.byte_len,
                ingested_at = excluded.ingested_at,
                updated_at = excluded.updated_at,
                status = excluded.status,
                error_kind = excluded.error_kind,
                error_message = excluded.error_message,
                chunk_count = excluded.chunk_count,
                tags_json = excluded.tags_json
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(doc.media_type.as_str())
        .bind(doc.byte_len as i64)
        .bind(doc.ingested_at.timestamp_millis())
        .bind(doc.updated_at.timestamp_millis())
        .bind(doc.status.as_str())
        .bind(doc.error_kind.map(|k| k.as_str()))
        .bind(&doc.error_message)
        .bind(doc.chunk_count.map(|n| n as i64))
        .bind(metadata_json(&doc.tags)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn set_status(&self, id: &str, update: StatusUpdate) -> Result<()> {
        let current: Option<String> = sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let current = current
            .ok_or_else(|| RagError::Validation(format!("unknown document: {}", id)))?;
        check_transition(id, current.parse()?, update.status)?;

        let (kind, message) = match update.error {
            Some((k, m)) => (Some(k.as_str()), Some(m)),
            None => (None, None),
        };

        sqlx::query(
            r#"
            UPDATE documents SET
                status = ?,
                updated_at = ?,
                error_kind = COALESCE(?, error_kind),
                error_message = COALESCE(?, error_message),
                chunk_count = COALESCE(?, chunk_count)
            WHERE id = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(kind)
        .bind(message)
        .bind(update.chunk_count.map(|n| n as i64))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(Self::row_to_document).transpose()
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT * FROM documents ORDER BY ingested_at DESC, id ASC LIMIT ? OFFSET ?",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(Self::row_to_document).collect()
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM documents")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM documents GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let mut counts = StatusCounts::default();
        for row in &rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            counts.add(status.parse()?, n as usize);
        }
        Ok(counts)
    }
}
