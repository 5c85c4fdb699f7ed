//! Core data models used throughout docrag.
//!
//! These types represent the documents, chunks, index entries and query
//! results that flow through the ingestion and retrieval pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, RagError, Result};

/// Free-form metadata attached to documents and chunks.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_MSWORD: &str = "application/msword";
pub const MIME_CSV: &str = "text/csv";

/// The closed set of media types the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Text,
    Pdf,
    Docx,
    Csv,
    Image,
}

impl MediaType {
    /// Parse a declared MIME type. Parameters such as `; charset=utf-8` are
    /// ignored here; the extractor reads the charset separately.
    pub fn from_mime(declared: &str) -> Result<Self> {
        let essence = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            MIME_TEXT | MIME_MARKDOWN => Ok(MediaType::Text),
            MIME_PDF => Ok(MediaType::Pdf),
            MIME_DOCX | MIME_MSWORD => Ok(MediaType::Docx),
            MIME_CSV | "application/csv" => Ok(MediaType::Csv),
            "image/png" | "image/jpeg" | "image/jpg" | "image/tiff" | "image/bmp" | "image/gif"
            | "image/webp" => Ok(MediaType::Image),
            _ => Err(RagError::UnsupportedMediaType(declared.to_string())),
        }
    }

    /// Infer the media type from a file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "txt" | "md" | "markdown" | "text" => Ok(MediaType::Text),
            "pdf" => Ok(MediaType::Pdf),
            "docx" | "doc" => Ok(MediaType::Docx),
            "csv" => Ok(MediaType::Csv),
            "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" | "gif" | "webp" => {
                Ok(MediaType::Image)
            }
            _ => Err(RagError::UnsupportedMediaType(format!(
                "no media type for extension '.{}'",
                ext
            ))),
        }
    }

    /// Canonical MIME string for this media type.
    pub fn mime(&self) -> &'static str {
        match self {
            MediaType::Text => MIME_TEXT,
            MediaType::Pdf => MIME_PDF,
            MediaType::Docx => MIME_DOCX,
            MediaType::Csv => MIME_CSV,
            MediaType::Image => "image/*",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Text => "text",
            MediaType::Pdf => "pdf",
            MediaType::Docx => "docx",
            MediaType::Csv => "csv",
            MediaType::Image => "image",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = RagError;

    /// Accepts either the short name (`"pdf"`) or a MIME type.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(MediaType::Text),
            "pdf" => Ok(MediaType::Pdf),
            "docx" => Ok(MediaType::Docx),
            "csv" => Ok(MediaType::Csv),
            "image" => Ok(MediaType::Image),
            other => MediaType::from_mime(other),
        }
    }
}

/// Processing status of a document. Transitions only move forward
/// (`pending → extracted → chunked → indexed`) or to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Extracted,
    Chunked,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Extracted => "extracted",
            DocumentStatus::Chunked => "chunked",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Indexed | DocumentStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            DocumentStatus::Pending => 0,
            DocumentStatus::Extracted => 1,
            DocumentStatus::Chunked => 2,
            DocumentStatus::Indexed => 3,
            DocumentStatus::Failed => 4,
        }
    }

    /// Whether a document in `self` may move to `next`. Terminal states
    /// only change through re-registration.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == DocumentStatus::Failed || next.rank() > self.rank()
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "extracted" => Ok(DocumentStatus::Extracted),
            "chunked" => Ok(DocumentStatus::Chunked),
            "indexed" => Ok(DocumentStatus::Indexed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(RagError::Validation(format!(
                "unknown document status: {}",
                other
            ))),
        }
    }
}

/// A document record as kept by the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub media_type: MediaType,
    pub byte_len: u64,
    pub ingested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: DocumentStatus,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub chunk_count: Option<usize>,
    pub tags: Metadata,
}

impl Document {
    /// A freshly uploaded document in `pending` state.
    pub fn pending(
        id: &str,
        filename: &str,
        media_type: MediaType,
        byte_len: u64,
        tags: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            filename: filename.to_string(),
            media_type,
            byte_len,
            ingested_at: now,
            updated_at: now,
            status: DocumentStatus::Pending,
            error_kind: None,
            error_message: None,
            chunk_count: None,
            tags,
        }
    }
}

/// A bounded, offset-tracked slice of a document's normalized text.
///
/// `start` and `end` are character offsets (not bytes) into the normalized
/// text the chunk was cut from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub start: usize,
    pub end: usize,
    pub total_chunks: usize,
    pub text: String,
    pub hash: String,
    pub metadata: Metadata,
}

/// One stored row of the vector index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub start: usize,
    pub end: usize,
    pub total_chunks: usize,
    pub text: String,
    pub metadata: Metadata,
    #[serde(skip)]
    pub vector: Vec<f32>,
}

impl IndexEntry {
    pub fn from_chunk(chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            chunk_index: chunk.chunk_index,
            start: chunk.start,
            end: chunk.end,
            total_chunks: chunk.total_chunks,
            text: chunk.text.clone(),
            metadata: chunk.metadata.clone(),
            vector,
        }
    }
}

/// A search hit: an index entry with its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredEntry {
    pub entry: IndexEntry,
    pub score: f32,
}

/// Equality filter over chunk metadata. An entry matches when every key is
/// present with an equal value; `document_id` and `media_type` can be used
/// like any other key since the pipeline writes them into chunk metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub equals: BTreeMap<String, String>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.equals.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals.iter().all(|(k, want)| match metadata.get(k) {
            Some(serde_json::Value::String(s)) => s == want,
            Some(other) => other.to_string() == *want,
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_media_type_from_mime() {
        assert_eq!(MediaType::from_mime("application/pdf").unwrap(), MediaType::Pdf);
        assert_eq!(
            MediaType::from_mime("text/plain; charset=utf-16le").unwrap(),
            MediaType::Text
        );
        assert_eq!(MediaType::from_mime("TEXT/CSV").unwrap(), MediaType::Csv);
        assert_eq!(MediaType::from_mime("image/png").unwrap(), MediaType::Image);
        let err = MediaType::from_mime("application/octet-stream").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedMediaType);
    }

    #[test]
    fn test_media_type_from_path() {
        assert_eq!(
            MediaType::from_path(Path::new("specs/fire-code.PDF")).unwrap(),
            MediaType::Pdf
        );
        assert_eq!(
            MediaType::from_path(Path::new("notes.md")).unwrap(),
            MediaType::Text
        );
        assert!(MediaType::from_path(Path::new("archive.tar.gz")).is_err());
        assert!(MediaType::from_path(Path::new("Makefile")).is_err());
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            DocumentStatus::Pending,
            DocumentStatus::Extracted,
            DocumentStatus::Chunked,
            DocumentStatus::Indexed,
            DocumentStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<DocumentStatus>().unwrap(), s);
        }
        assert!(DocumentStatus::Failed.is_terminal());
        assert!(!DocumentStatus::Chunked.is_terminal());
    }

    #[test]
    fn test_status_transitions() {
        use DocumentStatus::*;
        assert!(Pending.can_transition_to(Extracted));
        assert!(Pending.can_transition_to(Indexed));
        assert!(Chunked.can_transition_to(Failed));
        assert!(!Chunked.can_transition_to(Extracted));
        assert!(!Indexed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn test_filter_matches() {
        let mut meta = Metadata::new();
        meta.insert("document_id".into(), json!("doc-1"));
        meta.insert("year".into(), json!(2024));

        assert!(MetadataFilter::new().matches(&meta));
        assert!(MetadataFilter::new().with("document_id", "doc-1").matches(&meta));
        assert!(MetadataFilter::new().with("year", "2024").matches(&meta));
        assert!(!MetadataFilter::new().with("document_id", "doc-2").matches(&meta));
        assert!(!MetadataFilter::new().with("missing", "x").matches(&meta));
    }
}
