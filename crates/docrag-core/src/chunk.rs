//! Text normalization and sliding-window chunking.
//!
//! [`normalize_text`] must run before [`chunk_text`]: chunk offsets refer to
//! the normalized text, and the same normalized text is what gets embedded.
//!
//! # Algorithm
//!
//! 1. Slide a window of `chunk_size` characters over the text.
//! 2. If the window does not reach the end of the text, search backward from
//!    its end for the nearest sentence-like boundary (`. `, `! `, `? ` or a
//!    blank line). Accept it only if it lies past
//!    `start + chunk_size × boundary_min_fraction`; otherwise hard-cut.
//! 3. The next window starts at `end - overlap` (overlap clamped to
//!    `[0, chunk_size - 1]`) and always advances at least one character.
//! 4. Stop once a window reaches the end of the text, or when the per-document
//!    chunk cap is hit (the result is then flagged as truncated).
//!
//! # Example
//!
//! ```rust
//! use docrag_core::chunk::{chunk_text, ChunkParams};
//! use docrag_core::models::Metadata;
//!
//! let text = "a".repeat(2500);
//! let set = chunk_text("doc-1", &text, &ChunkParams::new(1000, 200), &Metadata::new()).unwrap();
//! let spans: Vec<_> = set.chunks.iter().map(|c| (c.start, c.end)).collect();
//! assert_eq!(spans, vec![(0, 1000), (800, 1800), (1600, 2500)]);
//! ```

use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::{Chunk, Metadata};

/// Chunking parameters. All lengths are in characters.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub overlap: usize,
    /// A boundary is only used when it ends the chunk past this fraction of
    /// the window. `0.5` keeps the classic "back half of the window" rule.
    pub boundary_min_fraction: f64,
    /// Hard cap on chunks per document.
    pub max_chunks: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
            boundary_min_fraction: 0.5,
            max_chunks: 10_000,
        }
    }
}

impl ChunkParams {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size,
            overlap,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::Validation("chunk_size must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.boundary_min_fraction) {
            return Err(RagError::Validation(
                "boundary_min_fraction must be in [0.0, 1.0)".into(),
            ));
        }
        if self.max_chunks == 0 {
            return Err(RagError::Validation("max_chunks must be > 0".into()));
        }
        Ok(())
    }

    /// Overlap clamped to `[0, chunk_size - 1]`.
    pub fn effective_overlap(&self) -> usize {
        self.overlap.min(self.chunk_size.saturating_sub(1))
    }
}

/// Output of [`chunk_text`].
#[derive(Debug, Clone)]
pub struct ChunkSet {
    pub chunks: Vec<Chunk>,
    /// True when the chunk cap cut the document short.
    pub truncated: bool,
}

/// Normalize extracted text so offsets are stable between the chunking and
/// embedding stages.
///
/// - `\r\n` and `\r` become `\n`
/// - control and zero-width characters are dropped (newline excepted)
/// - runs of other whitespace collapse to a single space
/// - runs of newlines collapse to `\n` or, for two or more, a blank line
/// - leading and trailing whitespace is removed
pub fn normalize_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    let mut newlines = 0usize;
    let mut prev_cr = false;

    for c in raw.chars() {
        let was_cr = prev_cr;
        prev_cr = c == '\r';
        if c == '\r' || c == '\n' {
            // "\r\n" counts as a single line break
            if !(c == '\n' && was_cr) {
                newlines += 1;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if !is_printable(c) {
            continue;
        }
        if newlines > 0 {
            if !out.is_empty() {
                out.push_str(if newlines >= 2 { "\n\n" } else { "\n" });
            }
        } else if pending_space && !out.is_empty() {
            out.push(' ');
        }
        newlines = 0;
        pending_space = false;
        out.push(c);
    }

    out
}

fn is_printable(c: char) -> bool {
    !c.is_control() && !matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}')
}

/// Compute `[start, end)` character spans for `chars`.
///
/// Returns the spans and whether the chunk cap truncated the output.
pub fn chunk_spans(chars: &[char], params: &ChunkParams) -> Result<(Vec<(usize, usize)>, bool)> {
    params.validate()?;

    let n = chars.len();
    let mut spans = Vec::new();
    if n == 0 {
        return Ok((spans, false));
    }

    let overlap = params.effective_overlap();
    let min_len = (params.chunk_size as f64 * params.boundary_min_fraction) as usize;
    let mut start = 0usize;

    loop {
        if spans.len() == params.max_chunks {
            return Ok((spans, true));
        }

        let hard_end = (start + params.chunk_size).min(n);
        let end = if hard_end < n {
            find_boundary(chars, start + min_len, hard_end).unwrap_or(hard_end)
        } else {
            hard_end
        };
        spans.push((start, end));

        if end >= n {
            break;
        }

        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { start + 1 };
    }

    Ok((spans, false))
}

/// Nearest boundary scanning backward from `end`, returning a cut position
/// strictly greater than `threshold`.
fn find_boundary(chars: &[char], threshold: usize, end: usize) -> Option<usize> {
    let mut j = end;
    while j > threshold {
        j -= 1;
        let c = chars[j];
        if matches!(c, '.' | '!' | '?')
            && chars.get(j + 1).is_some_and(|n| *n == ' ' || *n == '\n')
        {
            // keep the punctuation mark in the chunk
            return Some(j + 1);
        }
        if c == '\n' && j > 0 && chars[j - 1] == '\n' {
            let cut = j - 1;
            if cut > threshold {
                return Some(cut);
            }
        }
    }
    None
}

/// Split normalized text into overlapping, offset-tracked chunks.
///
/// Every chunk's metadata starts from `base_metadata` and gains
/// `document_id`, `chunk_index` and `total_chunks`. Chunk ids are
/// deterministic in `(document_id, chunk_index)`.
///
/// Empty text yields an empty set.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    params: &ChunkParams,
    base_metadata: &Metadata,
) -> Result<ChunkSet> {
    let chars: Vec<char> = text.chars().collect();
    let (spans, truncated) = chunk_spans(&chars, params)?;

    if truncated {
        warn!(
            document_id,
            max_chunks = params.max_chunks,
            text_chars = chars.len(),
            "chunk cap reached; document truncated"
        );
    }

    let mut byte_offsets: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
    byte_offsets.push(text.len());

    let total = spans.len();
    let chunks = spans
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| {
            let slice = &text[byte_offsets[start]..byte_offsets[end]];
            make_chunk(document_id, index, start, end, total, slice, base_metadata)
        })
        .collect();

    Ok(ChunkSet { chunks, truncated })
}

/// Deterministic chunk id for `(document_id, index)`.
pub fn chunk_id(document_id: &str, index: usize) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}#{}", document_id, index).as_bytes(),
    )
    .to_string()
}

fn make_chunk(
    document_id: &str,
    index: usize,
    start: usize,
    end: usize,
    total: usize,
    text: &str,
    base_metadata: &Metadata,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let mut metadata = base_metadata.clone();
    metadata.insert("document_id".into(), document_id.into());
    metadata.insert("chunk_index".into(), index.into());
    metadata.insert("total_chunks".into(), total.into());

    Chunk {
        id: chunk_id(document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        start,
        end,
        total_chunks: total,
        text: text.to_string(),
        hash,
        metadata,
    }
}
