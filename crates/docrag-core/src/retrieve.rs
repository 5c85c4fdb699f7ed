//! Retrieval and context assembly.
//!
//! The retrieval algorithm operates entirely through the [`VectorIndex`] and
//! [`EmbeddingProvider`] traits, with no database or configuration
//! dependencies. The calling application builds [`RetrievalParams`] from its
//! own configuration.
//!
//! # Assembly Algorithm
//!
//! 1. Embed the query.
//! 2. Fetch `top_k × candidate_multiplier` candidates from the index.
//! 3. Drop candidates scoring below `min_score`.
//! 4. Deduplicate: of two chunks from the same document whose offset ranges
//!    overlap, keep the higher-scoring one.
//! 5. Keep at most `top_k`.
//! 6. Concatenate in descending score order, separated by
//!    [`CONTEXT_SEPARATOR`], until the next chunk would push the context past
//!    `max_context_chars`.
//!
//! If nothing survives the floor, the result is empty: callers render it as
//! "no relevant context found" rather than treating it as an error.

use serde::Serialize;
use tracing::debug;

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::models::{Metadata, MetadataFilter, ScoredEntry};
use crate::store::VectorIndex;

/// Joins chunk texts in the assembled context. Counted against the budget.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalParams {
    /// Maximum chunks in the assembled context.
    pub top_k: usize,
    /// Over-fetch factor applied before filtering and deduplication.
    pub candidate_multiplier: usize,
    /// Character budget for the assembled context, separators included.
    pub max_context_chars: usize,
    /// Similarity floor; candidates scoring below it are dropped.
    pub min_score: f32,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            candidate_multiplier: 4,
            max_context_chars: 4000,
            min_score: 0.2,
        }
    }
}

impl RetrievalParams {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(RagError::Validation("top_k must be >= 1".into()));
        }
        if self.candidate_multiplier == 0 {
            return Err(RagError::Validation(
                "candidate_multiplier must be >= 1".into(),
            ));
        }
        if self.max_context_chars == 0 {
            return Err(RagError::Validation(
                "max_context_chars must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn candidate_k(&self) -> usize {
        self.top_k.saturating_mul(self.candidate_multiplier)
    }
}

/// One chunk of the assembled context, with its source attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CitedChunk {
    pub document_id: String,
    pub chunk_id: String,
    pub chunk_index: usize,
    /// Character offsets into the document's normalized text.
    pub start: usize,
    pub end: usize,
    pub score: f32,
    pub text: String,
    pub metadata: Metadata,
}

/// The assembled, cited context handed to an external generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievedContext {
    pub chunks: Vec<CitedChunk>,
    pub context: String,
    /// Length of `context` in characters.
    pub total_chars: usize,
    /// Candidates returned by the index before filtering.
    pub candidates_considered: usize,
}

impl RetrievedContext {
    /// True when no chunk cleared the similarity floor.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

fn overlaps(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

/// Assemble a bounded context from scored candidates.
///
/// Pure function; see the module docs for the steps. If the single best
/// chunk alone exceeds the budget it is cut to the budget (and its `end`
/// offset adjusted) rather than returning nothing.
pub fn assemble(mut candidates: Vec<ScoredEntry>, params: &RetrievalParams) -> RetrievedContext {
    let considered = candidates.len();

    // stable: equal scores keep index order
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<ScoredEntry> = Vec::new();
    for cand in candidates {
        if cand.score < params.min_score || cand.score.is_nan() {
            continue;
        }
        let span = (cand.entry.start, cand.entry.end);
        let duplicate = kept.iter().any(|k| {
            k.entry.document_id == cand.entry.document_id
                && overlaps((k.entry.start, k.entry.end), span)
        });
        if duplicate {
            continue;
        }
        kept.push(cand);
        if kept.len() == params.top_k {
            break;
        }
    }

    let sep_len = CONTEXT_SEPARATOR.chars().count();
    let mut chunks: Vec<CitedChunk> = Vec::new();
    let mut context = String::new();
    let mut total = 0usize;

    for hit in kept {
        let sep = if chunks.is_empty() { 0 } else { sep_len };
        let len = hit.entry.text.chars().count();

        let (text, end) = if total + sep + len <= params.max_context_chars {
            (hit.entry.text, hit.entry.end)
        } else if chunks.is_empty() {
            let cut: String = hit.entry.text.chars().take(params.max_context_chars).collect();
            let end = hit.entry.start + params.max_context_chars;
            (cut, end.min(hit.entry.end))
        } else {
            break;
        };

        if sep > 0 {
            context.push_str(CONTEXT_SEPARATOR);
        }
        context.push_str(&text);
        total += sep + text.chars().count();

        chunks.push(CitedChunk {
            document_id: hit.entry.document_id,
            chunk_id: hit.entry.chunk_id,
            chunk_index: hit.entry.chunk_index,
            start: hit.entry.start,
            end,
            score: hit.score,
            text,
            metadata: hit.entry.metadata,
        });
    }

    RetrievedContext {
        chunks,
        context,
        total_chars: total,
        candidates_considered: considered,
    }
}

/// Embed `query`, search `index`, and assemble a cited context.
///
/// An empty index (or one whose entries all fall below the floor) yields an
/// empty [`RetrievedContext`], not an error.
pub async fn retrieve(
    index: &dyn VectorIndex,
    embedder: &dyn EmbeddingProvider,
    query: &str,
    params: &RetrievalParams,
    filter: Option<&MetadataFilter>,
) -> Result<RetrievedContext> {
    params.validate()?;
    let query_vec = embed_query(embedder, query).await?;
    retrieve_by_vector(index, &query_vec, params, filter).await
}

/// Search `index` with an already-embedded query and assemble the context.
pub async fn retrieve_by_vector(
    index: &dyn VectorIndex,
    query_vec: &[f32],
    params: &RetrievalParams,
    filter: Option<&MetadataFilter>,
) -> Result<RetrievedContext> {
    params.validate()?;
    let candidates = index.search(query_vec, params.candidate_k(), filter).await?;
    let ctx = assemble(candidates, params);
    debug!(
        candidates = ctx.candidates_considered,
        kept = ctx.chunks.len(),
        chars = ctx.total_chars,
        "context assembled"
    );
    Ok(ctx)
}
