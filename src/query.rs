//! `docrag query`: retrieve cited context for a question.

use anyhow::{bail, Result};

use docrag_core::models::MetadataFilter;

use crate::pipeline::{QueryOptions, RagContext};

/// Printed when nothing scores above the similarity floor.
pub const NO_CONTEXT: &str = "No relevant context found.";

pub async fn run_query(
    ctx: &RagContext,
    query: &str,
    top_k: Option<usize>,
    max_chars: Option<usize>,
    filters: Vec<(String, String)>,
    json: bool,
) -> Result<()> {
    if !ctx.config().embedding.is_enabled() {
        bail!("Query requires an embedding provider. Set [embedding] provider in config.");
    }

    let filter = if filters.is_empty() {
        None
    } else {
        Some(
            filters
                .iter()
                .fold(MetadataFilter::new(), |f, (k, v)| f.with(k, v)),
        )
    };
    let opts = QueryOptions {
        top_k,
        max_context_chars: max_chars,
        filter,
    };

    let result = ctx.query(query, &opts).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    if result.is_empty() {
        println!("{}", NO_CONTEXT);
        return Ok(());
    }

    for (i, chunk) in result.chunks.iter().enumerate() {
        let filename = chunk
            .metadata
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        println!(
            "[{}] {:.4}  {} #{} chars {}..{}  {}",
            i + 1,
            chunk.score,
            chunk.document_id,
            chunk.chunk_index,
            chunk.start,
            chunk.end,
            filename
        );
        println!("{}", chunk.text);
        println!();
    }
    println!(
        "{} chunks, {} chars of context ({} candidates)",
        result.chunks.len(),
        result.total_chars,
        result.candidates_considered
    );
    Ok(())
}
