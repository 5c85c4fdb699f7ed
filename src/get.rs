//! Document inspection commands: `get`, `list` and `delete`.

use anyhow::{bail, Result};

use docrag_core::models::Document;

use crate::pipeline::RagContext;

/// CLI entry point for `docrag get <id>`: metadata plus indexed chunks.
pub async fn run_get(ctx: &RagContext, id: &str, json: bool) -> Result<()> {
    let Some(detail) = ctx.get_document(id).await? else {
        bail!("document not found: {}", id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    let doc = &detail.document;
    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("filename:     {}", doc.filename);
    println!("media_type:   {}", doc.media_type);
    println!("bytes:        {}", doc.byte_len);
    println!("status:       {}", doc.status);
    if let Some(kind) = doc.error_kind {
        println!(
            "error:        {}: {}",
            kind,
            doc.error_message.as_deref().unwrap_or("")
        );
    }
    println!("ingested_at:  {}", format_ts(doc));
    println!("updated_at:   {}", doc.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!("tags:         {}", serde_json::Value::Object(doc.tags.clone()));
    println!();

    println!("--- Chunks ({}) ---", detail.entries.len());
    for entry in &detail.entries {
        println!(
            "[chunk {}] chars {}..{}",
            entry.chunk_index, entry.start, entry.end
        );
        println!("{}", entry.text);
        println!();
    }

    Ok(())
}

/// CLI entry point for `docrag list`.
pub async fn run_list(ctx: &RagContext, limit: usize, offset: usize, json: bool) -> Result<()> {
    let docs = ctx.list_documents(limit, offset).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&docs)?);
        return Ok(());
    }
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<9}  {:<5}  {:>6}  {:<16}  {}",
        "ID", "STATUS", "TYPE", "CHUNKS", "INGESTED", "FILENAME"
    );
    for doc in &docs {
        let chunks = doc
            .chunk_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = match doc.error_kind {
            Some(kind) => format!("{} ({})", doc.status, kind),
            None => doc.status.to_string(),
        };
        println!(
            "{:<36}  {:<9}  {:<5}  {:>6}  {:<16}  {}",
            doc.id,
            status,
            doc.media_type,
            chunks,
            format_ts(doc),
            doc.filename
        );
    }
    Ok(())
}

/// CLI entry point for `docrag delete <id>`. Deleting an unknown id is not
/// an error.
pub async fn run_delete(ctx: &RagContext, id: &str) -> Result<()> {
    let outcome = ctx.delete_document(id).await?;
    if outcome.record_removed || outcome.entries_removed > 0 {
        println!(
            "deleted {} ({} index entries)",
            id, outcome.entries_removed
        );
    } else {
        println!("nothing to delete for {}", id);
    }
    Ok(())
}

fn format_ts(doc: &Document) -> String {
    doc.ingested_at.format("%Y-%m-%d %H:%M").to_string()
}
