//! `docrag stats` and `docrag clear`.

use anyhow::Result;

use crate::pipeline::RagContext;

/// Print document counts per status, index size and provenance.
pub async fn run_stats(ctx: &RagContext, json: bool) -> Result<()> {
    let stats = ctx.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let db_path = &ctx.config().db.path;
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    println!("docrag: Index Stats");
    println!("====================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Provider:    {}", stats.provider);
    if stats.dims > 0 {
        println!("  Model:       {} ({} dims)", stats.model, stats.dims);
    } else {
        println!("  Model:       (none recorded)");
    }
    println!();
    println!("  Documents:   {}", stats.documents.total());
    println!("    indexed:   {}", stats.documents.indexed);
    println!("    failed:    {}", stats.documents.failed);
    let in_flight =
        stats.documents.pending + stats.documents.extracted + stats.documents.chunked;
    if in_flight > 0 {
        println!("    in flight: {}", in_flight);
    }
    println!("  Entries:     {}", stats.entries);
    println!();
    Ok(())
}

/// Drop every index entry and document record.
pub async fn run_clear(ctx: &RagContext) -> Result<()> {
    let before = ctx.stats().await?;
    ctx.clear().await?;
    println!(
        "cleared {} documents and {} index entries",
        before.documents.total(),
        before.entries
    );
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
