//! # docrag CLI
//!
//! Ingest documents into a local vector index and retrieve cited context
//! for questions.
//!
//! ## Usage
//!
//! ```bash
//! docrag --config ./config/docrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docrag init` | Create the SQLite database and schema |
//! | `docrag ingest <paths>...` | Extract, chunk, embed and index files |
//! | `docrag query "<text>"` | Retrieve cited context for a question |
//! | `docrag list` | List documents with their processing status |
//! | `docrag get <id>` | Show a document and its indexed chunks |
//! | `docrag delete <id>` | Remove a document and its index entries |
//! | `docrag stats` | Document counts, entry count, index provenance |
//! | `docrag clear` | Drop every document and index entry |
//!
//! Logs go to stderr and are controlled by `RUST_LOG` (default
//! `docrag=info`); command output goes to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docrag::pipeline::RagContext;
use docrag::{config, get, ingest, migrate, query, stats};

/// docrag: document ingestion and cited retrieval over a local vector index.
#[derive(Parser)]
#[command(name = "docrag", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest files or directories.
    ///
    /// Directories are walked recursively; files with a supported extension
    /// (txt, md, pdf, docx, doc, csv, png, jpg, jpeg, tif, tiff, bmp, gif,
    /// webp) are ingested in parallel.
    Ingest {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Document id to use (single file only). Defaults to an id derived
        /// from the canonical path.
        #[arg(long)]
        id: Option<String>,

        /// Tag attached to every chunk, as KEY=VALUE. Repeatable.
        #[arg(long = "tag", value_parser = parse_key_val)]
        tags: Vec<(String, String)>,

        /// Declared media type, overriding the file extension
        /// (e.g. `text/plain; charset=utf-16le`).
        #[arg(long)]
        media_type: Option<String>,

        /// Only ingest files whose relative path matches this glob. Repeatable.
        #[arg(long)]
        include: Vec<String>,

        /// Print outcomes as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Retrieve cited context for a question.
    Query {
        query: String,

        /// Maximum number of chunks in the context.
        #[arg(long)]
        top_k: Option<usize>,

        /// Character budget of the assembled context.
        #[arg(long)]
        max_chars: Option<usize>,

        /// Metadata equality filter, as KEY=VALUE. Repeatable.
        #[arg(long = "filter", value_parser = parse_key_val)]
        filters: Vec<(String, String)>,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List documents, newest first.
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show one document and its indexed chunks.
    Get {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Delete a document and all of its index entries.
    Delete { id: String },

    /// Show document and index statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Remove every document and index entry.
    Clear,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docrag=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let ctx = RagContext::open(cfg).await?;

    let result = match cli.command {
        Commands::Init => Ok(()),
        Commands::Ingest {
            paths,
            id,
            tags,
            media_type,
            include,
            json,
        } => {
            let args = ingest::IngestArgs {
                paths,
                id,
                tags,
                media_type,
                include,
                json,
            };
            ingest::run_ingest(&ctx, &args).await
        }
        Commands::Query {
            query,
            top_k,
            max_chars,
            filters,
            json,
        } => query::run_query(&ctx, &query, top_k, max_chars, filters, json).await,
        Commands::List {
            limit,
            offset,
            json,
        } => get::run_list(&ctx, limit, offset, json).await,
        Commands::Get { id, json } => get::run_get(&ctx, &id, json).await,
        Commands::Delete { id } => get::run_delete(&ctx, &id).await,
        Commands::Stats { json } => stats::run_stats(&ctx, json).await,
        Commands::Clear => stats::run_clear(&ctx).await,
    };

    ctx.close().await;
    result
}
