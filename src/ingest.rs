//! `docrag ingest`: scan files and directories, then run every supported
//! file through the ingestion pipeline.
//!
//! Directories are walked recursively. A file is picked up when its
//! extension maps to a [`MediaType`] and, if `--include` globs are given, its
//! path relative to the scanned directory matches one of them. Files named
//! explicitly on the command line are always attempted.
//!
//! Document ids are derived from the canonical path, so re-ingesting the same
//! file replaces its previous entries.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

use docrag_core::models::MediaType;

use crate::pipeline::{IngestOutcome, RagContext, UploadRequest};

/// Options for one `docrag ingest` invocation.
#[derive(Debug, Clone, Default)]
pub struct IngestArgs {
    pub paths: Vec<PathBuf>,
    /// Explicit document id; only valid for a single file.
    pub id: Option<String>,
    pub tags: Vec<(String, String)>,
    /// Override the media type inferred from the extension.
    pub media_type: Option<String>,
    pub include: Vec<String>,
    pub json: bool,
}

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Collect the files to ingest, sorted by path.
pub fn scan_paths(paths: &[PathBuf], include: &[String]) -> Result<Vec<PathBuf>> {
    let include_set = if include.is_empty() {
        None
    } else {
        Some(build_globset(include)?)
    };
    let exclude_set = build_globset(DEFAULT_EXCLUDES)?;

    let mut files = Vec::new();
    for root in paths {
        if !root.exists() {
            bail!("Path does not exist: {}", root.display());
        }
        if root.is_file() {
            files.push(root.clone());
            continue;
        }

        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) {
                continue;
            }
            if let Some(set) = &include_set {
                if !set.is_match(&rel_str) {
                    continue;
                }
            }
            if MediaType::from_path(path).is_err() {
                continue;
            }
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

/// Stable document id for a file: a v5 UUID of its canonical path.
pub fn document_id_for_path(path: &Path) -> Result<String> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    let url = format!("file://{}", canonical.display());
    Ok(Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes()).to_string())
}

fn build_globset<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern.as_ref())?);
    }
    Ok(builder.build()?)
}

async fn build_request(path: &Path, args: &IngestArgs) -> Result<UploadRequest> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let id = match &args.id {
        Some(id) => id.clone(),
        None => document_id_for_path(path)?,
    };
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let media_type = match &args.media_type {
        Some(m) => m.clone(),
        None => MediaType::from_path(path)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|_| "application/octet-stream".to_string()),
    };

    let mut req = UploadRequest::new(&id, &filename, bytes, &media_type);
    req.tags.insert(
        "source_path".to_string(),
        path.display().to_string().into(),
    );
    for (k, v) in &args.tags {
        req = req.with_tag(k, v);
    }
    Ok(req)
}

/// CLI entry point: ingest and print one line per document.
pub async fn run_ingest(ctx: &RagContext, args: &IngestArgs) -> Result<()> {
    if !ctx.config().embedding.is_enabled() {
        bail!("Ingestion requires an embedding provider. Set [embedding] provider in config.");
    }

    let files = scan_paths(&args.paths, &args.include)?;
    if files.is_empty() {
        bail!("No supported files found.");
    }
    if args.id.is_some() && files.len() != 1 {
        bail!("--id can only be used when ingesting a single file");
    }

    let mut requests = Vec::with_capacity(files.len());
    for path in &files {
        requests.push(build_request(path, args).await?);
    }

    let outcomes = ctx.ingest_batch(requests).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
        return Ok(());
    }

    for (path, outcome) in files.iter().zip(&outcomes) {
        print_outcome(path, outcome);
    }
    let indexed = outcomes.iter().filter(|o| o.is_indexed()).count();
    let chunks: usize = outcomes.iter().map(|o| o.chunk_count).sum();
    println!();
    println!(
        "ingested {} / {} documents ({} chunks)",
        indexed,
        outcomes.len(),
        chunks
    );
    Ok(())
}

fn print_outcome(path: &Path, outcome: &IngestOutcome) {
    if outcome.is_indexed() {
        println!(
            "indexed  {}  {}  ({} chunks{})",
            outcome.document_id,
            path.display(),
            outcome.chunk_count,
            if outcome.truncated { ", truncated" } else { "" }
        );
    } else {
        println!(
            "failed   {}  {}  {}: {}",
            outcome.document_id,
            path.display(),
            outcome
                .error_kind
                .map(|k| k.as_str())
                .unwrap_or("unknown"),
            outcome.error.as_deref().unwrap_or("")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, rel: &str) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "content").unwrap();
        path
    }

    #[test]
    fn scan_picks_supported_files_only() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.txt");
        touch(tmp.path(), "specs/b.pdf");
        touch(tmp.path(), "specs/c.exe");
        touch(tmp.path(), ".git/objects/d.txt");

        let files = scan_paths(&[tmp.path().to_path_buf()], &[]).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.pdf"]);
    }

    #[test]
    fn scan_applies_include_globs() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.txt");
        touch(tmp.path(), "specs/b.pdf");

        let files = scan_paths(&[tmp.path().to_path_buf()], &["specs/**".to_string()]).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("specs/b.pdf"));
    }

    #[test]
    fn explicit_files_are_always_attempted() {
        let tmp = TempDir::new().unwrap();
        let odd = touch(tmp.path(), "notes.weird");
        let files = scan_paths(&[odd.clone()], &[]).unwrap();
        assert_eq!(files, vec![odd]);
    }

    #[test]
    fn missing_path_is_an_error() {
        assert!(scan_paths(&[PathBuf::from("/definitely/not/here")], &[]).is_err());
    }

    #[test]
    fn document_id_is_stable_per_path() {
        let tmp = TempDir::new().unwrap();
        let a = touch(tmp.path(), "a.txt");
        let b = touch(tmp.path(), "b.txt");
        let id_a = document_id_for_path(&a).unwrap();
        assert_eq!(id_a, document_id_for_path(&a).unwrap());
        assert_ne!(id_a, document_id_for_path(&b).unwrap());
    }
}
