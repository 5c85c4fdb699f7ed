//! TOML configuration.
//!
//! Only `[db]` is required; every other section falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/docrag.sqlite"
//!
//! [chunking]
//! chunk_size = 1000
//! overlap = 200
//!
//! [embedding]
//! provider = "hash"
//! dims = 384
//!
//! [retrieval]
//! top_k = 5
//! min_score = 0.2
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use docrag_core::chunk::ChunkParams;
use docrag_core::embedding::HashProvider;
use docrag_core::retrieve::RetrievalParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_boundary_min_fraction")]
    pub boundary_min_fraction: f64,
    #[serde(default = "default_max_chunks")]
    pub max_chunks_per_document: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            boundary_min_fraction: default_boundary_min_fraction(),
            max_chunks_per_document: default_max_chunks(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            boundary_min_fraction: self.boundary_min_fraction,
            max_chunks: self.max_chunks_per_document,
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}
fn default_boundary_min_fraction() -> f64 {
    0.5
}
fn default_max_chunks() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_multiplier: default_candidate_multiplier(),
            max_context_chars: default_max_context_chars(),
            min_score: default_min_score(),
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            top_k: self.top_k,
            candidate_multiplier: self.candidate_multiplier,
            max_context_chars: self.max_context_chars,
            min_score: self.min_score,
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_candidate_multiplier() -> usize {
    4
}
fn default_max_context_chars() -> usize {
    4000
}
fn default_min_score() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub max_input_chars: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
            max_input_chars: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Whether the provider needs explicit `model` and `dims`.
    pub fn is_remote(&self) -> bool {
        matches!(self.provider.as_str(), "openai" | "ollama")
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_extract_concurrency")]
    pub extract_concurrency: usize,
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
    #[serde(default = "default_document_concurrency")]
    pub document_concurrency: usize,
    #[serde(default = "default_extract_timeout_secs")]
    pub extract_timeout_secs: u64,
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            extract_concurrency: default_extract_concurrency(),
            embed_concurrency: default_embed_concurrency(),
            document_concurrency: default_document_concurrency(),
            extract_timeout_secs: default_extract_timeout_secs(),
            embed_timeout_secs: default_embed_timeout_secs(),
            max_document_bytes: default_max_document_bytes(),
        }
    }
}

fn default_extract_concurrency() -> usize {
    4
}
fn default_embed_concurrency() -> usize {
    2
}
fn default_document_concurrency() -> usize {
    4
}
fn default_extract_timeout_secs() -> u64 {
    120
}
fn default_embed_timeout_secs() -> u64 {
    300
}
fn default_max_document_bytes() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tesseract_path")]
    pub tesseract_path: PathBuf,
    #[serde(default = "default_pdftoppm_path")]
    pub pdftoppm_path: PathBuf,
    #[serde(default = "default_ocr_language")]
    pub language: String,
    #[serde(default = "default_ocr_dpi")]
    pub dpi: u32,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: default_ocr_enabled(),
            tesseract_path: default_tesseract_path(),
            pdftoppm_path: default_pdftoppm_path(),
            language: default_ocr_language(),
            dpi: default_ocr_dpi(),
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

fn default_ocr_enabled() -> bool {
    true
}
fn default_tesseract_path() -> PathBuf {
    PathBuf::from("tesseract")
}
fn default_pdftoppm_path() -> PathBuf {
    PathBuf::from("pdftoppm")
}
fn default_ocr_language() -> String {
    "eng".to_string()
}
fn default_ocr_dpi() -> u32 {
    300
}
fn default_ocr_timeout_secs() -> u64 {
    120
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if !(0.0..1.0).contains(&config.chunking.boundary_min_fraction) {
        bail!("chunking.boundary_min_fraction must be in [0.0, 1.0)");
    }
    if config.chunking.max_chunks_per_document == 0 {
        bail!("chunking.max_chunks_per_document must be > 0");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_multiplier < 1 {
        bail!("retrieval.candidate_multiplier must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        bail!("retrieval.max_context_chars must be > 0");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_score) {
        bail!("retrieval.min_score must be in [-1.0, 1.0]");
    }

    // Validate ingest
    let ingest = &config.ingest;
    if ingest.extract_concurrency == 0
        || ingest.embed_concurrency == 0
        || ingest.document_concurrency == 0
    {
        bail!("ingest concurrency settings must be >= 1");
    }
    if ingest.max_document_bytes == 0 {
        bail!("ingest.max_document_bytes must be > 0");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "local" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, local, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_remote() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    Ok(())
}

impl Config {
    /// Dimensionality the configured provider will produce, if known
    /// without instantiating it.
    pub fn expected_dims(&self) -> Option<usize> {
        match self.embedding.provider.as_str() {
            "hash" => Some(self.embedding.dims.unwrap_or(HashProvider::DEFAULT_DIMS)),
            _ => self.embedding.dims,
        }
    }
}
