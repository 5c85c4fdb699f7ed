//! Multi-format text extraction.
//!
//! Callers supply raw bytes plus a declared media type; this module returns
//! plain UTF-8 text. Normalization happens later, in the chunker.
//!
//! | Media type | Strategy |
//! |------------|----------|
//! | text | declared charset, else BOM sniff, UTF-8, Latin-1 fallback |
//! | pdf | per-page text layer; empty pages are rendered and OCR'd |
//! | docx | paragraphs and table rows from `word/document.xml` |
//! | csv | header preamble, then one `header: value` line per row |
//! | image | OCR |
//!
//! Extraction never panics on bad input: corrupt bytes come back as an
//! [`ExtractError`] and the pipeline marks that document failed.

use std::io::Read;
use std::sync::Arc;

use docrag_core::models::MediaType;
use docrag_core::RagError;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::ocr::OcrEngine;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Separator between PDF pages.
const PAGE_SEPARATOR: &str = "\n\n";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("text decoding failed: {0}")]
    Text(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Ooxml(String),
    #[error("CSV extraction failed: {0}")]
    Csv(String),
    #[error("image extraction failed: {0}")]
    Image(String),
    #[error("OCR failed: {0}")]
    Ocr(String),
    #[error("OCR timed out after {0}s")]
    Timeout(u64),
    #[error("extraction pool closed")]
    PoolClosed,
}

impl From<ExtractError> for RagError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::UnsupportedMediaType(m) => RagError::UnsupportedMediaType(m),
            other => RagError::Extraction(other.to_string()),
        }
    }
}

/// One of the extractor's worker slots.
///
/// Blocking parsers hold a clone until they return, so a parse that outlives
/// its caller (timeout, cancellation) still counts against the pool.
pub type ExtractSlot = Arc<OwnedSemaphorePermit>;

/// Turns document bytes into plain text, at most `concurrency` documents at
/// a time.
#[derive(Debug, Clone)]
pub struct Extractor {
    ocr: OcrEngine,
    slots: Arc<Semaphore>,
}

impl Extractor {
    pub fn new(ocr: OcrEngine, concurrency: usize) -> Self {
        Self {
            ocr,
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Wait for a free worker slot.
    pub async fn reserve(&self) -> Result<ExtractSlot, ExtractError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExtractError::PoolClosed)?;
        Ok(Arc::new(permit))
    }

    /// Extract text from `bytes` declared as `declared` (a MIME type such as
    /// `text/plain; charset=utf-16le`, or a short name such as `pdf`).
    pub async fn extract(
        &self,
        slot: &ExtractSlot,
        bytes: &[u8],
        declared: &str,
    ) -> Result<String, ExtractError> {
        let media_type: MediaType = declared
            .parse()
            .map_err(|_| ExtractError::UnsupportedMediaType(declared.to_string()))?;
        let charset = charset_param(declared);

        debug!(media_type = %media_type, bytes = bytes.len(), "extracting");
        match media_type {
            MediaType::Text => decode_text(bytes, charset.as_deref()),
            MediaType::Pdf => self.extract_pdf(slot, bytes).await,
            MediaType::Docx => {
                let data = bytes.to_vec();
                blocking(slot, move || extract_docx(&data), ExtractError::Ooxml).await
            }
            MediaType::Csv => {
                let text = decode_text(bytes, charset.as_deref())?;
                blocking(slot, move || extract_csv(&text), ExtractError::Csv).await
            }
            MediaType::Image => self.extract_image(bytes).await,
        }
    }

    async fn extract_pdf(&self, slot: &ExtractSlot, bytes: &[u8]) -> Result<String, ExtractError> {
        let data = bytes.to_vec();
        let pages = blocking(
            slot,
            move || {
                pdf_extract::extract_text_from_mem_by_pages(&data)
                    .map_err(|e| ExtractError::Pdf(e.to_string()))
            },
            ExtractError::Pdf,
        )
        .await?;

        let mut texts = Vec::with_capacity(pages.len());
        for (i, page) in pages.into_iter().enumerate() {
            if !page.trim().is_empty() {
                texts.push(page.trim().to_string());
                continue;
            }
            if !self.ocr.is_enabled() {
                warn!(page = i + 1, "PDF page has no text layer and OCR is disabled");
                continue;
            }
            warn!(page = i + 1, "PDF page has no text layer; falling back to OCR");
            let ocr_text = self.ocr.ocr_pdf_page(bytes, i + 1).await?;
            if !ocr_text.trim().is_empty() {
                texts.push(ocr_text.trim().to_string());
            }
        }
        Ok(texts.join(PAGE_SEPARATOR))
    }

    async fn extract_image(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let format = image::guess_format(bytes)
            .map_err(|e| ExtractError::Image(format!("unrecognized image data: {}", e)))?;
        debug!(format = ?format, "running OCR on image");
        self.ocr.ocr_image(bytes).await
    }
}

/// Run a CPU-bound extraction on the blocking pool, holding `slot` until the
/// parser returns. A panic inside a parser becomes an error of the matching
/// kind.
async fn blocking<T, F>(
    slot: &ExtractSlot,
    f: F,
    on_panic: fn(String) -> ExtractError,
) -> Result<T, ExtractError>
where
    F: FnOnce() -> Result<T, ExtractError> + Send + 'static,
    T: Send + 'static,
{
    let slot = Arc::clone(slot);
    tokio::task::spawn_blocking(move || {
        let _slot = slot;
        f()
    })
        .await
        .map_err(|e| on_panic(format!("parser aborted: {}", e)))?
}

/// The `charset` parameter of a declared MIME type, lower-cased.
fn charset_param(declared: &str) -> Option<String> {
    declared.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        } else {
            None
        }
    })
}

/// Decode plain text bytes.
///
/// A declared charset wins; otherwise a byte-order mark decides; otherwise
/// strict UTF-8 with a Latin-1 fallback (which cannot fail).
pub fn decode_text(bytes: &[u8], charset: Option<&str>) -> Result<String, ExtractError> {
    match charset {
        Some("utf-8") | Some("utf8") => {
            let body = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
            String::from_utf8(body.to_vec())
                .map_err(|e| ExtractError::Text(format!("invalid UTF-8: {}", e)))
        }
        Some("utf-16le") => decode_utf16(strip_bom(bytes, &[0xFF, 0xFE]), u16::from_le_bytes),
        Some("utf-16be") => decode_utf16(strip_bom(bytes, &[0xFE, 0xFF]), u16::from_be_bytes),
        Some("utf-16") => {
            if bytes.starts_with(&[0xFE, 0xFF]) {
                decode_utf16(&bytes[2..], u16::from_be_bytes)
            } else {
                decode_utf16(strip_bom(bytes, &[0xFF, 0xFE]), u16::from_le_bytes)
            }
        }
        Some("iso-8859-1") | Some("latin1") | Some("latin-1") | Some("us-ascii")
        | Some("ascii") | Some("windows-1252") | Some("cp1252") => Ok(decode_latin1(bytes)),
        Some(other) => Err(ExtractError::Text(format!("unsupported charset: {}", other))),
        None => Ok(sniff_and_decode(bytes)),
    }
}

fn sniff_and_decode(bytes: &[u8]) -> String {
    if let Some(body) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(body).into_owned();
    }
    if let Some(body) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        if let Ok(s) = decode_utf16(body, u16::from_le_bytes) {
            return s;
        }
    }
    if let Some(body) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        if let Ok(s) = decode_utf16(body, u16::from_be_bytes) {
            return s;
        }
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => decode_latin1(bytes),
    }
}

fn strip_bom<'a>(bytes: &'a [u8], bom: &[u8]) -> &'a [u8] {
    bytes.strip_prefix(bom).unwrap_or(bytes)
}

fn decode_utf16(bytes: &[u8], from_bytes: fn([u8; 2]) -> u16) -> Result<String, ExtractError> {
    if bytes.len() % 2 != 0 {
        return Err(ExtractError::Text("odd byte length for UTF-16".into()));
    }
    let units = bytes.chunks_exact(2).map(|c| from_bytes([c[0], c[1]]));
    Ok(char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Ooxml("word/document.xml not found".to_string()))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    extract_docx_body(&doc_xml)
}

/// Walk `word/document.xml` in document order. Paragraphs become lines;
/// table cells are joined with ` | ` and each row becomes one line.
fn extract_docx_body(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut in_t = false;
    let mut cell_depth = 0usize;
    let mut cell = String::new();
    let mut row: Vec<String> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_t = true,
                b"tc" => cell_depth += 1,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                let target = if cell_depth > 0 { &mut cell } else { &mut out };
                match e.local_name().as_ref() {
                    b"tab" => target.push(' '),
                    b"br" | b"cr" => target.push('\n'),
                    _ => {}
                }
            }
            Ok(Event::Text(te)) if in_t => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                if cell_depth > 0 {
                    cell.push_str(&text);
                } else {
                    out.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    if cell_depth > 0 {
                        cell.push(' ');
                    } else {
                        out.push('\n');
                    }
                }
                b"tc" => {
                    cell_depth = cell_depth.saturating_sub(1);
                    if cell_depth == 0 {
                        row.push(cell.trim().to_string());
                        cell.clear();
                    }
                }
                b"tr" if cell_depth == 0 => {
                    if row.iter().any(|c| !c.is_empty()) {
                        out.push_str(&row.join(" | "));
                        out.push('\n');
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Flatten CSV rows into lines. The header row is emitted once as a
/// preamble and prefixed to every value.
fn extract_csv(text: &str) -> Result<String, ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ExtractError::Csv(e.to_string()))?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let h = h.trim();
            if h.is_empty() {
                format!("column {}", i + 1)
            } else {
                h.to_string()
            }
        })
        .collect();

    let mut out = String::new();
    if !headers.is_empty() {
        out.push_str("Columns: ");
        out.push_str(&headers.join(", "));
        out.push('\n');
    }

    for record in reader.records() {
        let record = record.map_err(|e| ExtractError::Csv(e.to_string()))?;
        let fields: Vec<String> = record
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(i, v)| {
                let name = headers
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("column {}", i + 1));
                format!("{}: {}", name, v.trim())
            })
            .collect();
        if fields.is_empty() {
            continue;
        }
        out.push_str(&fields.join(" | "));
        out.push('\n');
    }
    Ok(out)
}
