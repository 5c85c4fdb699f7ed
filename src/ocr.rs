//! OCR through the `tesseract` and `pdftoppm` command-line tools.
//!
//! Both tools run as child processes with a timeout; a timed-out child is
//! killed when its future is dropped. Inputs and intermediate images live in
//! a per-call temporary directory.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::config::OcrConfig;
use crate::extract::ExtractError;

/// Runs OCR on images and on single rendered PDF pages.
#[derive(Debug, Clone)]
pub struct OcrEngine {
    config: OcrConfig,
}

impl OcrEngine {
    pub fn new(config: OcrConfig) -> Self {
        Self { config }
    }

    /// An engine that refuses every request.
    pub fn disabled() -> Self {
        Self {
            config: OcrConfig {
                enabled: false,
                ..OcrConfig::default()
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Recognize text in an encoded image (PNG, JPEG, TIFF, ...).
    pub async fn ocr_image(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        if !self.is_enabled() {
            return Err(ExtractError::Ocr("OCR is disabled".into()));
        }
        let dir = tempfile::tempdir().map_err(|e| ExtractError::Ocr(e.to_string()))?;
        let input = dir.path().join("input.img");
        tokio::fs::write(&input, bytes)
            .await
            .map_err(|e| ExtractError::Ocr(e.to_string()))?;
        self.tesseract(&input).await
    }

    /// Render page `page` (1-based) of a PDF and recognize its text.
    pub async fn ocr_pdf_page(&self, pdf: &[u8], page: usize) -> Result<String, ExtractError> {
        if !self.is_enabled() {
            return Err(ExtractError::Ocr("OCR is disabled".into()));
        }
        let dir = tempfile::tempdir().map_err(|e| ExtractError::Ocr(e.to_string()))?;
        let input = dir.path().join("input.pdf");
        tokio::fs::write(&input, pdf)
            .await
            .map_err(|e| ExtractError::Ocr(e.to_string()))?;

        let out_base = dir.path().join("page");
        let page_arg = page.to_string();
        let args: Vec<OsString> = vec![
            "-f".into(),
            page_arg.clone().into(),
            "-l".into(),
            page_arg.into(),
            "-r".into(),
            self.config.dpi.to_string().into(),
            "-png".into(),
            "-singlefile".into(),
            input.into_os_string(),
            out_base.clone().into_os_string(),
        ];
        self.run(&self.config.pdftoppm_path, &args).await?;

        let image = out_base.with_extension("png");
        if !image.exists() {
            return Err(ExtractError::Ocr(format!(
                "pdftoppm produced no image for page {}",
                page
            )));
        }
        self.tesseract(&image).await
    }

    async fn tesseract(&self, image: &Path) -> Result<String, ExtractError> {
        let args: Vec<OsString> = vec![
            image.as_os_str().to_os_string(),
            "stdout".into(),
            "-l".into(),
            self.config.language.clone().into(),
        ];
        let stdout = self.run(&self.config.tesseract_path, &args).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    async fn run(&self, program: &Path, args: &[OsString]) -> Result<Vec<u8>, ExtractError> {
        debug!(program = %program.display(), "running OCR tool");
        let timeout = self.timeout();

        let result = tokio::time::timeout(timeout, async {
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| {
                    ExtractError::Ocr(format!("failed to run {}: {}", program.display(), e))
                })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(ExtractError::Ocr(format!(
                    "{} failed ({}): {}",
                    program.display(),
                    output.status,
                    stderr.trim()
                )));
            }
            Ok(output.stdout)
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ExtractError::Timeout(timeout.as_secs())),
        }
    }
}
