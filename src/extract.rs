//! Page-wise text extraction for PDF documents.
//!
//! Extraction is two-tier. The embedded text layer is read first with
//! `pdf-extract`; this is cheap and exact. Only when every page comes back
//! blank (typically a scanned, image-only PDF) does the extractor render
//! the pages to images and run optical character recognition through an
//! [`OcrEngine`]. If both tiers yield nothing the document is rejected with
//! an [`ExtractionError`].
//!
//! The production OCR engine, [`TesseractOcr`], shells out to Poppler's
//! `pdftoppm` and to `tesseract`, so both must be on `PATH` (or configured
//! under `[ocr]`).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::OcrConfig;
use crate::error::ExtractionError;
use crate::models::Page;

/// Renders a PDF to images and recognises the text on each page.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Returns one string per page, in page order. Pages where nothing was
    /// recognised are returned as empty strings.
    async fn recognize(&self, pdf_path: &Path) -> Result<Vec<String>>;
}

/// OCR engine used when `[ocr] enabled = false`.
pub struct DisabledOcr;

#[async_trait]
impl OcrEngine for DisabledOcr {
    async fn recognize(&self, _pdf_path: &Path) -> Result<Vec<String>> {
        bail!("OCR is disabled. Set [ocr] enabled = true and install Tesseract and Poppler.")
    }
}

/// OCR via the `pdftoppm` and `tesseract` command-line tools.
pub struct TesseractOcr {
    pdftoppm: PathBuf,
    tesseract: PathBuf,
    dpi: u32,
}

impl TesseractOcr {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            pdftoppm: config.pdftoppm.clone(),
            tesseract: config.tesseract.clone(),
            dpi: config.dpi,
        }
    }

    async fn render_pages(&self, pdf_path: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let prefix = out_dir.join("page");
        let output = Command::new(&self.pdftoppm)
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-png")
            .arg(pdf_path)
            .arg(&prefix)
            .output()
            .await
            .with_context(|| {
                format!(
                    "failed to run {} (is Poppler installed?)",
                    self.pdftoppm.display()
                )
            })?;

        if !output.status.success() {
            bail!(
                "pdftoppm failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        // pdftoppm zero-pads page numbers, so lexical order is page order
        let mut images: Vec<PathBuf> = std::fs::read_dir(out_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "png").unwrap_or(false))
            .collect();
        images.sort();
        Ok(images)
    }

    async fn recognize_image(&self, image: &Path) -> Result<String> {
        let output = Command::new(&self.tesseract)
            .arg(image)
            .arg("stdout")
            .output()
            .await
            .with_context(|| {
                format!(
                    "failed to run {} (is Tesseract installed?)",
                    self.tesseract.display()
                )
            })?;

        if !output.status.success() {
            bail!(
                "tesseract failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize(&self, pdf_path: &Path) -> Result<Vec<String>> {
        let work_dir = tempfile::tempdir()?;
        let images = self.render_pages(pdf_path, work_dir.path()).await?;
        if images.is_empty() {
            bail!("pdftoppm produced no page images");
        }

        let mut pages = Vec::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            match self.recognize_image(image).await {
                Ok(text) => {
                    debug!(page = i + 1, chars = text.len(), "OCR page recognised");
                    pages.push(text);
                }
                Err(e) => {
                    warn!(page = i + 1, error = %e, "OCR failed for page");
                    pages.push(String::new());
                }
            }
        }
        Ok(pages)
    }
}

/// Build the OCR engine selected by configuration.
pub fn create_ocr(config: &OcrConfig) -> Arc<dyn OcrEngine> {
    if config.enabled {
        Arc::new(TesseractOcr::new(config))
    } else {
        Arc::new(DisabledOcr)
    }
}

/// Turns a source file into non-empty [`Page`]s.
pub struct Extractor {
    ocr: Arc<dyn OcrEngine>,
}

impl Extractor {
    pub fn new(ocr: Arc<dyn OcrEngine>) -> Self {
        Self { ocr }
    }

    /// Extract the text pages of the PDF at `path`.
    pub async fn extract(&self, path: &Path) -> Result<Vec<Page>, ExtractionError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ExtractionError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let pages = non_empty_pages(extract_text_layer(bytes).await);
        if !pages.is_empty() {
            return Ok(pages);
        }

        info!(path = %path.display(), "No text found with regular extraction, attempting OCR");
        let recognised = self
            .ocr
            .recognize(path)
            .await
            .map_err(|e| ExtractionError::OcrFailed(e.to_string()))?;

        let pages = non_empty_pages(recognised);
        if pages.is_empty() {
            return Err(ExtractionError::NoText);
        }
        info!(path = %path.display(), pages = pages.len(), "OCR extracted text");
        Ok(pages)
    }
}

/// Read the embedded text layer, one string per page. Parse failures and
/// parser panics are treated as "no text" so the OCR tier still runs.
async fn extract_text_layer(bytes: Vec<u8>) -> Vec<String> {
    let result =
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem_by_pages(&bytes))
            .await;

    match result {
        Ok(Ok(pages)) => pages,
        Ok(Err(e)) => {
            warn!(error = %e, "PDF text layer extraction failed");
            Vec::new()
        }
        Err(e) => {
            warn!(error = %e, "PDF text layer extraction aborted");
            Vec::new()
        }
    }
}

/// Number pages from 1 and keep only those with visible text.
fn non_empty_pages(texts: Vec<String>) -> Vec<Page> {
    texts
        .into_iter()
        .enumerate()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(i, text)| Page {
            number: i as u32 + 1,
            text,
        })
        .collect()
}
