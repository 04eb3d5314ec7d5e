use std::path::PathBuf;

use async_trait::async_trait;
use tokio::{fs, process::Command};
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::PipelineError,
    pipeline::{
        extract::TextExtractor,
        types::{DocumentChunk, ExtractionMethod},
    },
};

/// Local OCR on a rasterized page: `pdftoppm` renders the page, `tesseract`
/// reads it. Both run as subprocesses; a missing binary surfaces as an
/// extraction error and the chain moves on.
pub struct LocalOcrExtractor {
    render_dpi: u32,
}

impl LocalOcrExtractor {
    pub fn new() -> Self {
        Self { render_dpi: 200 }
    }
}

impl Default for LocalOcrExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextExtractor for LocalOcrExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::LocalOcr
    }

    async fn extract_page(
        &self,
        chunk: &DocumentChunk,
        page: u32,
    ) -> Result<String, PipelineError> {
        let scratch = scratch_prefix();
        let pdf_path = scratch.with_extension("pdf");

        fs::write(&pdf_path, chunk.raw.as_slice())
            .await
            .map_err(|err| PipelineError::Extraction(format!("ocr scratch write: {err}")))?;

        let result = self.rasterize_and_read(&pdf_path, &scratch, page).await;

        // Best-effort scratch cleanup.
        let _ = fs::remove_file(&pdf_path).await;
        let _ = fs::remove_file(rendered_page_path(&scratch, page)).await;

        result
    }
}

impl LocalOcrExtractor {
    async fn rasterize_and_read(
        &self,
        pdf_path: &PathBuf,
        scratch: &PathBuf,
        page: u32,
    ) -> Result<String, PipelineError> {
        let page_arg = page.to_string();
        let render = Command::new("pdftoppm")
            .args([
                "-f",
                &page_arg,
                "-l",
                &page_arg,
                "-r",
                &self.render_dpi.to_string(),
                "-png",
            ])
            .arg(pdf_path)
            .arg(scratch)
            .output()
            .await
            .map_err(|err| PipelineError::Extraction(format!("pdftoppm spawn: {err}")))?;

        if !render.status.success() {
            return Err(PipelineError::Extraction(format!(
                "pdftoppm failed: {}",
                String::from_utf8_lossy(&render.stderr).trim()
            )));
        }

        let image_path = rendered_page_path(scratch, page);
        debug!(page, image = %image_path.display(), "running local ocr");

        let ocr = Command::new("tesseract")
            .arg(&image_path)
            .arg("stdout")
            .output()
            .await
            .map_err(|err| PipelineError::Extraction(format!("tesseract spawn: {err}")))?;

        if !ocr.status.success() {
            return Err(PipelineError::Extraction(format!(
                "tesseract failed: {}",
                String::from_utf8_lossy(&ocr.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&ocr.stdout).into_owned())
    }
}

fn scratch_prefix() -> PathBuf {
    std::env::temp_dir().join(format!("report-ocr-{}", Uuid::new_v4()))
}

/// pdftoppm names output `<prefix>-<page>.png`, left-padding the page number
/// to the width of the document's last page; a single-page render keeps the
/// plain number.
fn rendered_page_path(scratch: &PathBuf, page: u32) -> PathBuf {
    PathBuf::from(format!("{}-{}.png", scratch.display(), page))
}
