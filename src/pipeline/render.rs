//! PDF rasterisation: split a PDF into one PNG per page with an external tool.
//!
//! The default tool is poppler's `pdftoppm`, invoked as
//! `pdftoppm -r <dpi> -png <input.pdf> <dir>/page`. It writes `page-1.png`,
//! `page-2.png`, … and zero-pads the number for longer documents
//! (`page-01.png`). Pages are collected from 1 upwards until one is missing.
//!
//! Everything lives in a [`tempfile::TempDir`] owned by [`RasterizedPdf`].
//! Each page is handed out as a [`PageImage`] guard that deletes its file on
//! drop, and the directory itself goes when the `RasterizedPdf` is dropped,
//! whether processing succeeded or failed.

use crate::config::PipelineConfig;
use crate::error::ScanError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

const PAGE_PREFIX: &str = "page";

/// Anything that can split a PDF into page images.
#[async_trait]
pub trait PdfRasterizer: Send + Sync {
    async fn rasterize(&self, pdf: &[u8]) -> Result<RasterizedPdf, ScanError>;
}

/// Runs an external command-line rasteriser.
#[derive(Debug, Clone)]
pub struct CommandRasterizer {
    program: String,
    dpi: u32,
}

impl CommandRasterizer {
    pub fn new(program: impl Into<String>, dpi: u32) -> Self {
        Self {
            program: program.into(),
            dpi,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.rasterizer_program.clone(), config.dpi)
    }
}

#[async_trait]
impl PdfRasterizer for CommandRasterizer {
    async fn rasterize(&self, pdf: &[u8]) -> Result<RasterizedPdf, ScanError> {
        let dir = tempfile::Builder::new()
            .prefix("scan2table-")
            .tempdir()
            .map_err(|e| ScanError::io("Cannot create temporary page directory", e))?;

        let input = dir.path().join("input.pdf");
        tokio::fs::write(&input, pdf)
            .await
            .map_err(|e| ScanError::io("Cannot write temporary PDF", e))?;

        let output = Command::new(&self.program)
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-png")
            .arg(&input)
            .arg(dir.path().join(PAGE_PREFIX))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ScanError::Rasterizer {
                detail: format!("failed to run '{}': {e}", self.program),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScanError::Rasterizer {
                detail: format!(
                    "'{}' exited with {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                ),
            });
        }

        if let Err(e) = tokio::fs::remove_file(&input).await {
            debug!("Could not remove temporary PDF: {}", e);
        }

        let paths = collect_page_files(dir.path(), PAGE_PREFIX)
            .await
            .map_err(|e| ScanError::io("Cannot list rasterised pages", e))?;
        if paths.is_empty() {
            return Err(ScanError::Rasterizer {
                detail: format!("'{}' produced no page images", self.program),
            });
        }

        info!("PDF rasterised: {} pages at {} DPI", paths.len(), self.dpi);
        Ok(RasterizedPdf::new(dir, paths))
    }
}

/// Collect `<prefix>-N.png` files for N = 1, 2, … until one is missing.
///
/// Zero-padded numbers (`page-001.png`) count as the same page.
pub async fn collect_page_files(dir: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    let stem_prefix = format!("{prefix}-");
    let mut by_number: BTreeMap<usize, PathBuf> = BTreeMap::new();

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(number) = name
            .strip_prefix(&stem_prefix)
            .and_then(|rest| rest.strip_suffix(".png"))
            .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        by_number.insert(number, entry.path());
    }

    let mut pages = Vec::with_capacity(by_number.len());
    for n in 1.. {
        match by_number.remove(&n) {
            Some(path) => pages.push(path),
            None => break,
        }
    }
    if !by_number.is_empty() {
        warn!(
            "Ignoring {} page image(s) after a gap in numbering",
            by_number.len()
        );
    }
    Ok(pages)
}

/// The page images of one PDF, backed by a temporary directory.
#[derive(Debug)]
pub struct RasterizedPdf {
    pages: Vec<PageImage>,
    // Declared last so page guards drop before the directory.
    _dir: Option<TempDir>,
}

impl RasterizedPdf {
    pub fn new(dir: TempDir, paths: Vec<PathBuf>) -> Self {
        Self {
            pages: Self::guards(paths),
            _dir: Some(dir),
        }
    }

    /// Page files not backed by a directory this value owns.
    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            pages: Self::guards(paths),
            _dir: None,
        }
    }

    fn guards(paths: Vec<PathBuf>) -> Vec<PageImage> {
        paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| PageImage {
                number: i + 1,
                path,
            })
            .collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Hand out the page guards in page order. Subsequent calls return nothing.
    pub fn take_pages(&mut self) -> Vec<PageImage> {
        std::mem::take(&mut self.pages)
    }
}

/// One rendered page. The file is deleted when the guard is dropped.
#[derive(Debug)]
pub struct PageImage {
    /// 1-indexed page number.
    pub number: usize,
    path: PathBuf,
}

impl PageImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Result<Vec<u8>, ScanError> {
        tokio::fs::read(&self.path).await.map_err(|e| {
            ScanError::io(format!("Cannot read rendered page {}", self.number), e)
        })
    }
}

impl Drop for PageImage {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove page image {}: {}", self.path.display(), e);
            }
        }
    }
}
