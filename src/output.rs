//! Batch results and the output writer.

use crate::config::{ExecutionStrategy, OutputShape};
use crate::error::{PageError, ScanError};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Base name of the downloadable file (`ocr_results.csv` / `ocr_results.txt`).
pub const DEFAULT_OUTPUT_STEM: &str = "ocr_results";

/// The complete result of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutput {
    /// The combined text: header row (table shape) plus one block per file or page.
    pub text: String,
    /// The shape actually produced, after the raw-strategy fallback.
    pub shape: OutputShape,
    pub strategy: ExecutionStrategy,
    /// `csv` or `txt`.
    pub file_extension: String,
    /// One report per input file, in input order.
    pub files: Vec<FileReport>,
    pub stats: BatchStats,
}

impl BatchOutput {
    /// `{stem}.{file_extension}`.
    pub fn file_name(&self, stem: &str) -> String {
        format!("{stem}.{}", self.file_extension)
    }

    /// `ocr_results.csv` or `ocr_results.txt`.
    pub fn default_file_name(&self) -> String {
        self.file_name(DEFAULT_OUTPUT_STEM)
    }

    pub fn content_type(&self) -> &'static str {
        self.shape.content_type()
    }
}

/// What happened to one input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub name: String,
    /// Pages processed: 1 for an image, the page count for a PDF.
    pub pages: usize,
    /// Pages omitted under the skip policy.
    pub skipped_pages: Vec<PageError>,
    /// Characters this file contributed to the output.
    pub chars: usize,
}

/// Aggregate statistics for a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total_files: usize,
    pub total_pages: usize,
    pub skipped_pages: usize,
    /// Calls to the OCR service.
    pub ocr_calls: usize,
    /// Formatter operations (retries not counted).
    pub llm_calls: usize,
    pub output_chars: usize,
    pub total_duration_ms: u64,
}

/// Write `text` to `path` atomically.
///
/// The text goes to `<path>.tmp` first and is then renamed into place, so a
/// reader never sees a partial file. Missing parent directories are created.
pub async fn write_output(text: &str, path: &Path) -> Result<(), ScanError> {
    let fail = |source: std::io::Error| ScanError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }

    let tmp_path = tmp_path_for(path);
    tokio::fs::write(&tmp_path, text).await.map_err(fail)?;

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(fail(e));
    }

    debug!("Wrote {} bytes to {}", text.len(), path.display());
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
