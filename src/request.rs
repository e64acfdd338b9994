//! Batch request types and validation.
//!
//! Both outer surfaces (CLI and HTTP server) funnel caller input through this
//! module: raw form strings become a [`BatchRequest`] via
//! [`BatchForm::validate`], and raw bytes become an [`UploadedFile`] via
//! [`UploadedFile::from_bytes`]. Everything here fails with
//! [`ScanError::Validation`] before any external service is touched.

use crate::config::{ExecutionStrategy, OutputShape};
use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Upper bound for a single uploaded file (10 MB).
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

/// Upper bound for a custom document prompt, in whitespace-separated words.
pub const MAX_PROMPT_WORDS: usize = 150;

// ── Uploaded files ───────────────────────────────────────────────────────

/// Raster formats accepted as direct OCR input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    WebP,
    Bmp,
    Tiff,
}

impl ImageKind {
    /// MIME type sent alongside inline image data.
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
            ImageKind::Gif => "image/gif",
            ImageKind::WebP => "image/webp",
            ImageKind::Bmp => "image/bmp",
            ImageKind::Tiff => "image/tiff",
        }
    }

    /// Identify an image from its leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        use image::ImageFormat;
        match image::guess_format(bytes).ok()? {
            ImageFormat::Jpeg => Some(ImageKind::Jpeg),
            ImageFormat::Png => Some(ImageKind::Png),
            ImageFormat::Gif => Some(ImageKind::Gif),
            ImageFormat::WebP => Some(ImageKind::WebP),
            ImageFormat::Bmp => Some(ImageKind::Bmp),
            ImageFormat::Tiff => Some(ImageKind::Tiff),
            _ => None,
        }
    }
}

/// Declared (and verified) media type of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image(ImageKind),
    Pdf,
}

impl MediaType {
    pub fn mime_type(self) -> &'static str {
        match self {
            MediaType::Image(kind) => kind.mime_type(),
            MediaType::Pdf => "application/pdf",
        }
    }

    pub fn is_pdf(self) -> bool {
        matches!(self, MediaType::Pdf)
    }
}

/// One input artifact of a batch.
#[derive(Clone)]
pub struct UploadedFile {
    /// Original client-side file name, used in error messages.
    pub name: String,
    pub media_type: MediaType,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for UploadedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadedFile")
            .field("name", &self.name)
            .field("media_type", &self.media_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl UploadedFile {
    /// Validate raw upload bytes.
    ///
    /// The content decides: a declared `image/*` type must sniff as a known
    /// raster format, and PDFs must start with the `%PDF` magic. Files larger
    /// than [`MAX_FILE_BYTES`] are rejected.
    pub fn from_bytes(
        name: impl Into<String>,
        declared_mime: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<Self, ScanError> {
        let name = name.into();

        if bytes.is_empty() {
            return Err(ScanError::Validation(format!("file '{name}' is empty")));
        }
        if bytes.len() > MAX_FILE_BYTES {
            return Err(ScanError::Validation(format!(
                "file '{name}' exceeds the {} MB limit ({} bytes)",
                MAX_FILE_BYTES / (1024 * 1024),
                bytes.len()
            )));
        }

        let declared = declared_mime.map(|m| m.trim().to_ascii_lowercase());
        let is_pdf_magic = bytes.starts_with(b"%PDF");

        let media_type = match declared.as_deref() {
            Some("application/pdf") if is_pdf_magic => MediaType::Pdf,
            Some("application/pdf") => {
                return Err(ScanError::Validation(format!(
                    "file '{name}' is declared as PDF but is not a valid PDF"
                )));
            }
            _ if is_pdf_magic => MediaType::Pdf,
            _ => match ImageKind::sniff(&bytes) {
                Some(kind) => MediaType::Image(kind),
                None => {
                    return Err(ScanError::Validation(format!(
                        "file '{name}' is not a supported image or PDF (declared type: {})",
                        declared.as_deref().unwrap_or("unknown")
                    )));
                }
            },
        };

        debug!("Accepted upload '{}' as {}", name, media_type.mime_type());
        Ok(Self {
            name,
            media_type,
            bytes,
        })
    }

    /// Read and validate a local file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| ScanError::io(format!("Cannot read '{}'", path.display()), e))?;
        if meta.len() > MAX_FILE_BYTES as u64 {
            return Err(ScanError::Validation(format!(
                "file '{name}' exceeds the {} MB limit ({} bytes)",
                MAX_FILE_BYTES / (1024 * 1024),
                meta.len()
            )));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ScanError::io(format!("Cannot read '{}'", path.display()), e))?;
        Self::from_bytes(name, None, bytes)
    }
}

// ── Columns ──────────────────────────────────────────────────────────────

/// One output column: the header label and the JSON key asked of the LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub label: String,
    pub key: String,
}

impl Column {
    /// A column whose key is derived from its label.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_string();
        Self {
            key: column_key(&label),
            label,
        }
    }
}

/// Lower-case the label and join whitespace runs with `_`.
pub fn column_key(label: &str) -> String {
    label
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Keys and labels that mark a serial-number column.
const SERIAL_NAMES: &[&str] = &[
    "sankhya",
    "kramank",
    "क्रमांक",
    "संख्या",
    "serial",
    "serial_number",
    "serial_no",
    "sr_no",
    "sr._no.",
    "s_no",
    "s.no",
    "s.no.",
    "no",
    "no.",
    "number",
    "#",
];

/// Ordered column list for table output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    columns: Vec<Column>,
}

impl Default for ColumnSpec {
    /// Serial number, book title, author: the catalogue layout the default
    /// table prompt is written for.
    fn default() -> Self {
        Self {
            columns: vec![
                Column {
                    label: "क्रमांक".into(),
                    key: "sankhya".into(),
                },
                Column {
                    label: "ग्रंथ-नाम".into(),
                    key: "granth_naam".into(),
                },
                Column {
                    label: "कर्ता".into(),
                    key: "karta".into(),
                },
            ],
        }
    }
}

impl ColumnSpec {
    /// Parse a comma-separated column list such as `"No, Title, Author"`.
    pub fn parse(list: &str) -> Result<Self, ScanError> {
        let columns: Vec<Column> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Column::from_label)
            .collect();

        if columns.is_empty() {
            return Err(ScanError::Validation(
                "at least one column name is required".into(),
            ));
        }

        for (i, col) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.key == col.key) {
                return Err(ScanError::Validation(format!(
                    "duplicate column '{}'",
                    col.label
                )));
            }
        }

        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// `true` for the built-in catalogue triple.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Header row: labels joined by tabs.
    pub fn header(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.label.as_str())
            .collect::<Vec<_>>()
            .join("\t")
    }

    /// Index of the single serial-number column.
    ///
    /// The first column whose key or label is a well-known serial-number
    /// name; the first column when none is named that way.
    pub fn serial_index(&self) -> Option<usize> {
        self.columns
            .iter()
            .position(|col| {
                let label = col.label.to_lowercase();
                SERIAL_NAMES.iter().any(|n| *n == col.key || *n == label)
            })
            .or_else(|| (!self.columns.is_empty()).then_some(0))
    }

    /// Whether the column at `index` holds serial numbers.
    pub fn is_serial(&self, index: usize) -> bool {
        self.serial_index() == Some(index)
    }
}

// ── Form ─────────────────────────────────────────────────────────────────

/// Whether the caller supplies their own prompt or column list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    #[default]
    Default,
    Custom,
}

/// Unvalidated request fields, named like the upload form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchForm {
    /// `two_step` / `single_step` / `raw` (or `vision_and_gemini` / `full_gemini`).
    pub ocr_engine: Option<String>,
    /// `table` / `document`.
    pub output_format: Option<String>,
    /// `default` / `custom`.
    pub prompt_type: Option<String>,
    /// Replacement document instruction, at most 150 words.
    pub custom_prompt: Option<String>,
    /// Comma-separated column names for the table shape.
    pub columns: Option<String>,
}

/// A validated batch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub strategy: ExecutionStrategy,
    pub shape: OutputShape,
    pub columns: ColumnSpec,
    /// Replacement for the default document instruction.
    pub prompt: Option<String>,
}

impl Default for BatchRequest {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::default(),
            shape: OutputShape::default(),
            columns: ColumnSpec::default(),
            prompt: None,
        }
    }
}

impl BatchRequest {
    pub fn new(strategy: ExecutionStrategy, shape: OutputShape) -> Self {
        Self {
            strategy,
            shape,
            ..Self::default()
        }
    }

    pub fn with_columns(mut self, columns: ColumnSpec) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// The shape the batch will actually produce.
    pub fn effective_shape(&self) -> OutputShape {
        self.strategy.effective_shape(self.shape)
    }
}

fn non_blank(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl BatchForm {
    /// Validate every field and build a [`BatchRequest`].
    ///
    /// Missing engine/format fields fall back to `two_step` / `table`.
    /// `custom_prompt` and `columns` are only read (and then required) when
    /// `prompt_type=custom` is combined with the matching shape.
    pub fn validate(&self) -> Result<BatchRequest, ScanError> {
        let strategy = match non_blank(&self.ocr_engine) {
            Some(s) => s.parse()?,
            None => ExecutionStrategy::default(),
        };
        let shape = match non_blank(&self.output_format) {
            Some(s) => s.parse()?,
            None => OutputShape::default(),
        };
        let mode = match non_blank(&self.prompt_type).map(str::to_ascii_lowercase).as_deref() {
            None | Some("default") => PromptMode::Default,
            Some("custom") => PromptMode::Custom,
            Some(other) => {
                return Err(ScanError::Validation(format!(
                    "unknown prompt type '{other}' (expected default or custom)"
                )));
            }
        };

        let mut request = BatchRequest::new(strategy, shape);

        if mode == PromptMode::Custom {
            match shape {
                OutputShape::Document => {
                    let prompt = non_blank(&self.custom_prompt).ok_or_else(|| {
                        ScanError::Validation(
                            "custom_prompt is required when prompt_type is custom".into(),
                        )
                    })?;
                    let words = prompt.split_whitespace().count();
                    if words > MAX_PROMPT_WORDS {
                        return Err(ScanError::Validation(format!(
                            "custom_prompt has {words} words (maximum {MAX_PROMPT_WORDS})"
                        )));
                    }
                    request.prompt = Some(prompt.to_string());
                }
                OutputShape::Table => {
                    let list = non_blank(&self.columns).ok_or_else(|| {
                        ScanError::Validation(
                            "columns are required when prompt_type is custom".into(),
                        )
                    })?;
                    request.columns = ColumnSpec::parse(list)?;
                }
            }
        }

        Ok(request)
    }
}
