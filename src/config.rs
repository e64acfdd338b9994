//! Configuration types for batch OCR processing.
//!
//! Everything the pipeline needs from the outside world (API credentials,
//! endpoints, retry budget, timeout, rasteriser command) travels in one
//! explicit [`PipelineConfig`], built via [`PipelineConfigBuilder`]. The
//! library never reads environment variables itself; the binaries map
//! `GEMINI_API_KEY` and friends onto the builder.

use crate::error::ScanError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default Gemini REST endpoint (model path is appended per call).
pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default Google Cloud Vision REST endpoint.
pub const DEFAULT_VISION_ENDPOINT: &str = "https://vision.googleapis.com/v1";

/// Default generative model.
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Configuration for a batch run.
///
/// # Example
/// ```rust
/// use scan2table::{OcrAuth, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .gemini_api_key("AIza...")
///     .vision_auth(OcrAuth::ApiKey("AIza...".into()))
///     .max_attempts(5)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// API key for the Gemini generative service.
    pub gemini_api_key: Option<String>,

    /// Base URL of the Gemini REST API. Default: [`DEFAULT_GEMINI_ENDPOINT`].
    pub gemini_endpoint: String,

    /// Generative model id. Default: `gemini-1.5-flash`.
    pub model: String,

    /// Sampling temperature sent with every generation request. Default: 0.1.
    ///
    /// Transcription wants the model to copy, not to invent.
    pub temperature: f32,

    /// Credentials for the Vision OCR service.
    pub vision_auth: Option<OcrAuth>,

    /// Base URL of the Vision REST API. Default: [`DEFAULT_VISION_ENDPOINT`].
    pub vision_endpoint: String,

    /// Fixed timeout for every outbound HTTP call, in seconds. Default: 60.
    pub request_timeout_secs: u64,

    /// Total LLM attempts (first call included) on transient failures. Default: 5.
    pub max_attempts: u32,

    /// Initial backoff between LLM attempts in milliseconds. Default: 1000.
    ///
    /// Doubles after each attempt: 1 s → 2 s → 4 s → 8 s.
    pub retry_base_delay_ms: u64,

    /// Program used to split PDFs into page images. Default: `pdftoppm`.
    pub rasterizer_program: String,

    /// Rendering DPI passed to the rasteriser. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// What to do when a single PDF page fails. Default: [`PageFailurePolicy::Abort`].
    pub page_failure_policy: PageFailurePolicy,

    /// Optional per-file progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_endpoint: DEFAULT_GEMINI_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.1,
            vision_auth: None,
            vision_endpoint: DEFAULT_VISION_ENDPOINT.to_string(),
            request_timeout_secs: 60,
            max_attempts: 5,
            retry_base_delay_ms: 1000,
            rasterizer_program: "pdftoppm".to_string(),
            dpi: 150,
            page_failure_policy: PageFailurePolicy::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("gemini_api_key", &self.gemini_api_key.as_ref().map(|_| "<redacted>"))
            .field("gemini_endpoint", &self.gemini_endpoint)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("vision_auth", &self.vision_auth)
            .field("vision_endpoint", &self.vision_endpoint)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_attempts", &self.max_attempts)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("rasterizer_program", &self.rasterizer_program)
            .field("dpi", &self.dpi)
            .field("page_failure_policy", &self.page_failure_policy)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn BatchProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// The fixed outbound request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The first backoff delay; later delays double from here.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn gemini_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.gemini_api_key = Some(key.into());
        self
    }

    pub fn gemini_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.gemini_endpoint = url.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn vision_auth(mut self, auth: OcrAuth) -> Self {
        self.config.vision_auth = Some(auth);
        self
    }

    pub fn vision_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.vision_endpoint = url.into();
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_base_delay_ms = ms;
        self
    }

    pub fn rasterizer_program(mut self, program: impl Into<String>) -> Self {
        self.config.rasterizer_program = program.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn page_failure_policy(mut self, policy: PageFailurePolicy) -> Self {
        self.config.page_failure_policy = policy;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ScanError> {
        let c = &self.config;
        if c.max_attempts == 0 {
            return Err(ScanError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.request_timeout_secs == 0 {
            return Err(ScanError::InvalidConfig(
                "request timeout must be ≥ 1 second".into(),
            ));
        }
        if c.rasterizer_program.trim().is_empty() {
            return Err(ScanError::InvalidConfig(
                "rasterizer program must not be empty".into(),
            ));
        }
        if c.model.trim().is_empty() {
            return Err(ScanError::InvalidConfig("model must not be empty".into()));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Credentials for the Vision OCR service.
#[derive(Clone, PartialEq, Eq)]
pub enum OcrAuth {
    /// Sent as the `key` query parameter.
    ApiKey(String),
    /// Sent as `Authorization: Bearer <token>` (service-account access token).
    BearerToken(String),
}

impl fmt::Debug for OcrAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrAuth::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            OcrAuth::BearerToken(_) => f.write_str("BearerToken(<redacted>)"),
        }
    }
}

/// How each file travels through the OCR and LLM services.
///
/// | Strategy | OCR service | LLM service |
/// |----------|-------------|-------------|
/// | `TwoStep` | extracts raw text | formats the text |
/// | `SingleStep` | - | reads the image and formats in one call |
/// | `Raw` | extracts raw text | - |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// OCR service first, then the LLM formats the extracted text. (default)
    #[default]
    TwoStep,
    /// The LLM reads the image and formats it in a single call.
    SingleStep,
    /// OCR only; the extracted text is returned as-is.
    Raw,
}

impl ExecutionStrategy {
    /// The shape actually produced for a requested shape.
    ///
    /// `Raw` has no structuring step, so a `Table` request falls back to
    /// plain concatenated text: no header row and a `.txt` download.
    pub fn effective_shape(self, requested: OutputShape) -> OutputShape {
        match self {
            ExecutionStrategy::Raw => OutputShape::Document,
            _ => requested,
        }
    }

    /// `true` when the strategy calls the OCR service.
    pub fn uses_ocr(self) -> bool {
        !matches!(self, ExecutionStrategy::SingleStep)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStrategy::TwoStep => "two_step",
            ExecutionStrategy::SingleStep => "single_step",
            ExecutionStrategy::Raw => "raw",
        }
    }
}

impl FromStr for ExecutionStrategy {
    type Err = ScanError;

    /// Accepts the canonical names plus the upload form's option values.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "two_step" | "vision_and_gemini" => Ok(ExecutionStrategy::TwoStep),
            "single_step" | "full_gemini" => Ok(ExecutionStrategy::SingleStep),
            "raw" => Ok(ExecutionStrategy::Raw),
            other => Err(ScanError::Validation(format!(
                "unknown OCR engine '{other}' (expected two_step, single_step or raw)"
            ))),
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the final output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// One tab-separated row per record, with a header row. (default)
    #[default]
    Table,
    /// Cleaned free-form prose.
    Document,
}

impl OutputShape {
    /// Extension of the downloadable file.
    pub fn file_extension(self) -> &'static str {
        match self {
            OutputShape::Table => "csv",
            OutputShape::Document => "txt",
        }
    }

    /// `Content-Type` of the downloadable file.
    pub fn content_type(self) -> &'static str {
        match self {
            OutputShape::Table => "text/csv; charset=utf-8",
            OutputShape::Document => "text/plain; charset=utf-8",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputShape::Table => "table",
            OutputShape::Document => "document",
        }
    }
}

impl FromStr for OutputShape {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table" | "csv" => Ok(OutputShape::Table),
            "document" | "text" | "txt" => Ok(OutputShape::Document),
            other => Err(ScanError::Validation(format!(
                "unknown output format '{other}' (expected table or document)"
            ))),
        }
    }
}

impl fmt::Display for OutputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when one page of a PDF fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageFailurePolicy {
    /// The page failure fails its file, and therefore the whole batch. (default)
    #[default]
    Abort,
    /// Log the failure, omit the page, and continue with the next page.
    Skip,
}

impl FromStr for PageFailurePolicy {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" | "fail" | "fail_fast" => Ok(PageFailurePolicy::Abort),
            "skip" => Ok(PageFailurePolicy::Skip),
            other => Err(ScanError::InvalidConfig(format!(
                "unknown page failure policy '{other}' (expected abort or skip)"
            ))),
        }
    }
}
