//! # scan2table
//!
//! Turn batches of scanned pages into spreadsheet-ready tables or cleaned
//! text, using an OCR service and a large language model.
//!
//! ## Why this crate?
//!
//! OCR alone gets the characters right but loses the structure: a scanned
//! library register comes out as one stream of serial numbers, titles and
//! author names with the line breaks in the wrong places. This crate sends the
//! OCR text (or the page image itself) to an LLM with a column layout, decodes
//! the JSON it returns, and assembles one tab-separated file for the whole
//! batch.
//!
//! ## Pipeline Overview
//!
//! ```text
//! files (images / PDFs)
//!  │
//!  ├─ 1. Validate  media type, size, form fields
//!  ├─ 2. Render    PDF → one PNG per page (pdftoppm)
//!  ├─ 3. OCR       Google Vision document text detection
//!  ├─ 4. Format    Gemini, with retry and exponential backoff
//!  ├─ 5. Decode    JSON → TSV rows, numeral normalisation
//!  └─ 6. Output    header row + one block per file/page
//! ```
//!
//! ## Strategies
//!
//! | Strategy | OCR | LLM | Output |
//! |----------|-----|-----|--------|
//! | `two_step` (default) | ✓ | formats OCR text | table or document |
//! | `single_step` | | reads the image | table or document |
//! | `raw` | ✓ | | plain text |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scan2table::{BatchOrchestrator, BatchRequest, OcrAuth, PipelineConfig, UploadedFile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .gemini_api_key(std::env::var("GEMINI_API_KEY")?)
//!         .vision_auth(OcrAuth::ApiKey(std::env::var("GOOGLE_VISION_API_KEY")?))
//!         .build()?;
//!     let orchestrator = BatchOrchestrator::from_config(&config)?;
//!
//!     let files = vec![UploadedFile::from_path("register-p1.jpg").await?];
//!     let output = orchestrator.run(files, &BatchRequest::default()).await?;
//!     println!("{}", output.text);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`    | on  | Enables the `scan2table` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `server` | off | Enables [`server`] and the `scan2table-server` binary (axum) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod error;
pub mod numerals;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod request;

#[cfg(feature = "server")]
pub mod server;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{BatchOrchestrator, BatchState};
pub use config::{
    ExecutionStrategy, OcrAuth, OutputShape, PageFailurePolicy, PipelineConfig,
    PipelineConfigBuilder,
};
pub use error::{PageError, ScanError};
pub use numerals::normalize_digits;
pub use output::{write_output, BatchOutput, BatchStats, FileReport, DEFAULT_OUTPUT_STEM};
pub use pipeline::llm::{GenerativeBackend, LlmFormatter, RetryPolicy};
pub use pipeline::ocr::OcrEngine;
pub use pipeline::render::PdfRasterizer;
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use request::{BatchForm, BatchRequest, ColumnSpec, MediaType, UploadedFile};
