//! Error types for the scan2table library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ScanError`] (**fatal**): the batch cannot produce an output file
//!   (invalid request, OCR/LLM service failure, rasteriser crash). Returned
//!   as `Err(ScanError)` from [`crate::batch::BatchOrchestrator::run`].
//!   Failures inside a file are wrapped in [`ScanError::Pipeline`] so the
//!   caller always learns *which* upload broke the batch.
//!
//! * [`PageError`] (**non-fatal**): a single PDF page failed while the batch
//!   runs with [`crate::config::PageFailurePolicy::Skip`]. Stored inside
//!   [`crate::output::FileReport`] so callers can see what was omitted.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the scan2table library.
#[derive(Debug, Error)]
pub enum ScanError {
    // ── Request errors ────────────────────────────────────────────────────
    /// Malformed or missing input; reported before any processing begins.
    #[error("Invalid request: {0}")]
    Validation(String),

    // ── External service errors ───────────────────────────────────────────
    /// The OCR or LLM service returned a non-retryable failure.
    #[error("{service} error{}: {body}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    ExternalService {
        service: &'static str,
        status: Option<u16>,
        body: String,
    },

    /// Every retry against the LLM service hit a transient failure.
    #[error("{service} still unavailable after {attempts} attempts: {last_error}")]
    ExternalServiceExhausted {
        service: &'static str,
        attempts: u32,
        last_error: String,
    },

    /// The service answered, but not in the structure we asked for.
    #[error("Malformed response from {service}: {detail}\nRaw response: {raw}")]
    MalformedResponse {
        service: &'static str,
        detail: String,
        raw: String,
    },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// The external PDF rasteriser failed or produced no pages.
    #[error("PDF rasterisation failed: {detail}")]
    Rasterizer { detail: String },

    // ── Batch errors ──────────────────────────────────────────────────────
    /// A per-file failure, tagged with the originating file name.
    #[error("Failed to process file '{file}': {source}")]
    Pipeline {
        file: String,
        #[source]
        source: Box<ScanError>,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Local I/O failed (temp files, reading uploads).
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Wrap this error with the name of the file being processed.
    pub fn in_file(self, file: impl Into<String>) -> Self {
        ScanError::Pipeline {
            file: file.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for an [`ScanError::Io`] with a context message.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ScanError::Io {
            context: context.into(),
            source,
        }
    }

    /// `true` when the caller sent a bad request (HTTP 4xx territory).
    pub fn is_validation(&self) -> bool {
        matches!(self, ScanError::Validation(_))
    }

    /// Name of the failing file, if this is a file-scoped error.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            ScanError::Pipeline { file, .. } => Some(file),
            _ => None,
        }
    }

    /// The innermost error, unwrapping any [`ScanError::Pipeline`] layers.
    pub fn root_cause(&self) -> &ScanError {
        match self {
            ScanError::Pipeline { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// A non-fatal error for a single PDF page.
///
/// Only produced under [`crate::config::PageFailurePolicy::Skip`]; with the
/// default policy a page failure aborts the batch instead.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("Page {page}: {detail}")]
pub struct PageError {
    /// 1-indexed page number.
    pub page: usize,
    /// Human-readable reason.
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_service_display_with_status() {
        let e = ScanError::ExternalService {
            service: "gemini",
            status: Some(400),
            body: "bad request".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("HTTP 400"), "got: {msg}");
        assert!(msg.contains("bad request"));
    }

    #[test]
    fn external_service_display_without_status() {
        let e = ScanError::ExternalService {
            service: "vision",
            status: None,
            body: "connection refused".into(),
        };
        assert_eq!(e.to_string(), "vision error: connection refused");
    }

    #[test]
    fn pipeline_error_names_file() {
        let e = ScanError::Validation("x".into()).in_file("scan-02.png");
        assert_eq!(e.file_name(), Some("scan-02.png"));
        assert!(e.to_string().contains("scan-02.png"));
        assert!(e.root_cause().is_validation());
    }

    #[test]
    fn exhausted_display() {
        let e = ScanError::ExternalServiceExhausted {
            service: "gemini",
            attempts: 5,
            last_error: "HTTP 429".into(),
        };
        assert!(e.to_string().contains("5 attempts"));
    }

    #[test]
    fn malformed_keeps_raw_body() {
        let e = ScanError::MalformedResponse {
            service: "gemini",
            detail: "expected value at line 1".into(),
            raw: "not json".into(),
        };
        assert!(e.to_string().contains("not json"));
    }

    #[test]
    fn page_error_display() {
        let e = PageError {
            page: 3,
            detail: "timeout".into(),
        };
        assert_eq!(e.to_string(), "Page 3: timeout");
    }
}
