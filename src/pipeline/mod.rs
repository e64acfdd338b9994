//! Pipeline stages for scanned-page extraction.
//!
//! Each submodule implements exactly one transformation step, behind a trait
//! where the step talks to the outside world, so tests can swap in stubs.
//!
//! ## Data Flow
//!
//! ```text
//! PDF ──▶ render ──┐
//!                  ├──▶ encode ──▶ ocr ──▶ llm ──▶ postprocess
//! image ───────────┘   (base64)  (Vision) (Gemini)  (JSON → TSV)
//! ```
//!
//! 1. [`render`] splits a PDF into page images with an external rasteriser
//! 2. [`encode`] base64-wraps image bytes for JSON request bodies
//! 3. [`ocr`] extracts raw text (two-step and raw strategies)
//! 4. [`llm`] formats text or reads an image, with retry/backoff
//! 5. [`postprocess`] decodes table JSON and cleans prose

pub mod encode;
pub mod llm;
pub mod ocr;
pub mod postprocess;
pub mod render;
