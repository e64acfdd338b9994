//! Batch orchestration: files in, one combined text out.
//!
//! Files are processed strictly in input order, one at a time. Each file goes
//! through the OCR service, the LLM service, or both, depending on the
//! [`ExecutionStrategy`]; a PDF is first split into page images and each page
//! is handled like an uploaded image.
//!
//! The first failing file aborts the batch: its error is wrapped in
//! [`ScanError::Pipeline`] with the file name and everything accumulated so
//! far is discarded. A failing PDF page does the same unless the
//! configuration opts into [`PageFailurePolicy::Skip`].

use crate::config::{ExecutionStrategy, OutputShape, PageFailurePolicy, PipelineConfig};
use crate::error::{PageError, ScanError};
use crate::output::{write_output, BatchOutput, BatchStats, FileReport};
use crate::pipeline::encode::InlineImage;
use crate::pipeline::llm::LlmFormatter;
use crate::pipeline::ocr::{OcrEngine, VisionOcrClient};
use crate::pipeline::render::{CommandRasterizer, PdfRasterizer};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::request::{BatchRequest, MediaType, UploadedFile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    /// `index` is 0-based.
    Processing { index: usize, total: usize },
    Succeeded,
    Failed,
}

/// Drives a batch of uploads through the selected strategy.
#[derive(Clone)]
pub struct BatchOrchestrator {
    ocr: Option<Arc<dyn OcrEngine>>,
    formatter: Option<LlmFormatter>,
    rasterizer: Arc<dyn PdfRasterizer>,
    page_failure_policy: PageFailurePolicy,
    progress: ProgressCallback,
}

#[derive(Default)]
struct Counters {
    ocr_calls: usize,
    llm_calls: usize,
}

struct FileOutcome {
    blocks: Vec<String>,
    pages: usize,
    skipped: Vec<PageError>,
}

impl BatchOrchestrator {
    /// Assemble an orchestrator from explicit components.
    pub fn new(
        ocr: Arc<dyn OcrEngine>,
        formatter: LlmFormatter,
        rasterizer: Arc<dyn PdfRasterizer>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            ocr: Some(ocr),
            formatter: Some(formatter),
            rasterizer,
            page_failure_policy: config.page_failure_policy,
            progress: progress_from(config),
        }
    }

    /// Build the real Vision, Gemini and rasteriser clients.
    ///
    /// A service without credentials is left out; batches whose strategy
    /// needs it then fail with [`ScanError::InvalidConfig`].
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ScanError> {
        let ocr: Option<Arc<dyn OcrEngine>> = match config.vision_auth {
            Some(_) => Some(Arc::new(VisionOcrClient::from_config(config)?)),
            None => None,
        };
        let formatter = match config.gemini_api_key {
            Some(_) => Some(LlmFormatter::from_config(config)?),
            None => None,
        };
        if ocr.is_none() && formatter.is_none() {
            return Err(ScanError::InvalidConfig(
                "no service credentials configured (need a Gemini API key and/or Vision credentials)"
                    .into(),
            ));
        }

        Ok(Self {
            ocr,
            formatter,
            rasterizer: Arc::new(CommandRasterizer::from_config(config)),
            page_failure_policy: config.page_failure_policy,
            progress: progress_from(config),
        })
    }

    /// Process every file in order and return the combined output.
    pub async fn run(
        &self,
        files: Vec<UploadedFile>,
        request: &BatchRequest,
    ) -> Result<BatchOutput, ScanError> {
        let start = Instant::now();

        if files.is_empty() {
            return Err(ScanError::Validation("no files uploaded".into()));
        }
        self.ensure_ready(request.strategy)?;

        let shape = request.effective_shape();
        if shape != request.shape {
            warn!(
                "Strategy '{}' has no formatting step; producing {} output instead of {}",
                request.strategy, shape, request.shape
            );
        }

        let total = files.len();
        info!(
            "Batch started: {} file(s), strategy={}, shape={}",
            total, request.strategy, shape
        );

        let mut state = BatchState::Idle;
        self.progress.on_batch_start(total);

        let mut text = String::new();
        if shape == OutputShape::Table {
            text.push_str(&request.columns.header());
            text.push('\n');
        }

        let mut counters = Counters::default();
        let mut reports = Vec::with_capacity(total);

        for (index, file) in files.iter().enumerate() {
            transition(&mut state, BatchState::Processing { index, total });
            self.progress.on_file_start(index, total, &file.name);

            let outcome = match self
                .process_file(index, file, request, shape, &mut counters)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("File '{}' failed: {}", file.name, e);
                    self.progress
                        .on_file_error(index, total, &file.name, &e.to_string());
                    transition(&mut state, BatchState::Failed);
                    return Err(e.in_file(&file.name));
                }
            };

            let before = text.chars().count();
            for block in &outcome.blocks {
                append_block(&mut text, block);
            }
            let chars = text.chars().count() - before;

            debug!(
                "File '{}': {} page(s), {} block(s), {} chars",
                file.name,
                outcome.pages,
                outcome.blocks.len(),
                chars
            );
            self.progress.on_file_complete(index, total, &file.name, chars);

            reports.push(FileReport {
                name: file.name.clone(),
                pages: outcome.pages,
                skipped_pages: outcome.skipped,
                chars,
            });
        }

        let text = text.trim().to_string();
        transition(&mut state, BatchState::Succeeded);

        let stats = BatchStats {
            total_files: total,
            total_pages: reports.iter().map(|r| r.pages).sum(),
            skipped_pages: reports.iter().map(|r| r.skipped_pages.len()).sum(),
            ocr_calls: counters.ocr_calls,
            llm_calls: counters.llm_calls,
            output_chars: text.chars().count(),
            total_duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            "Batch complete: {} file(s), {} page(s), {} chars, {}ms",
            stats.total_files, stats.total_pages, stats.output_chars, stats.total_duration_ms
        );
        self.progress.on_batch_complete(total, stats.output_chars);

        Ok(BatchOutput {
            text,
            shape,
            strategy: request.strategy,
            file_extension: shape.file_extension().to_string(),
            files: reports,
            stats,
        })
    }

    /// Run the batch and write `ocr_results.{csv,txt}` into `dir`.
    ///
    /// Uses atomic write (temp file + rename) to prevent partial files.
    pub async fn run_to_file(
        &self,
        files: Vec<UploadedFile>,
        request: &BatchRequest,
        dir: impl AsRef<Path>,
    ) -> Result<(PathBuf, BatchStats), ScanError> {
        let output = self.run(files, request).await?;
        let path = dir.as_ref().join(output.default_file_name());
        write_output(&output.text, &path).await?;
        Ok((path, output.stats))
    }

    fn ensure_ready(&self, strategy: ExecutionStrategy) -> Result<(), ScanError> {
        if strategy.uses_ocr() && self.ocr.is_none() {
            return Err(ScanError::InvalidConfig(format!(
                "strategy '{strategy}' needs Vision OCR credentials"
            )));
        }
        if strategy != ExecutionStrategy::Raw && self.formatter.is_none() {
            return Err(ScanError::InvalidConfig(format!(
                "strategy '{strategy}' needs a Gemini API key"
            )));
        }
        Ok(())
    }

    async fn process_file(
        &self,
        index: usize,
        file: &UploadedFile,
        request: &BatchRequest,
        shape: OutputShape,
        counters: &mut Counters,
    ) -> Result<FileOutcome, ScanError> {
        match file.media_type {
            MediaType::Image(kind) => {
                let block = self
                    .process_image(&file.bytes, kind.mime_type(), request, shape, counters)
                    .await?;
                Ok(FileOutcome {
                    blocks: vec![block],
                    pages: 1,
                    skipped: Vec::new(),
                })
            }
            MediaType::Pdf => self.process_pdf(index, file, request, shape, counters).await,
        }
    }

    async fn process_pdf(
        &self,
        index: usize,
        file: &UploadedFile,
        request: &BatchRequest,
        shape: OutputShape,
        counters: &mut Counters,
    ) -> Result<FileOutcome, ScanError> {
        // Owns the page directory; dropped on every return path below.
        let mut pdf = self.rasterizer.rasterize(&file.bytes).await?;
        let pages = pdf.take_pages();
        let total_pages = pages.len();
        info!("'{}': {} page(s)", file.name, total_pages);

        let mut blocks = Vec::with_capacity(total_pages);
        let mut skipped = Vec::new();

        for page in pages {
            self.progress.on_page_start(index, page.number, total_pages);

            let result = match page.read().await {
                Ok(bytes) => {
                    self.process_image(&bytes, "image/png", request, shape, counters)
                        .await
                }
                Err(e) => Err(e),
            };
            let number = page.number;
            drop(page);

            match result {
                Ok(block) => blocks.push(block),
                Err(e) => match self.page_failure_policy {
                    PageFailurePolicy::Abort => {
                        warn!("'{}' page {}/{} failed: {}", file.name, number, total_pages, e);
                        return Err(e);
                    }
                    PageFailurePolicy::Skip => {
                        warn!(
                            "'{}' page {}/{} skipped: {}",
                            file.name, number, total_pages, e
                        );
                        skipped.push(PageError {
                            page: number,
                            detail: e.to_string(),
                        });
                    }
                },
            }
        }

        Ok(FileOutcome {
            blocks,
            pages: total_pages,
            skipped,
        })
    }

    /// One image through the selected strategy.
    async fn process_image(
        &self,
        bytes: &[u8],
        mime_type: &str,
        request: &BatchRequest,
        shape: OutputShape,
        counters: &mut Counters,
    ) -> Result<String, ScanError> {
        match request.strategy {
            ExecutionStrategy::Raw => {
                counters.ocr_calls += 1;
                self.ocr()?.extract_text(bytes).await
            }
            ExecutionStrategy::TwoStep => {
                counters.ocr_calls += 1;
                let raw = self.ocr()?.extract_text(bytes).await?;
                if raw.trim().is_empty() {
                    debug!("OCR found no text; skipping LLM formatting");
                    return Ok(String::new());
                }

                counters.llm_calls += 1;
                let formatter = self.formatter()?;
                match shape {
                    OutputShape::Table => Ok(formatter
                        .format_as_table(&raw, &request.columns)
                        .await?
                        .join("\n")),
                    OutputShape::Document => {
                        formatter
                            .format_as_document(&raw, request.prompt.as_deref())
                            .await
                    }
                }
            }
            ExecutionStrategy::SingleStep => {
                counters.llm_calls += 1;
                let image = InlineImage::new(bytes, mime_type);
                self.formatter()?
                    .full_extract_and_format(
                        &image,
                        shape,
                        &request.columns,
                        request.prompt.as_deref(),
                    )
                    .await
            }
        }
    }

    fn ocr(&self) -> Result<&Arc<dyn OcrEngine>, ScanError> {
        self.ocr
            .as_ref()
            .ok_or_else(|| ScanError::InvalidConfig("Vision OCR client not configured".into()))
    }

    fn formatter(&self) -> Result<&LlmFormatter, ScanError> {
        self.formatter
            .as_ref()
            .ok_or_else(|| ScanError::InvalidConfig("LLM formatter not configured".into()))
    }
}

fn progress_from(config: &PipelineConfig) -> ProgressCallback {
    config
        .progress_callback
        .clone()
        .unwrap_or_else(|| Arc::new(NoopProgressCallback))
}

fn transition(state: &mut BatchState, next: BatchState) {
    debug!("batch state: {:?} → {:?}", state, next);
    *state = next;
}

/// Append a trimmed block followed by a blank line. Blank blocks are dropped.
fn append_block(text: &mut String, block: &str) {
    let block = block.trim();
    if block.is_empty() {
        return;
    }
    text.push_str(block);
    text.push_str("\n\n");
}
