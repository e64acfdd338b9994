//! CLI binary for scan2table.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig` / `BatchForm` and writes the combined result.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use scan2table::config::{DEFAULT_MODEL, DEFAULT_VISION_ENDPOINT, DEFAULT_GEMINI_ENDPOINT};
use scan2table::{
    write_output, BatchForm, BatchOrchestrator, BatchProgressCallback, OcrAuth, OutputShape,
    PageFailurePolicy, PipelineConfig, ProgressCallback, UploadedFile,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar over the files of the batch, one log line per file.
struct CliProgressCallback {
    bar: ProgressBar,
    file_started: Mutex<Option<Instant>>,
    pages_seen: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        bar.set_style(style);
        bar.set_prefix("Scanning");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            file_started: Mutex::new(None),
            pages_seen: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self) -> f64 {
        self.file_started
            .lock()
            .ok()
            .and_then(|mut t| t.take())
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_files} file(s)…"))
        ));
    }

    fn on_file_start(&self, _index: usize, _total: usize, name: &str) {
        if let Ok(mut t) = self.file_started.lock() {
            *t = Some(Instant::now());
        }
        self.pages_seen.store(0, Ordering::SeqCst);
        self.bar.set_message(name.to_string());
    }

    fn on_page_start(&self, _file: usize, page_num: usize, total_pages: usize) {
        self.pages_seen.fetch_add(1, Ordering::SeqCst);
        self.bar.set_message(format!("page {page_num}/{total_pages}"));
    }

    fn on_file_complete(&self, index: usize, total: usize, name: &str, chars: usize) {
        let pages = self.pages_seen.load(Ordering::SeqCst);
        let page_note = if pages > 0 {
            format!("{pages} pages")
        } else {
            String::new()
        };
        self.bar.println(format!(
            "  {} {:>3}/{:<3} {:<32} {:<9} {:<9} {}",
            green("✓"),
            index + 1,
            total,
            name,
            dim(&format!("{chars:>5} chars")),
            dim(&page_note),
            dim(&format!("{:.1}s", self.elapsed_secs())),
        ));
        self.bar.inc(1);
    }

    fn on_file_error(&self, index: usize, total: usize, name: &str, error: &str) {
        // Truncate very long error messages to keep output tidy.
        let msg: String = if error.chars().count() > 80 {
            let mut s: String = error.chars().take(79).collect();
            s.push('…');
            s
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:>3}/{:<3} {}  {}",
            red("✗"),
            index + 1,
            total,
            name,
            red(&msg),
        ));
        self.bar.abandon();
    }

    fn on_batch_complete(&self, total_files: usize, output_chars: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} file(s) processed, {} chars",
            green("✔"),
            bold(&total_files.to_string()),
            output_chars
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Library register pages → table on stdout (OCR + LLM)
  scan2table page1.jpg page2.jpg

  # Write ocr_results.csv into a directory
  scan2table scans/*.png -o out/

  # One LLM call per image, custom columns
  scan2table --strategy single_step --columns "Date, Payee, Amount" receipt.pdf -o receipts.csv

  # Clean prose with a custom instruction
  scan2table --shape document --prompt "Translate to English." letter.png

  # OCR only, no formatting
  scan2table --strategy raw scan.pdf -o scan.txt

  # Keep going when a PDF page fails
  scan2table --page-failures skip book.pdf -o book.csv

STRATEGIES:
  two_step     OCR service extracts text, the LLM formats it (default)
  single_step  the LLM reads the image and formats it in one call
  raw          OCR text only; table requests fall back to plain text

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY               Gemini API key (two_step, single_step)
  GOOGLE_VISION_API_KEY        Vision API key (two_step, raw)
  GOOGLE_VISION_ACCESS_TOKEN   Vision OAuth access token, instead of the API key
  SCAN2TABLE_MODEL             Override the Gemini model
  RUST_LOG                     Override the log filter

PDF SUPPORT:
  PDFs are split into pages with poppler's `pdftoppm`, which must be on PATH
  (Debian/Ubuntu: apt install poppler-utils; macOS: brew install poppler).
"#;

/// Extract tables and text from scanned images and PDFs with OCR and an LLM.
#[derive(Parser, Debug)]
#[command(
    name = "scan2table",
    version,
    about = "Extract tables and text from scanned images and PDFs with OCR and an LLM",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Image (JPEG, PNG, GIF, WebP, BMP, TIFF) or PDF files, processed in order.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Execution strategy: two_step, single_step or raw.
    #[arg(long, env = "SCAN2TABLE_STRATEGY", default_value = "two_step")]
    strategy: String,

    /// Output shape: table or document.
    #[arg(long, env = "SCAN2TABLE_SHAPE", default_value = "table")]
    shape: String,

    /// Comma-separated column names for the table shape.
    #[arg(long)]
    columns: Option<String>,

    /// Replacement instruction for the document shape (max 150 words).
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,

    /// Read the document instruction from a file.
    #[arg(long)]
    prompt_file: Option<PathBuf>,

    /// Output file, or a directory to receive ocr_results.{csv,txt}. Default: stdout.
    #[arg(short, long, env = "SCAN2TABLE_OUTPUT")]
    output: Option<PathBuf>,

    /// Print the full result (text, per-file reports, stats) as JSON.
    #[arg(long)]
    json: bool,

    /// Gemini API key.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,

    /// Google Cloud Vision API key.
    #[arg(long, env = "GOOGLE_VISION_API_KEY", hide_env_values = true)]
    vision_api_key: Option<String>,

    /// Google Cloud Vision OAuth access token (used when no API key is set).
    #[arg(long, env = "GOOGLE_VISION_ACCESS_TOKEN", hide_env_values = true)]
    vision_access_token: Option<String>,

    /// Gemini model ID.
    #[arg(long, env = "SCAN2TABLE_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Gemini REST endpoint.
    #[arg(long, env = "SCAN2TABLE_GEMINI_ENDPOINT", default_value = DEFAULT_GEMINI_ENDPOINT, hide = true)]
    gemini_endpoint: String,

    /// Vision REST endpoint.
    #[arg(long, env = "SCAN2TABLE_VISION_ENDPOINT", default_value = DEFAULT_VISION_ENDPOINT, hide = true)]
    vision_endpoint: String,

    /// Total LLM attempts on rate limiting or unavailability.
    #[arg(long, env = "SCAN2TABLE_MAX_ATTEMPTS", default_value_t = 5,
          value_parser = clap::value_parser!(u32).range(1..=10))]
    max_attempts: u32,

    /// First backoff delay in milliseconds; doubles after each attempt.
    #[arg(long, env = "SCAN2TABLE_RETRY_BASE_MS", default_value_t = 1000)]
    retry_base_ms: u64,

    /// Timeout for each OCR / LLM request, in seconds.
    #[arg(long, env = "SCAN2TABLE_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    /// PDF rendering DPI (72–400).
    #[arg(long, env = "SCAN2TABLE_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// PDF rasteriser program (pdftoppm-compatible arguments).
    #[arg(long, env = "SCAN2TABLE_RASTERIZER", default_value = "pdftoppm")]
    rasterizer: String,

    /// What to do when one PDF page fails: abort or skip.
    #[arg(long, value_enum, default_value = "abort")]
    page_failures: PageFailureArg,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long)]
    no_progress: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PageFailureArg {
    Abort,
    Skip,
}

impl From<PageFailureArg> for PageFailurePolicy {
    fn from(v: PageFailureArg) -> Self {
        match v {
            PageFailureArg::Abort => PageFailurePolicy::Abort,
            PageFailureArg::Skip => PageFailurePolicy::Skip,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build request and config ─────────────────────────────────────────
    let form = build_form(&cli).await?;
    let request = form.validate().context("Invalid request")?;

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn BatchProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;
    let orchestrator =
        BatchOrchestrator::from_config(&config).context("Failed to set up OCR/LLM clients")?;

    // ── Load files ───────────────────────────────────────────────────────
    let mut files = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        let file = UploadedFile::from_path(path)
            .await
            .with_context(|| format!("Cannot use input {}", path.display()))?;
        files.push(file);
    }

    // ── Run batch ────────────────────────────────────────────────────────
    let output = orchestrator
        .run(files, &request)
        .await
        .context("Batch failed")?;

    if let Some(ref target) = cli.output {
        let path = resolve_output_path(target, &output.default_file_name());
        write_output(&output.text, &path)
            .await
            .context("Failed to write output")?;

        if !cli.quiet {
            eprintln!(
                "{}  {} file(s)  {} page(s)  {}ms  →  {}",
                green("✔"),
                output.stats.total_files,
                output.stats.total_pages,
                output.stats.total_duration_ms,
                bold(&path.display().to_string()),
            );
        }
    }

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if cli.output.is_none() {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(output.text.as_bytes())
            .context("Failed to write to stdout")?;
        if !output.text.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }
    }

    if !cli.quiet && output.stats.skipped_pages > 0 {
        for report in &output.files {
            for page in &report.skipped_pages {
                eprintln!("  {} {} {}", cyan("⚠"), report.name, dim(&page.to_string()));
            }
        }
    }

    Ok(())
}

/// Map CLI args onto the upload-form fields.
async fn build_form(cli: &Cli) -> Result<BatchForm> {
    let prompt = match (&cli.prompt, &cli.prompt_file) {
        (Some(p), _) => Some(p.clone()),
        (None, Some(path)) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read prompt from {:?}", path))?,
        ),
        (None, None) => None,
    };

    let shape: OutputShape = cli.shape.parse().context("Invalid --shape")?;
    let custom = match shape {
        OutputShape::Table => cli.columns.is_some(),
        OutputShape::Document => prompt.is_some(),
    };

    Ok(BatchForm {
        ocr_engine: Some(cli.strategy.clone()),
        output_format: Some(cli.shape.clone()),
        prompt_type: Some(if custom { "custom" } else { "default" }.to_string()),
        custom_prompt: prompt,
        columns: cli.columns.clone(),
    })
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .model(cli.model.clone())
        .gemini_endpoint(cli.gemini_endpoint.clone())
        .vision_endpoint(cli.vision_endpoint.clone())
        .max_attempts(cli.max_attempts)
        .retry_base_delay_ms(cli.retry_base_ms)
        .request_timeout_secs(cli.timeout)
        .dpi(cli.dpi)
        .rasterizer_program(cli.rasterizer.clone())
        .page_failure_policy(cli.page_failures.into());

    if let Some(ref key) = cli.gemini_api_key {
        builder = builder.gemini_api_key(key.clone());
    }
    if let Some(ref key) = cli.vision_api_key {
        builder = builder.vision_auth(OcrAuth::ApiKey(key.clone()));
    } else if let Some(ref token) = cli.vision_access_token {
        builder = builder.vision_auth(OcrAuth::BearerToken(token.clone()));
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// An existing directory receives the default file name; anything else is a file path.
fn resolve_output_path(target: &Path, default_name: &str) -> PathBuf {
    if target.is_dir() {
        target.join(default_name)
    } else {
        target.to_path_buf()
    }
}
