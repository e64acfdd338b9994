//! HTTP server binary for scan2table.
//!
//! Serves `POST /bulk-ocr` and `GET /health`. Credentials and limits come
//! from flags or the environment; see `--help`.

use anyhow::{Context, Result};
use clap::Parser;
use scan2table::config::{DEFAULT_GEMINI_ENDPOINT, DEFAULT_MODEL, DEFAULT_VISION_ENDPOINT};
use scan2table::{server, BatchOrchestrator, OcrAuth, PageFailurePolicy, PipelineConfig};
use std::io;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Batch OCR HTTP server.
#[derive(Parser, Debug)]
#[command(name = "scan2table-server", version, about = "Batch OCR HTTP server")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "SCAN2TABLE_BIND", default_value = "127.0.0.1:8000")]
    bind: String,

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
    #[arg(long, env = "SCAN2TABLE_GEMINI_ENDPOINT", default_value = DEFAULT_GEMINI_ENDPOINT)]
    gemini_endpoint: String,

    /// Vision REST endpoint.
    #[arg(long, env = "SCAN2TABLE_VISION_ENDPOINT", default_value = DEFAULT_VISION_ENDPOINT)]
    vision_endpoint: String,

    /// Total LLM attempts on rate limiting or unavailability.
    #[arg(long, env = "SCAN2TABLE_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// First backoff delay in milliseconds; doubles after each attempt.
    #[arg(long, env = "SCAN2TABLE_RETRY_BASE_MS", default_value_t = 1000)]
    retry_base_ms: u64,

    /// Timeout for each OCR / LLM request, in seconds.
    #[arg(long, env = "SCAN2TABLE_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    /// PDF rendering DPI (72–400).
    #[arg(long, env = "SCAN2TABLE_DPI", default_value_t = 150)]
    dpi: u32,

    /// PDF rasteriser program (pdftoppm-compatible arguments).
    #[arg(long, env = "SCAN2TABLE_RASTERIZER", default_value = "pdftoppm")]
    rasterizer: String,

    /// What to do when one PDF page fails: abort or skip.
    #[arg(long, env = "SCAN2TABLE_PAGE_FAILURES", default_value = "abort")]
    page_failures: PageFailurePolicy,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else {
        "info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let mut builder = PipelineConfig::builder()
        .model(cli.model.clone())
        .gemini_endpoint(cli.gemini_endpoint.clone())
        .vision_endpoint(cli.vision_endpoint.clone())
        .max_attempts(cli.max_attempts)
        .retry_base_delay_ms(cli.retry_base_ms)
        .request_timeout_secs(cli.timeout)
        .dpi(cli.dpi)
        .rasterizer_program(cli.rasterizer.clone())
        .page_failure_policy(cli.page_failures);

    if let Some(ref key) = cli.gemini_api_key {
        builder = builder.gemini_api_key(key.clone());
    }
    if let Some(ref key) = cli.vision_api_key {
        builder = builder.vision_auth(OcrAuth::ApiKey(key.clone()));
    } else if let Some(ref token) = cli.vision_access_token {
        builder = builder.vision_auth(OcrAuth::BearerToken(token.clone()));
    }

    let config = builder.build().context("Invalid configuration")?;
    let orchestrator =
        BatchOrchestrator::from_config(&config).context("Failed to set up OCR/LLM clients")?;
    let app = server::router(orchestrator);

    let listener = tokio::net::TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("Cannot bind {}", cli.bind))?;
    info!(
        "Listening on {} (model={}, max {} files per request)",
        cli.bind,
        config.model,
        server::MAX_FILES
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
