//! LLM interaction: build generation requests and call the provider.
//!
//! This module turns raw OCR text (two-step) or a raw image (single-step)
//! into a generation request and returns table rows or cleaned prose. All
//! prompt wording lives in [`crate::prompts`]; all response cleanup lives in
//! [`crate::pipeline::postprocess`].
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 responses and transport errors are transient. Each
//! operation makes up to `max_attempts` calls, sleeping
//! `base_delay * 2^(n-1)` after the n-th failed attempt: with the defaults
//! (5 attempts, 1 s) the waits are 1 s → 2 s → 4 s → 8 s. Any other non-2xx
//! status fails immediately.

use crate::config::{OutputShape, PipelineConfig};
use crate::error::ScanError;
use crate::pipeline::encode::InlineImage;
use crate::pipeline::postprocess::decode_table;
use crate::prompts;
use crate::request::ColumnSpec;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const SERVICE: &str = "gemini";

/// One call to the generative service.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub image: Option<InlineImage>,
    /// When set, the service must answer with JSON matching this schema.
    pub response_schema: Option<Value>,
}

impl GenerateRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
            response_schema: None,
        }
    }

    pub fn with_image(mut self, image: InlineImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// Failure of a single backend call, before retry classification is applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Rate limiting or temporary unavailability (HTTP 429 / 503).
    #[error("HTTP {status}: {body}")]
    Transient { status: u16, body: String },

    /// The request never produced an HTTP response (timeout, DNS, reset).
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// A 2xx response without usable text.
    #[error("response contained no candidate text")]
    Malformed { raw: String },
}

impl BackendError {
    /// Rate limiting, unavailability and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient { .. } | BackendError::Transport(_))
    }

    /// The library error reported when this failure ends the call.
    pub fn into_scan_error(self) -> ScanError {
        match self {
            BackendError::Transient { status, body } | BackendError::Status { status, body } => {
                ScanError::ExternalService {
                    service: SERVICE,
                    status: Some(status),
                    body,
                }
            }
            BackendError::Transport(detail) => ScanError::ExternalService {
                service: SERVICE,
                status: None,
                body: detail,
            },
            BackendError::Malformed { raw } => ScanError::MalformedResponse {
                service: SERVICE,
                detail: "response contained no candidate text".into(),
                raw,
            },
        }
    }
}

/// Map a non-success HTTP status to a [`BackendError`].
pub fn classify_status(status: u16, body: String) -> BackendError {
    match status {
        429 | 503 => BackendError::Transient { status, body },
        _ => BackendError::Status { status, body },
    }
}

/// Anything that can answer a [`GenerateRequest`] with text.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError>;
}

// ── Gemini REST backend ──────────────────────────────────────────────────────

/// Gemini `models/{model}:generateContent` client.
pub struct GeminiBackend {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f32,
}

impl GeminiBackend {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ScanError> {
        let api_key = config
            .gemini_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ScanError::InvalidConfig("Gemini API key missing".into()))?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ScanError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: config.gemini_endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }

    fn generate_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

#[async_trait]
impl GenerativeBackend for GeminiBackend {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        let body = generate_request_body(request, self.temperature);

        let response = self
            .http
            .post(self.generate_url())
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), text));
        }
        parse_generate_response(&text)
    }
}

/// JSON body for `generateContent`.
pub fn generate_request_body(request: &GenerateRequest, temperature: f32) -> Value {
    let mut parts = vec![json!({ "text": request.prompt })];
    if let Some(image) = &request.image {
        parts.push(json!({ "inlineData": image }));
    }

    let mut generation_config = json!({ "temperature": temperature });
    if let Some(schema) = &request.response_schema {
        generation_config["responseMimeType"] = json!("application/json");
        generation_config["responseSchema"] = schema.clone();
    }

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": generation_config,
    })
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Concatenate the text parts of the first candidate.
pub fn parse_generate_response(body: &str) -> Result<String, BackendError> {
    let malformed = || BackendError::Malformed {
        raw: body.to_string(),
    };
    let parsed: GenerateResponse = serde_json::from_str(body).map_err(|_| malformed())?;

    let parts = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts)
        .ok_or_else(malformed)?;

    let texts: Vec<String> = parts.into_iter().filter_map(|p| p.text).collect();
    if texts.is_empty() {
        return Err(malformed());
    }
    Ok(texts.concat())
}

// ── Formatter ────────────────────────────────────────────────────────────────

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls, first attempt included.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_base_delay(),
        }
    }

    /// Wait after the `attempt`-th failed call (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Formats OCR text or images through a [`GenerativeBackend`] with retry.
#[derive(Clone)]
pub struct LlmFormatter {
    backend: Arc<dyn GenerativeBackend>,
    retry: RetryPolicy,
}

impl LlmFormatter {
    pub fn new(backend: Arc<dyn GenerativeBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Build a formatter backed by the Gemini REST API.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ScanError> {
        let backend = GeminiBackend::from_config(config)?;
        Ok(Self::new(Arc::new(backend), RetryPolicy::from_config(config)))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Turn raw OCR text into TSV rows, one per record, in column order.
    pub async fn format_as_table(
        &self,
        raw_text: &str,
        columns: &ColumnSpec,
    ) -> Result<Vec<String>, ScanError> {
        let request = GenerateRequest::text(prompts::table_prompt_from_text(raw_text, columns))
            .with_schema(prompts::table_response_schema(columns));
        let response = self.generate_with_retry(&request).await?;
        decode_table(&response, columns)
    }

    /// Clean raw OCR text into a readable document.
    ///
    /// The response text is returned verbatim apart from outer whitespace.
    pub async fn format_as_document(
        &self,
        raw_text: &str,
        prompt_override: Option<&str>,
    ) -> Result<String, ScanError> {
        let request =
            GenerateRequest::text(prompts::document_prompt_from_text(raw_text, prompt_override));
        let response = self.generate_with_retry(&request).await?;
        Ok(response.trim().to_string())
    }

    /// Read an image and format it in a single call.
    ///
    /// Table rows are joined with `\n`.
    pub async fn full_extract_and_format(
        &self,
        image: &InlineImage,
        shape: OutputShape,
        columns: &ColumnSpec,
        prompt_override: Option<&str>,
    ) -> Result<String, ScanError> {
        match shape {
            OutputShape::Table => {
                let request = GenerateRequest::text(prompts::table_prompt_from_image(columns))
                    .with_image(image.clone())
                    .with_schema(prompts::table_response_schema(columns));
                let response = self.generate_with_retry(&request).await?;
                Ok(decode_table(&response, columns)?.join("\n"))
            }
            OutputShape::Document => {
                let request =
                    GenerateRequest::text(prompts::document_prompt_from_image(prompt_override))
                        .with_image(image.clone());
                let response = self.generate_with_retry(&request).await?;
                Ok(response.trim().to_string())
            }
        }
    }

    async fn generate_with_retry(&self, request: &GenerateRequest) -> Result<String, ScanError> {
        let start = Instant::now();
        let max = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max {
            let e = match self.backend.generate(request).await {
                Ok(text) => {
                    debug!(
                        "LLM answered {} chars after {} attempt(s), {:?}",
                        text.len(),
                        attempt,
                        start.elapsed()
                    );
                    return Ok(text);
                }
                Err(e) => e,
            };

            if !e.is_retryable() {
                return Err(e.into_scan_error());
            }

            warn!("LLM attempt {}/{} failed: {}", attempt, max, e);
            last_error = e.to_string();
            if attempt < max {
                let backoff = self.retry.delay_after(attempt);
                warn!("retry {}/{} after {}ms", attempt + 1, max, backoff.as_millis());
                sleep(backoff).await;
            }
        }

        Err(ScanError::ExternalServiceExhausted {
            service: SERVICE,
            attempts: max,
            last_error,
        })
    }
}
