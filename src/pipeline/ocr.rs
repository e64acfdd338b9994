//! OCR client: image bytes → raw text via Google Cloud Vision.
//!
//! The client sends the whole image with the `DOCUMENT_TEXT_DETECTION`
//! feature and returns `fullTextAnnotation.text`. An image with no detected
//! text yields `""`, which is not an error.
//!
//! This step does not retry. A transport failure, non-2xx status or per-image
//! `error` object is surfaced immediately as
//! [`ScanError::ExternalService`]; retry is the caller's business.

use crate::config::{OcrAuth, PipelineConfig};
use crate::error::ScanError;
use crate::pipeline::encode::encode_base64;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use tracing::{debug, info};

const SERVICE: &str = "vision";

/// Anything that can turn an image into raw text.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Extract all text from `image`. Returns `""` when nothing is detected.
    async fn extract_text(&self, image: &[u8]) -> Result<String, ScanError>;
}

/// Google Cloud Vision `images:annotate` client.
pub struct VisionOcrClient {
    http: reqwest::Client,
    endpoint: String,
    auth: OcrAuth,
}

impl VisionOcrClient {
    /// Build the client from the explicit pipeline configuration.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ScanError> {
        let auth = config.vision_auth.clone().ok_or_else(|| {
            ScanError::InvalidConfig(
                "Vision OCR credentials missing: set an API key or access token".into(),
            )
        })?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ScanError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: config.vision_endpoint.trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn annotate_url(&self) -> String {
        format!("{}/images:annotate", self.endpoint)
    }
}

#[async_trait]
impl OcrEngine for VisionOcrClient {
    async fn extract_text(&self, image: &[u8]) -> Result<String, ScanError> {
        let start = Instant::now();
        let body = annotate_request_body(image);

        let mut request = self.http.post(self.annotate_url()).json(&body);
        request = match &self.auth {
            OcrAuth::ApiKey(key) => request.query(&[("key", key)]),
            OcrAuth::BearerToken(token) => request.bearer_auth(token),
        };

        let response = request.send().await.map_err(|e| ScanError::ExternalService {
            service: SERVICE,
            status: None,
            body: e.to_string(),
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| ScanError::ExternalService {
            service: SERVICE,
            status: Some(status.as_u16()),
            body: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(ScanError::ExternalService {
                service: SERVICE,
                status: Some(status.as_u16()),
                body: text,
            });
        }

        let extracted = parse_annotate_response(&text)?;
        info!(
            "OCR extracted {} chars in {}ms",
            extracted.chars().count(),
            start.elapsed().as_millis()
        );
        Ok(extracted)
    }
}

// ── Wire format ──────────────────────────────────────────────────────────

/// Request body for one image with document text detection.
pub fn annotate_request_body(image: &[u8]) -> serde_json::Value {
    json!({
        "requests": [{
            "image": { "content": encode_base64(image) },
            "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }]
        }]
    })
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    full_text_annotation: Option<FullTextAnnotation>,
    error: Option<VisionStatus>,
}

#[derive(Debug, Deserialize)]
struct FullTextAnnotation {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct VisionStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

/// Pull the detected text out of an `images:annotate` response body.
pub fn parse_annotate_response(body: &str) -> Result<String, ScanError> {
    let parsed: AnnotateResponse =
        serde_json::from_str(body).map_err(|e| ScanError::MalformedResponse {
            service: SERVICE,
            detail: e.to_string(),
            raw: body.to_string(),
        })?;

    let Some(first) = parsed.responses.into_iter().next() else {
        debug!("Vision returned no per-image response; treating as no text");
        return Ok(String::new());
    };

    if let Some(err) = first.error {
        return Err(ScanError::ExternalService {
            service: SERVICE,
            status: None,
            body: format!("code {}: {}", err.code, err.message),
        });
    }

    Ok(first
        .full_text_annotation
        .map(|a| a.text)
        .unwrap_or_default())
}
