//! Image encoding: raw image bytes → base64 payload for JSON request bodies.
//!
//! Both Google services take images inline in the JSON body. The Vision API
//! wants a bare base64 string under `image.content`; Gemini wants the same
//! string plus a MIME type under `inlineData`. [`InlineImage`] carries both.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use tracing::debug;

/// A base64-encoded image ready to embed in a request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

impl InlineImage {
    /// Encode `bytes`, declaring them as `mime_type`.
    pub fn new(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        let data = encode_base64(bytes);
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// Standard (padded) base64 encoding.
pub fn encode_base64(bytes: &[u8]) -> String {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded image → {} bytes base64", b64.len());
    b64
}
