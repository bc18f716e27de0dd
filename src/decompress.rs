//! Feed payload decoding
//!
//! Compressed feeds arrive as base64-wrapped raw-deflate JSON. Some feeds
//! are served uncompressed despite the `.z` naming convention, so decoding
//! always falls back to a direct JSON parse. Callers see an identical
//! `serde_json::Value` either way.

use crate::error::PipelineError;
use crate::types::RawFeedDocument;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use std::io::Read;

/// Decode a raw feed document into structured JSON.
///
/// Order of attempts:
/// 1. base64 decode, raw-deflate inflate, JSON parse
/// 2. direct JSON parse of the body
///
/// An empty body decodes to `Value::Null` (optional feed the provider
/// does not have). If both paths fail, `Decompress` is raised carrying
/// the feed name for diagnostics.
pub fn decode(raw: &RawFeedDocument) -> Result<serde_json::Value, PipelineError> {
    if raw.is_empty() {
        return Ok(serde_json::Value::Null);
    }

    let body = raw.body.trim();

    if let Some(value) = try_deflate(body) {
        return Ok(value);
    }

    // Fallback: some feeds arrive uncompressed despite the .z suffix
    match serde_json::from_str(body) {
        Ok(value) => Ok(value),
        Err(e) => Err(PipelineError::Decompress {
            feed: raw.feed,
            reason: format!("neither deflate nor plain JSON: {}", e),
        }),
    }
}

/// Attempt the compressed path. Any failure returns None so the caller
/// can fall back to plain JSON.
fn try_deflate(body: &str) -> Option<serde_json::Value> {
    // Compressed payloads are a single base64 token, possibly quoted
    let candidate = body.trim_matches('"');

    let compressed = BASE64.decode(candidate).ok()?;

    let mut inflated = String::new();
    DeflateDecoder::new(compressed.as_slice())
        .read_to_string(&mut inflated)
        .ok()?;

    serde_json::from_str(&inflated).ok()
}
