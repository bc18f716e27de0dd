//! Error types for the fetch/cache/replay pipeline
//!
//! Two layers: `FetchError` for the remote provider boundary and
//! `PipelineError` for everything the session API surfaces to callers.

use crate::types::FeedKind;
use thiserror::Error;

/// Errors from a single provider request.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connectivity or timeout. Retryable.
    #[error("network error fetching {feed}: {reason}")]
    Network { feed: String, reason: String },

    /// Provider backpressure (HTTP 429). Retryable with backoff up to the
    /// ceiling, then surfaced.
    #[error("rate limited fetching {feed} after {attempts} attempts")]
    RateLimited { feed: String, attempts: u32 },

    /// Unknown session path or missing feed (HTTP 404 / empty body).
    #[error("not found: {path}")]
    NotFound { path: String },
}

impl FetchError {
    /// Whether the retry policy should try this request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network { .. } | FetchError::RateLimited { .. }
        )
    }
}

/// Errors surfaced by the session API.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Malformed payload that is neither deflate nor plain JSON.
    /// Non-retryable; optional feeds are skipped instead.
    #[error("failed to decode feed {feed}: {reason}")]
    Decompress { feed: FeedKind, reason: String },

    /// Provider document present but structurally unusable.
    #[error("invalid {feed} document: {reason}")]
    Validation { feed: FeedKind, reason: String },

    /// Unreadable persisted entry. Treated as a cache miss after purge.
    #[error("corrupt cache entry for session {session_id}: {reason}")]
    CacheCorruption { session_id: String, reason: String },

    #[error("unknown session: {session_id}")]
    NotFound { session_id: String },

    /// A mandatory feed failed; the whole session fetch aborts.
    #[error("mandatory feed {feed} failed for {session_id}: {source}")]
    MandatoryFeedFailed {
        session_id: String,
        feed: FeedKind,
        #[source]
        source: Box<PipelineError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Human-readable suggestion for the caller, where one exists.
    pub fn retry_hint(&self) -> Option<&'static str> {
        match self {
            PipelineError::Fetch(FetchError::RateLimited { .. }) => {
                Some("the provider is throttling; wait a minute and retry")
            }
            PipelineError::MandatoryFeedFailed { .. } | PipelineError::Validation { .. } => Some(
                "try a different session - practice sessions have more complete data",
            ),
            PipelineError::CacheCorruption { .. } => {
                Some("the cached copy was purged; re-fetch the session")
            }
            _ => None,
        }
    }
}
