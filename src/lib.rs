//! gridflow: fetch, cache, and replay motor-racing session telemetry
//!
//! The pipeline pulls per-feed documents from a provider's static archive
//! (rate-limited and windowed), decodes the compressed feeds, normalizes
//! everything into a canonical session record, caches it in two tiers,
//! and replays the merged event timeline under cursor control.

pub mod cache;
pub mod config;
pub mod decompress;
pub mod dedupe;
pub mod error;
pub mod fetcher;
pub mod replay;
pub mod session;
pub mod timeline;
pub mod transform;
pub mod types;
