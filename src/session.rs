//! Session API
//!
//! `SessionService` ties the pipeline together: fetch every feed of a
//! session through the rate-limited fetcher, decode, normalize, persist
//! in the two-tier cache, and hand the canonical session to callers.
//!
//! Fetches are single-flight per session id: concurrent callers for the
//! same uncached session coalesce onto one provider fetch, and the rest
//! are served from the cache once it lands.

use crate::cache::CacheStore;
use crate::config::Config;
use crate::decompress::decode;
use crate::error::{FetchError, PipelineError};
use crate::fetcher::{FeedSource, RateLimitedFetcher};
use crate::transform::{merge_windows, normalize, parse_utc_ms, ProviderDocs};
use crate::types::{
    CacheStats, CanonicalSession, FeedKind, QualityReport, QualityTier, SampleValues,
    SessionSummary,
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// Per-year provider index: sessions grouped by meeting.
#[derive(Debug, Deserialize)]
struct IndexDoc {
    #[serde(rename = "Meetings")]
    meetings: Vec<IndexMeeting>,
}

#[derive(Debug, Deserialize)]
struct IndexMeeting {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Circuit", default)]
    circuit: Option<IndexCircuit>,
    #[serde(rename = "Sessions")]
    sessions: Vec<IndexSession>,
}

#[derive(Debug, Deserialize)]
struct IndexCircuit {
    #[serde(rename = "ShortName")]
    short_name: String,
}

#[derive(Debug, Deserialize)]
struct IndexSession {
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Type")]
    session_type: String,
}

/// The public surface of the pipeline.
pub struct SessionService<S> {
    config: Config,
    fetcher: RateLimitedFetcher<S>,
    cache: CacheStore,
    /// One gate per session id so concurrent fetches of the same session
    /// coalesce. Gates are tiny and reused, so the map is never pruned.
    inflight: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: FeedSource> SessionService<S> {
    pub fn new(source: S, config: Config) -> Result<Self, PipelineError> {
        Ok(Self {
            fetcher: RateLimitedFetcher::new(source, &config),
            cache: CacheStore::new(&config)?,
            inflight: StdMutex::new(HashMap::new()),
            config,
        })
    }

    /// Return the canonical session, fetching and caching it on a miss.
    ///
    /// Concurrent callers for the same uncached session trigger exactly
    /// one provider fetch.
    pub async fn fetch_and_cache(&self, session_id: &str) -> Result<CanonicalSession, PipelineError> {
        if let Some(session) = self.cache.load(session_id) {
            log::debug!("Cache hit for {}", session_id);
            return Ok(session);
        }

        let gate = self.flight_gate(session_id);
        let _guard = gate.lock().await;

        // Another caller may have landed the session while we waited
        if let Some(session) = self.cache.load(session_id) {
            return Ok(session);
        }

        log::info!("📡 Fetching session {}", session_id);
        let session = self.fetch_session(session_id).await?;
        self.cache.save(session_id, &session)?;
        Ok(session)
    }

    /// Load a previously cached session without touching the provider.
    pub fn load_cached(&self, session_id: &str) -> Result<CanonicalSession, PipelineError> {
        self.cache.load(session_id).ok_or_else(|| PipelineError::NotFound {
            session_id: session_id.to_string(),
        })
    }

    /// Cached sessions, optionally merged with the provider's index for
    /// one year. Provider-only entries are marked uncached.
    pub async fn list_sessions(
        &self,
        year: Option<i32>,
    ) -> Result<Vec<SessionSummary>, PipelineError> {
        let mut summaries = self.cache.list_sessions();

        if let Some(year) = year {
            let body = self.fetcher.fetch_index(year).await?;
            let index: IndexDoc = serde_json::from_str(&body)?;

            let known: HashSet<String> =
                summaries.iter().map(|s| s.session_id.clone()).collect();
            for meeting in index.meetings {
                let circuit = meeting
                    .circuit
                    .as_ref()
                    .map(|c| c.short_name.clone())
                    .unwrap_or_default();
                for entry in meeting.sessions {
                    if known.contains(&entry.path) {
                        continue;
                    }
                    summaries.push(SessionSummary {
                        session_id: entry.path,
                        name: meeting.name.clone(),
                        circuit: circuit.clone(),
                        year,
                        session_type: entry.session_type,
                        cached: false,
                    });
                }
            }
            summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        }

        Ok(summaries)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Rate the position-data quality of a session, fetching it first if
    /// needed. Thin data is a verdict, never an error.
    pub async fn validate_quality(&self, session_id: &str) -> Result<QualityReport, PipelineError> {
        let session = self.fetch_and_cache(session_id).await?;
        Ok(assess_quality(&session, self.config.movement_threshold))
    }

    fn flight_gate(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.inflight
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Fetch and decode every feed, then normalize. SessionInfo goes
    /// first: the high-volume feeds need its time range for windowing.
    async fn fetch_session(&self, session_id: &str) -> Result<CanonicalSession, PipelineError> {
        let mut docs = ProviderDocs::new();

        let raw = self
            .fetcher
            .fetch_feed(session_id, FeedKind::SessionInfo)
            .await
            .map_err(|e| self.wrap_fetch(session_id, FeedKind::SessionInfo, e))?;
        let info = decode(&raw)
            .map_err(|e| mandatory_failure(session_id, FeedKind::SessionInfo, e))?;

        let (start_ms, end_ms) = session_range(&info).ok_or_else(|| {
            mandatory_failure(
                session_id,
                FeedKind::SessionInfo,
                PipelineError::Validation {
                    feed: FeedKind::SessionInfo,
                    reason: "missing or unparsable StartDate/EndDate".to_string(),
                },
            )
        })?;
        docs.insert(FeedKind::SessionInfo, info);

        for feed in FeedKind::session_feeds().into_iter().skip(1) {
            let value = if feed.is_windowed() {
                let raws = self
                    .fetcher
                    .fetch_feed_windows(session_id, feed, start_ms, end_ms)
                    .await
                    .map_err(|e| self.wrap_fetch(session_id, feed, e))?;

                let mut windows = Vec::with_capacity(raws.len());
                for raw in &raws {
                    match decode(raw) {
                        Ok(v) => windows.push(v),
                        Err(e) if feed.is_mandatory() => {
                            return Err(mandatory_failure(session_id, feed, e))
                        }
                        Err(e) => {
                            log::warn!("⚠️  Skipping undecodable window of {}: {}", feed, e);
                        }
                    }
                }
                merge_windows(feed, windows)
            } else {
                let raw = self
                    .fetcher
                    .fetch_feed(session_id, feed)
                    .await
                    .map_err(|e| self.wrap_fetch(session_id, feed, e))?;
                match decode(&raw) {
                    Ok(v) => v,
                    Err(e) if feed.is_mandatory() => {
                        return Err(mandatory_failure(session_id, feed, e))
                    }
                    Err(e) => {
                        log::warn!("⚠️  Skipping undecodable optional feed {}: {}", feed, e);
                        serde_json::Value::Null
                    }
                }
            };
            docs.insert(feed, value);
        }

        normalize(session_id, &docs).map_err(|e| match e {
            PipelineError::Validation { feed, reason } if feed.is_mandatory() => mandatory_failure(
                session_id,
                feed,
                PipelineError::Validation { feed, reason },
            ),
            other => other,
        })
    }

    fn wrap_fetch(&self, session_id: &str, feed: FeedKind, err: FetchError) -> PipelineError {
        let inner = PipelineError::from(err);
        if feed.is_mandatory() {
            mandatory_failure(session_id, feed, inner)
        } else {
            inner
        }
    }
}

fn mandatory_failure(session_id: &str, feed: FeedKind, source: PipelineError) -> PipelineError {
    PipelineError::MandatoryFeedFailed {
        session_id: session_id.to_string(),
        feed,
        source: Box::new(source),
    }
}

/// Extract the session time range from a decoded SessionInfo document.
fn session_range(info: &serde_json::Value) -> Option<(i64, i64)> {
    let start = parse_utc_ms(info.get("StartDate")?.as_str()?)?;
    let end = parse_utc_ms(info.get("EndDate")?.as_str()?)?;
    Some((start, end))
}

/// Rate a session's position data.
///
/// Fewer than two snapshots, or no driver displacing at least
/// `movement_threshold` between consecutive samples, is insufficient for
/// replay. Above that, the tier scales with snapshot volume.
pub fn assess_quality(session: &CanonicalSession, movement_threshold: f64) -> QualityReport {
    let count = session.positions.len();
    let moved = has_movement(&session.positions, movement_threshold);

    let tier = if count < 2 || !moved {
        QualityTier::Insufficient
    } else if count < 10 {
        QualityTier::Poor
    } else if count < 50 {
        QualityTier::Fair
    } else if count < 100 {
        QualityTier::Good
    } else if count < 200 {
        QualityTier::Great
    } else {
        QualityTier::Excellent
    };

    QualityReport {
        valid: tier != QualityTier::Insufficient,
        snapshot_count: count,
        tier,
        stars: tier.stars(),
    }
}

/// Whether any driver moved at least `threshold` (Euclidean, provider
/// units) between two consecutive samples.
fn has_movement(samples: &[crate::types::TelemetrySample], threshold: f64) -> bool {
    let mut last: HashMap<u32, (f64, f64, f64)> = HashMap::new();
    for sample in samples {
        if let SampleValues::Position { x, y, z } = sample.values {
            if let Some((px, py, pz)) = last.insert(sample.driver_number, (x, y, z)) {
                let dist =
                    ((x - px).powi(2) + (y - py).powi(2) + (z - pz).powi(2)).sqrt();
                if dist >= threshold {
                    return true;
                }
            }
        }
    }
    false
}
