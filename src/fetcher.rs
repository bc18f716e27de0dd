//! Rate-limited provider fetching
//!
//! The provider archive is unauthenticated and aggressively throttled, so
//! all requests go through one `RateLimitedFetcher` instance: requests are
//! sequential with a minimum inter-request delay, rate-limit and transient
//! network failures retry with exponential backoff up to a ceiling, and
//! high-volume feeds are pulled in bounded time windows.
//!
//! `FeedSource` is the seam for tests: it performs exactly one attempt.

use crate::config::Config;
use crate::error::FetchError;
use crate::types::{FeedKind, RawFeedDocument};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// A single attempt against the provider. No pacing, no retries.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetch one feed document, optionally restricted to a
    /// `[start_ms, end_ms)` window for high-volume feeds.
    async fn fetch(
        &self,
        session_path: &str,
        feed: FeedKind,
        window: Option<(i64, i64)>,
    ) -> Result<RawFeedDocument, FetchError>;

    /// Fetch the per-year session index (sessions grouped by meeting).
    async fn fetch_index(&self, year: i32) -> Result<String, FetchError>;
}

/// Exponential backoff tracker for one request's retry sequence.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_retries,
            current_attempt: 0,
        }
    }

    /// Delay the next `sleep` call would wait: base doubled per attempt,
    /// capped at the maximum.
    pub fn next_delay_ms(&self) -> u64 {
        std::cmp::min(
            self.base_delay_ms
                .saturating_mul(2_u64.saturating_pow(self.current_attempt)),
            self.max_delay_ms,
        )
    }

    /// Retries consumed so far.
    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    /// Sleep before the next retry. Returns the delay slept, or `None`
    /// once the retry ceiling is reached.
    pub async fn sleep(&mut self) -> Option<u64> {
        if self.current_attempt >= self.max_retries {
            return None;
        }

        let delay = self.next_delay_ms();
        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay
        );

        sleep(Duration::from_millis(delay)).await;
        self.current_attempt += 1;
        Some(delay)
    }
}

/// Pacing + retry + windowing wrapper around a `FeedSource`.
///
/// One instance per process so pacing is global across feeds and
/// sessions, not per call site.
pub struct RateLimitedFetcher<S> {
    source: S,
    min_delay: Duration,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
    max_retries: u32,
    window_ms: i64,
    /// Instant of the last request issued. Held across the pacing sleep
    /// so concurrent callers serialize.
    last_request: Mutex<Option<Instant>>,
}

impl<S: FeedSource> RateLimitedFetcher<S> {
    pub fn new(source: S, config: &Config) -> Self {
        Self {
            source,
            min_delay: Duration::from_millis(config.min_request_delay_ms),
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
            max_retries: config.max_retries,
            window_ms: config.fetch_window_minutes * 60_000,
            last_request: Mutex::new(None),
        }
    }

    /// Fetch one non-windowed feed with pacing and retries.
    ///
    /// A `NotFound` on an optional feed yields an empty document; on a
    /// mandatory feed it propagates.
    pub async fn fetch_feed(
        &self,
        session_path: &str,
        feed: FeedKind,
    ) -> Result<RawFeedDocument, FetchError> {
        self.fetch_with_retry(session_path, feed, None).await
    }

    /// Fetch a high-volume feed as a sequence of bounded time windows
    /// covering `[start_ms, end_ms)`.
    ///
    /// Windows are returned in order; callers concatenate the decoded
    /// entry arrays. Empty windows are skipped.
    pub async fn fetch_feed_windows(
        &self,
        session_path: &str,
        feed: FeedKind,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<RawFeedDocument>, FetchError> {
        let mut docs = Vec::new();
        let mut cursor = start_ms;

        while cursor < end_ms {
            let window_end = std::cmp::min(cursor + self.window_ms, end_ms);
            let doc = self
                .fetch_with_retry(session_path, feed, Some((cursor, window_end)))
                .await?;
            if !doc.is_empty() {
                docs.push(doc);
            }
            cursor = window_end;
        }

        log::debug!(
            "📦 Fetched {} in {} window(s) of {}min",
            feed,
            docs.len(),
            self.window_ms / 60_000
        );
        Ok(docs)
    }

    /// Fetch the per-year session index with pacing and retries.
    pub async fn fetch_index(&self, year: i32) -> Result<String, FetchError> {
        let mut backoff =
            ExponentialBackoff::new(self.backoff_base_ms, self.backoff_max_ms, self.max_retries);

        loop {
            self.pace().await;
            match self.source.fetch_index(year).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() => {
                    if backoff.sleep().await.is_none() {
                        return Err(surface_exhausted(e, self.max_retries));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        session_path: &str,
        feed: FeedKind,
        window: Option<(i64, i64)>,
    ) -> Result<RawFeedDocument, FetchError> {
        let mut backoff =
            ExponentialBackoff::new(self.backoff_base_ms, self.backoff_max_ms, self.max_retries);

        loop {
            self.pace().await;
            match self.source.fetch(session_path, feed, window).await {
                Ok(doc) => return Ok(doc),
                Err(FetchError::NotFound { path }) => {
                    if feed.is_mandatory() {
                        return Err(FetchError::NotFound { path });
                    }
                    log::debug!("Optional feed {} not available, using empty result", feed);
                    return Ok(RawFeedDocument::empty(feed));
                }
                Err(e) if e.is_retryable() => {
                    if backoff.sleep().await.is_none() {
                        return Err(surface_exhausted(e, self.max_retries));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    /// Enforce the global minimum inter-request delay. The lock is held
    /// across the sleep so requests never overlap.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_delay {
                sleep(self.min_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Rewrite the final error once the retry ceiling is hit so it carries
/// the real attempt count.
fn surface_exhausted(err: FetchError, attempts: u32) -> FetchError {
    match err {
        FetchError::RateLimited { feed, .. } => FetchError::RateLimited { feed, attempts },
        other => other,
    }
}

/// HTTP implementation of `FeedSource` over the provider archive.
pub struct HttpFeedSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFeedSource {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(|e| FetchError::Network {
                feed: "client".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_text(&self, url: &str, feed: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network {
                feed: feed.to_string(),
                reason: if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    e.to_string()
                },
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited {
                feed: feed.to_string(),
                attempts: 1,
            });
        }
        if status.as_u16() == 404 {
            return Err(FetchError::NotFound {
                path: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Network {
                feed: feed.to_string(),
                reason: format!("provider returned {}", status),
            });
        }

        response.text().await.map_err(|e| FetchError::Network {
            feed: feed.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(
        &self,
        session_path: &str,
        feed: FeedKind,
        window: Option<(i64, i64)>,
    ) -> Result<RawFeedDocument, FetchError> {
        let mut url = format!(
            "{}/{}/{}",
            self.base_url,
            session_path.trim_matches('/'),
            feed.provider_name()
        );
        if let Some((start_ms, end_ms)) = window {
            url.push_str(&format!("?start={}&end={}", start_ms, end_ms));
        }

        let body = self.get_text(&url, feed.provider_name()).await?;
        Ok(RawFeedDocument { feed, body })
    }

    async fn fetch_index(&self, year: i32) -> Result<String, FetchError> {
        let url = format!("{}/{}/Index.json", self.base_url, year);
        self.get_text(&url, "Index.json").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Scripted feed source: pops one canned response per call and
    /// records when and with what arguments it was called.
    struct MockSource {
        responses: StdMutex<Vec<Result<RawFeedDocument, FetchError>>>,
        calls: StdMutex<Vec<(FeedKind, Option<(i64, i64)>, Instant)>>,
    }

    impl MockSource {
        fn new(responses: Vec<Result<RawFeedDocument, FetchError>>) -> Self {
            Self {
                responses: StdMutex::new(responses),
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl FeedSource for MockSource {
        async fn fetch(
            &self,
            _session_path: &str,
            feed: FeedKind,
            window: Option<(i64, i64)>,
        ) -> Result<RawFeedDocument, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((feed, window, Instant::now()));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(RawFeedDocument {
                    feed,
                    body: "{}".to_string(),
                })
            } else {
                responses.remove(0)
            }
        }

        async fn fetch_index(&self, _year: i32) -> Result<String, FetchError> {
            Ok("{}".to_string())
        }
    }

    fn rate_limited(feed: &str) -> FetchError {
        FetchError::RateLimited {
            feed: feed.to_string(),
            attempts: 1,
        }
    }

    fn test_config() -> Config {
        // Defaults; env is not consulted for the fields under test
        Config {
            base_url: "http://unused".to_string(),
            cache_dir: "/tmp/unused".to_string(),
            memory_capacity: 5,
            disk_capacity: 3,
            min_request_delay_ms: 500,
            fetch_timeout_secs: 15,
            max_retries: 4,
            backoff_base_ms: 1_000,
            backoff_max_ms: 10_000,
            fetch_window_minutes: 5,
            movement_threshold: 1.0,
            tick_interval_ms: 16,
        }
    }

    #[test]
    fn test_backoff_delays_increase_then_cap() {
        let mut backoff = ExponentialBackoff::new(1_000, 10_000, 8);

        let mut delays = Vec::new();
        for _ in 0..6 {
            delays.push(backoff.next_delay_ms());
            backoff.current_attempt += 1;
        }

        // 1s, 2s, 4s, 8s then capped at 10s
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_rate_limits_then_success() {
        // Backoff scenario: exactly 3 retries, 4th attempt succeeds
        let ok = RawFeedDocument {
            feed: FeedKind::Laps,
            body: "{}".to_string(),
        };
        let source = MockSource::new(vec![
            Err(rate_limited("TimingData.json")),
            Err(rate_limited("TimingData.json")),
            Err(rate_limited("TimingData.json")),
            Ok(ok),
        ]);
        let fetcher = RateLimitedFetcher::new(source, &test_config());

        let doc = fetcher.fetch_feed("2024/monaco/race", FeedKind::Laps).await;
        assert!(doc.is_ok());
        assert_eq!(fetcher.source.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_surfaces_rate_limited() {
        let source = MockSource::new(vec![
            Err(rate_limited("Position.z")),
            Err(rate_limited("Position.z")),
            Err(rate_limited("Position.z")),
            Err(rate_limited("Position.z")),
            Err(rate_limited("Position.z")),
        ]);
        let fetcher = RateLimitedFetcher::new(source, &test_config());

        let err = fetcher
            .fetch_feed("2024/monaco/race", FeedKind::Position)
            .await
            .unwrap_err();

        match err {
            FetchError::RateLimited { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected RateLimited, got {:?}", other),
        }
        // Ceiling of 4 retries means 5 attempts total
        assert_eq!(fetcher.source.call_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_network_failure_retried() {
        let ok = RawFeedDocument {
            feed: FeedKind::Weather,
            body: "{}".to_string(),
        };
        let source = MockSource::new(vec![
            Err(FetchError::Network {
                feed: "WeatherData.json".to_string(),
                reason: "request timed out".to_string(),
            }),
            Ok(ok),
        ]);
        let fetcher = RateLimitedFetcher::new(source, &test_config());

        let doc = fetcher
            .fetch_feed("2024/monaco/race", FeedKind::Weather)
            .await
            .unwrap();
        assert!(!doc.is_empty());
        assert_eq!(fetcher.source.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_feed_not_found_yields_empty() {
        let source = MockSource::new(vec![Err(FetchError::NotFound {
            path: "WeatherData.json".to_string(),
        })]);
        let fetcher = RateLimitedFetcher::new(source, &test_config());

        let doc = fetcher
            .fetch_feed("2024/monaco/race", FeedKind::Weather)
            .await
            .unwrap();
        assert!(doc.is_empty());
        // No retries for a 404
        assert_eq!(fetcher.source.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mandatory_feed_not_found_is_error() {
        let source = MockSource::new(vec![Err(FetchError::NotFound {
            path: "Position.z".to_string(),
        })]);
        let fetcher = RateLimitedFetcher::new(source, &test_config());

        let result = fetcher
            .fetch_feed("2024/monaco/race", FeedKind::Position)
            .await;
        assert!(matches!(result, Err(FetchError::NotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_delay_between_requests() {
        let source = MockSource::new(vec![]);
        let fetcher = RateLimitedFetcher::new(source, &test_config());

        fetcher
            .fetch_feed("2024/monaco/race", FeedKind::SessionInfo)
            .await
            .unwrap();
        fetcher
            .fetch_feed("2024/monaco/race", FeedKind::DriverList)
            .await
            .unwrap();
        fetcher
            .fetch_feed("2024/monaco/race", FeedKind::Laps)
            .await
            .unwrap();

        let calls = fetcher.source.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            let gap = pair[1].2.duration_since(pair[0].2);
            assert!(gap >= Duration::from_millis(500), "gap was {:?}", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_windowed_fetch_slices_and_concatenates() {
        let source = MockSource::new(vec![]);
        let fetcher = RateLimitedFetcher::new(source, &test_config());

        // 12 minutes of session, 5-minute windows: 3 slices
        let start = 1_716_728_400_000;
        let end = start + 12 * 60_000;
        let docs = fetcher
            .fetch_feed_windows("2024/monaco/race", FeedKind::Position, start, end)
            .await
            .unwrap();

        assert_eq!(docs.len(), 3);

        let calls = fetcher.source.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1, Some((start, start + 5 * 60_000)));
        assert_eq!(calls[1].1, Some((start + 5 * 60_000, start + 10 * 60_000)));
        // Final window is clamped to the session end
        assert_eq!(calls[2].1, Some((start + 10 * 60_000, end)));
    }
}
