//! Runtime configuration from environment variables

use std::env;

/// Configuration for the fetch/cache/replay pipeline.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the provider's static telemetry archive
    pub base_url: String,

    /// Root directory for the persistent cache tier
    pub cache_dir: String,

    /// Memory-tier capacity (sessions)
    pub memory_capacity: usize,

    /// Persistent-tier capacity (sessions)
    pub disk_capacity: usize,

    /// Minimum delay between consecutive provider requests (ms)
    pub min_request_delay_ms: u64,

    /// Per-request timeout (seconds)
    pub fetch_timeout_secs: u64,

    /// Retry ceiling for rate-limit / transient failures
    pub max_retries: u32,

    /// Backoff base delay (ms), doubled per attempt
    pub backoff_base_ms: u64,

    /// Backoff delay cap (ms)
    pub backoff_max_ms: u64,

    /// Window size for high-volume feed fetches (minutes)
    pub fetch_window_minutes: i64,

    /// Minimum displacement (provider units) counting as movement for
    /// the quality check
    pub movement_threshold: f64,

    /// Replay scheduler tick cadence (ms)
    pub tick_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `GRIDFLOW_BASE_URL` (default: https://livetiming.example.com/static)
    /// - `GRIDFLOW_CACHE_DIR` (default: ./gridflow-cache)
    /// - `GRIDFLOW_MEMORY_CAPACITY` (default: 5)
    /// - `GRIDFLOW_DISK_CAPACITY` (default: 3)
    /// - `GRIDFLOW_MIN_REQUEST_DELAY_MS` (default: 500)
    /// - `GRIDFLOW_FETCH_TIMEOUT_SECS` (default: 15)
    /// - `GRIDFLOW_MAX_RETRIES` (default: 4)
    /// - `GRIDFLOW_BACKOFF_BASE_MS` (default: 1000)
    /// - `GRIDFLOW_BACKOFF_MAX_MS` (default: 10000)
    /// - `GRIDFLOW_FETCH_WINDOW_MINUTES` (default: 5)
    /// - `GRIDFLOW_MOVEMENT_THRESHOLD` (default: 1.0)
    /// - `GRIDFLOW_TICK_INTERVAL_MS` (default: 16)
    pub fn from_env() -> Self {
        Self {
            base_url: env::var("GRIDFLOW_BASE_URL")
                .unwrap_or_else(|_| "https://livetiming.example.com/static".to_string()),

            cache_dir: env::var("GRIDFLOW_CACHE_DIR")
                .unwrap_or_else(|_| "./gridflow-cache".to_string()),

            memory_capacity: parse_env("GRIDFLOW_MEMORY_CAPACITY", 5),
            disk_capacity: parse_env("GRIDFLOW_DISK_CAPACITY", 3),
            min_request_delay_ms: parse_env("GRIDFLOW_MIN_REQUEST_DELAY_MS", 500),
            fetch_timeout_secs: parse_env("GRIDFLOW_FETCH_TIMEOUT_SECS", 15),
            max_retries: parse_env("GRIDFLOW_MAX_RETRIES", 4),
            backoff_base_ms: parse_env("GRIDFLOW_BACKOFF_BASE_MS", 1_000),
            backoff_max_ms: parse_env("GRIDFLOW_BACKOFF_MAX_MS", 10_000),
            fetch_window_minutes: parse_env("GRIDFLOW_FETCH_WINDOW_MINUTES", 5),
            movement_threshold: parse_env("GRIDFLOW_MOVEMENT_THRESHOLD", 1.0),
            tick_interval_ms: parse_env("GRIDFLOW_TICK_INTERVAL_MS", 16),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Process env is shared across test threads; every test mutating it
    // holds this lock
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::remove_var("GRIDFLOW_MEMORY_CAPACITY");
        env::remove_var("GRIDFLOW_MIN_REQUEST_DELAY_MS");
        env::remove_var("GRIDFLOW_MOVEMENT_THRESHOLD");

        let config = Config::from_env();

        assert_eq!(config.memory_capacity, 5);
        assert_eq!(config.disk_capacity, 3);
        assert_eq!(config.min_request_delay_ms, 500);
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.backoff_max_ms, 10_000);
        assert_eq!(config.movement_threshold, 1.0);
        assert_eq!(config.tick_interval_ms, 16);
    }

    #[test]
    fn test_custom_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::set_var("GRIDFLOW_MEMORY_CAPACITY", "8");
        env::set_var("GRIDFLOW_MOVEMENT_THRESHOLD", "2.5");

        let config = Config::from_env();

        assert_eq!(config.memory_capacity, 8);
        assert_eq!(config.movement_threshold, 2.5);

        env::remove_var("GRIDFLOW_MEMORY_CAPACITY");
        env::remove_var("GRIDFLOW_MOVEMENT_THRESHOLD");
    }

    #[test]
    fn test_unparsable_value_falls_back_to_default() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::set_var("GRIDFLOW_DISK_CAPACITY", "not-a-number");
        let config = Config::from_env();
        assert_eq!(config.disk_capacity, 3);
        env::remove_var("GRIDFLOW_DISK_CAPACITY");
    }
}
