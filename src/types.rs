//! Canonical data model for normalized sessions
//!
//! Everything downstream of the transformer works on these types only.
//! Provider-specific shapes never leave `transform.rs`.

use serde::{Deserialize, Serialize};

/// Opaque provider session key, e.g.
/// `2024/2024-05-26_Monaco_Grand_Prix/2024-05-26_Race`
pub type SessionId = String;

/// The feeds the provider exposes for one session.
///
/// `Position` and `CarData` are compressed on the wire (base64 + raw
/// deflate, `.z` suffix); the rest are plain JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedKind {
    SessionInfo,
    DriverList,
    TrackStatus,
    RaceControl,
    Laps,
    Weather,
    Position,
    CarData,
}

impl FeedKind {
    /// Provider file name for this feed.
    pub fn provider_name(&self) -> &'static str {
        match self {
            FeedKind::SessionInfo => "SessionInfo.json",
            FeedKind::DriverList => "DriverList.json",
            FeedKind::TrackStatus => "TrackStatus.json",
            FeedKind::RaceControl => "RaceControlMessages.json",
            FeedKind::Laps => "TimingData.json",
            FeedKind::Weather => "WeatherData.json",
            FeedKind::Position => "Position.z",
            FeedKind::CarData => "CarData.z",
        }
    }

    /// A session without a mandatory feed is unusable and the whole
    /// fetch aborts; optional feeds degrade to empty series.
    pub fn is_mandatory(&self) -> bool {
        matches!(
            self,
            FeedKind::SessionInfo | FeedKind::DriverList | FeedKind::Position
        )
    }

    /// High-volume feeds are fetched in bounded time windows.
    pub fn is_windowed(&self) -> bool {
        matches!(self, FeedKind::Position | FeedKind::CarData)
    }

    /// Tie-break order for simultaneous timeline events: state-defining
    /// feeds first so derived state is deterministic.
    pub fn priority(&self) -> u8 {
        match self {
            FeedKind::TrackStatus => 0,
            FeedKind::RaceControl => 1,
            FeedKind::Laps => 2,
            FeedKind::Weather => 3,
            FeedKind::Position => 4,
            FeedKind::CarData => 5,
            // Static feeds never appear in the event stream
            FeedKind::SessionInfo | FeedKind::DriverList => u8::MAX,
        }
    }

    /// All feeds fetched for a full session, in fetch order.
    pub fn session_feeds() -> [FeedKind; 8] {
        [
            FeedKind::SessionInfo,
            FeedKind::DriverList,
            FeedKind::TrackStatus,
            FeedKind::RaceControl,
            FeedKind::Laps,
            FeedKind::Weather,
            FeedKind::Position,
            FeedKind::CarData,
        ]
    }
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.provider_name())
    }
}

/// Raw per-feed payload as fetched, before decompression.
#[derive(Debug, Clone)]
pub struct RawFeedDocument {
    pub feed: FeedKind,
    /// Raw body text. Empty for optional feeds the provider does not have.
    pub body: String,
}

impl RawFeedDocument {
    pub fn empty(feed: FeedKind) -> Self {
        Self {
            feed,
            body: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }
}

/// Tagged telemetry payload. Dedup compares these value-wise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleValues {
    Position { x: f64, y: f64, z: f64 },
    Car {
        speed: f64,
        rpm: f64,
        throttle: f64,
        brake: f64,
        gear: i32,
        drs_open: bool,
    },
}

/// One sampled telemetry reading for one driver at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub driver_number: u32,
    /// UTC epoch milliseconds.
    pub timestamp_ms: i64,
    pub values: SampleValues,
}

/// Completed lap for one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapEvent {
    pub driver_number: u32,
    pub timestamp_ms: i64,
    pub lap_number: u32,
    /// None for laps without a representative time (in/out laps).
    pub lap_time_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSample {
    pub timestamp_ms: i64,
    pub air_temp_c: f64,
    pub track_temp_c: f64,
    pub humidity_pct: f64,
    pub wind_speed_ms: f64,
    pub rainfall: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceControlMessage {
    pub timestamp_ms: i64,
    pub category: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackStatusEvent {
    pub timestamp_ms: i64,
    /// Provider status code ("1" green, "2" yellow, "4" safety car, ...).
    pub status: String,
    pub label: String,
}

/// Roster entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub number: u32,
    pub tla: String,
    pub name: String,
    pub team: String,
}

/// Session metadata, static for the whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: SessionId,
    pub name: String,
    pub circuit: String,
    pub year: i32,
    pub session_type: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl SessionMeta {
    pub fn duration_ms(&self) -> i64 {
        (self.end_ms - self.start_ms).max(0)
    }
}

/// The normalized, provider-independent session record.
///
/// Invariants (enforced by the transformer):
/// - every timestamp falls within `[meta.start_ms, meta.end_ms]`
/// - every driver number referenced by a series exists in `drivers`
/// - `positions` and `car_data` are deduplicated per driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSession {
    pub meta: SessionMeta,
    pub drivers: Vec<Driver>,
    pub positions: Vec<TelemetrySample>,
    pub car_data: Vec<TelemetrySample>,
    pub laps: Vec<LapEvent>,
    pub weather: Vec<WeatherSample>,
    pub race_control: Vec<RaceControlMessage>,
    pub track_status: Vec<TrackStatusEvent>,
}

/// Cache manifest: the authoritative existence check for a persisted
/// session, plus the metadata `list_sessions` reports without touching
/// the data files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: SessionId,
    pub name: String,
    pub circuit: String,
    pub year: i32,
    pub session_type: String,
    pub size_bytes: u64,
    /// UTC epoch milliseconds of the last load or save.
    pub last_access_ms: i64,
}

/// Entry returned by `list_sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub name: String,
    pub circuit: String,
    pub year: i32,
    pub session_type: String,
    pub cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_sessions: usize,
    pub total_size_mb: f64,
    pub max_sessions: usize,
}

/// Coarse rating of how usable a session's position data is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityTier {
    Insufficient,
    Poor,
    Fair,
    Good,
    Great,
    Excellent,
}

impl QualityTier {
    pub fn stars(&self) -> u8 {
        match self {
            QualityTier::Insufficient => 0,
            QualityTier::Poor => 1,
            QualityTier::Fair => 2,
            QualityTier::Good => 3,
            QualityTier::Great => 4,
            QualityTier::Excellent => 5,
        }
    }
}

/// Verdict of `validate_quality`. Insufficient data is a verdict here,
/// never an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub valid: bool,
    pub snapshot_count: usize,
    pub tier: QualityTier,
    pub stars: u8,
}
