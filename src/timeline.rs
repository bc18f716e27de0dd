//! Timeline construction
//!
//! Merges all of a canonical session's event and time-series feeds into a
//! single immutable, timestamp-ordered event stream. Static metadata
//! (roster, circuit) stays out of the stream and is exposed as a
//! `SessionContext` the replay engine consults separately.
//!
//! Equal timestamps are resolved by an explicit feed-priority order so
//! derived state is deterministic: state-defining feeds (track status,
//! race control) apply before the telemetry they contextualize. The merge
//! is stable, so within one feed the original relative order survives.

use crate::types::{
    CanonicalSession, Driver, FeedKind, LapEvent, RaceControlMessage, SessionMeta,
    TelemetrySample, TrackStatusEvent, WeatherSample,
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventPayload {
    TrackStatus(TrackStatusEvent),
    RaceControl(RaceControlMessage),
    Lap(LapEvent),
    Weather(WeatherSample),
    Position(TelemetrySample),
    Car(TelemetrySample),
}

/// One merged timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    pub timestamp_ms: i64,
    pub feed: FeedKind,
    pub payload: EventPayload,
}

/// Static per-session data excluded from the event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionContext {
    pub meta: SessionMeta,
    pub drivers: Vec<Driver>,
}

/// Immutable merged event stream. Finite, restartable, deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    events: Vec<TimelineEvent>,
    start_ms: i64,
    end_ms: i64,
}

impl Timeline {
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.end_ms
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_ms - self.start_ms).max(0)
    }
}

/// Builds timelines with a configurable feed tie-break order.
pub struct TimelineBuilder {
    priority: Vec<FeedKind>,
}

impl TimelineBuilder {
    pub fn new() -> Self {
        Self {
            priority: vec![
                FeedKind::TrackStatus,
                FeedKind::RaceControl,
                FeedKind::Laps,
                FeedKind::Weather,
                FeedKind::Position,
                FeedKind::CarData,
            ],
        }
    }

    /// Override the tie-break order. Feeds absent from `order` fall back
    /// to their default priority, after all listed feeds.
    pub fn with_priority(mut self, order: Vec<FeedKind>) -> Self {
        self.priority = order;
        self
    }

    /// Merge the session's feeds into one ordered event stream plus the
    /// static context.
    pub fn build(&self, session: &CanonicalSession) -> (SessionContext, Timeline) {
        let context = SessionContext {
            meta: session.meta.clone(),
            drivers: session.drivers.clone(),
        };

        let mut events: Vec<TimelineEvent> = Vec::with_capacity(
            session.track_status.len()
                + session.race_control.len()
                + session.laps.len()
                + session.weather.len()
                + session.positions.len()
                + session.car_data.len(),
        );

        events.extend(session.track_status.iter().map(|e| TimelineEvent {
            timestamp_ms: e.timestamp_ms,
            feed: FeedKind::TrackStatus,
            payload: EventPayload::TrackStatus(e.clone()),
        }));
        events.extend(session.race_control.iter().map(|e| TimelineEvent {
            timestamp_ms: e.timestamp_ms,
            feed: FeedKind::RaceControl,
            payload: EventPayload::RaceControl(e.clone()),
        }));
        events.extend(session.laps.iter().map(|e| TimelineEvent {
            timestamp_ms: e.timestamp_ms,
            feed: FeedKind::Laps,
            payload: EventPayload::Lap(e.clone()),
        }));
        events.extend(session.weather.iter().map(|e| TimelineEvent {
            timestamp_ms: e.timestamp_ms,
            feed: FeedKind::Weather,
            payload: EventPayload::Weather(e.clone()),
        }));
        events.extend(session.positions.iter().map(|e| TimelineEvent {
            timestamp_ms: e.timestamp_ms,
            feed: FeedKind::Position,
            payload: EventPayload::Position(e.clone()),
        }));
        events.extend(session.car_data.iter().map(|e| TimelineEvent {
            timestamp_ms: e.timestamp_ms,
            feed: FeedKind::CarData,
            payload: EventPayload::Car(e.clone()),
        }));

        // Stable sort: per-feed relative order survives equal keys
        events.sort_by_key(|e| (e.timestamp_ms, self.rank(e.feed)));

        log::debug!(
            "🧭 Built timeline for {}: {} events",
            session.meta.session_id,
            events.len()
        );

        (
            context,
            Timeline {
                events,
                start_ms: session.meta.start_ms,
                end_ms: session.meta.end_ms,
            },
        )
    }

    fn rank(&self, feed: FeedKind) -> usize {
        self.priority
            .iter()
            .position(|&f| f == feed)
            .unwrap_or(self.priority.len() + feed.priority() as usize)
    }
}

impl Default for TimelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
