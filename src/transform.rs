//! Provider schema normalization
//!
//! Maps the provider's loosely-typed per-feed documents into the canonical
//! session record. Every provider shape is an explicit serde struct here;
//! documents that do not match are rejected (mandatory feeds) or skipped
//! with a warning (optional feeds) instead of leaking through.
//!
//! Telemetry series are deduplicated on the way in, samples referencing
//! drivers missing from the roster are dropped with a warning, and samples
//! outside the session's [start, end] range are dropped.

use crate::dedupe::{dedupe, reduction_pct};
use crate::error::PipelineError;
use crate::types::{
    CanonicalSession, Driver, FeedKind, LapEvent, RaceControlMessage, SampleValues, SessionMeta,
    TelemetrySample, TrackStatusEvent, WeatherSample,
};
use chrono::{DateTime, Datelike};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// Decoded documents for one session, keyed by feed.
pub type ProviderDocs = HashMap<FeedKind, serde_json::Value>;

// ---- provider wire shapes ----

#[derive(Debug, Deserialize)]
struct SessionInfoDoc {
    #[serde(rename = "Meeting")]
    meeting: MeetingDoc,
    #[serde(rename = "Type")]
    session_type: String,
    #[serde(rename = "StartDate")]
    start_date: String,
    #[serde(rename = "EndDate")]
    end_date: String,
}

#[derive(Debug, Deserialize)]
struct MeetingDoc {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Circuit")]
    circuit: CircuitDoc,
}

#[derive(Debug, Deserialize)]
struct CircuitDoc {
    #[serde(rename = "ShortName")]
    short_name: String,
}

#[derive(Debug, Deserialize)]
struct DriverEntry {
    #[serde(rename = "RacingNumber")]
    racing_number: String,
    #[serde(rename = "BroadcastName")]
    broadcast_name: String,
    #[serde(rename = "Tla")]
    tla: String,
    #[serde(rename = "TeamName")]
    team_name: String,
}

#[derive(Debug, Deserialize)]
struct PositionDoc {
    #[serde(rename = "Position")]
    position: Vec<PositionFrame>,
}

#[derive(Debug, Deserialize)]
struct PositionFrame {
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "Entries")]
    entries: HashMap<String, PositionEntry>,
}

#[derive(Debug, Deserialize)]
struct PositionEntry {
    #[serde(rename = "X")]
    x: f64,
    #[serde(rename = "Y")]
    y: f64,
    #[serde(rename = "Z")]
    z: f64,
}

#[derive(Debug, Deserialize)]
struct CarDataDoc {
    #[serde(rename = "Entries")]
    entries: Vec<CarDataFrame>,
}

#[derive(Debug, Deserialize)]
struct CarDataFrame {
    #[serde(rename = "Utc")]
    utc: String,
    #[serde(rename = "Cars")]
    cars: HashMap<String, CarEntry>,
}

#[derive(Debug, Deserialize)]
struct CarEntry {
    /// Channel map: 0=RPM, 2=speed, 3=gear, 4=throttle, 5=brake, 45=DRS
    #[serde(rename = "Channels")]
    channels: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct TimingDoc {
    #[serde(rename = "Laps")]
    laps: Vec<LapEntry>,
}

#[derive(Debug, Deserialize)]
struct LapEntry {
    #[serde(rename = "DriverNumber")]
    driver_number: String,
    #[serde(rename = "Utc")]
    utc: String,
    #[serde(rename = "LapNumber")]
    lap_number: u32,
    #[serde(rename = "LapTime")]
    lap_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WeatherDoc {
    #[serde(rename = "Entries")]
    entries: Vec<WeatherEntry>,
}

#[derive(Debug, Deserialize)]
struct WeatherEntry {
    #[serde(rename = "Utc")]
    utc: String,
    #[serde(rename = "AirTemp")]
    air_temp: String,
    #[serde(rename = "TrackTemp")]
    track_temp: String,
    #[serde(rename = "Humidity")]
    humidity: String,
    #[serde(rename = "WindSpeed")]
    wind_speed: String,
    #[serde(rename = "Rainfall")]
    rainfall: String,
}

#[derive(Debug, Deserialize)]
struct RaceControlDoc {
    #[serde(rename = "Messages")]
    messages: Vec<RaceControlEntry>,
}

#[derive(Debug, Deserialize)]
struct RaceControlEntry {
    #[serde(rename = "Utc")]
    utc: String,
    #[serde(rename = "Category")]
    category: String,
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TrackStatusDoc {
    #[serde(rename = "Statuses")]
    statuses: Vec<TrackStatusEntry>,
}

#[derive(Debug, Deserialize)]
struct TrackStatusEntry {
    #[serde(rename = "Utc")]
    utc: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Message")]
    message: String,
}

// ---- normalization ----

/// Normalize decoded provider documents into a canonical session.
///
/// Mandatory feeds (`SessionInfo`, `DriverList`, `Position.z`) must be
/// present and well-formed. Optional feeds that are missing, null, or
/// malformed yield empty series; the canonical output for the feeds that
/// are present is identical regardless of which optional feeds exist.
pub fn normalize(session_id: &str, docs: &ProviderDocs) -> Result<CanonicalSession, PipelineError> {
    let info: SessionInfoDoc = parse_mandatory(docs, FeedKind::SessionInfo)?;

    let start_ms = parse_utc_ms(&info.start_date).ok_or_else(|| PipelineError::Validation {
        feed: FeedKind::SessionInfo,
        reason: format!("unparsable StartDate: {}", info.start_date),
    })?;
    let end_ms = parse_utc_ms(&info.end_date).ok_or_else(|| PipelineError::Validation {
        feed: FeedKind::SessionInfo,
        reason: format!("unparsable EndDate: {}", info.end_date),
    })?;
    if end_ms < start_ms {
        return Err(PipelineError::Validation {
            feed: FeedKind::SessionInfo,
            reason: "EndDate precedes StartDate".to_string(),
        });
    }

    let year = DateTime::from_timestamp_millis(start_ms)
        .map(|dt| dt.year())
        .unwrap_or(0);

    let meta = SessionMeta {
        session_id: session_id.to_string(),
        name: info.meeting.name,
        circuit: info.meeting.circuit.short_name,
        year,
        session_type: info.session_type,
        start_ms,
        end_ms,
    };

    let driver_map: HashMap<String, DriverEntry> = parse_mandatory(docs, FeedKind::DriverList)?;
    let mut drivers: Vec<Driver> = driver_map
        .values()
        .filter_map(|d| {
            let number = d.racing_number.parse().ok()?;
            Some(Driver {
                number,
                tla: d.tla.clone(),
                name: d.broadcast_name.clone(),
                team: d.team_name.clone(),
            })
        })
        .collect();
    drivers.sort_by_key(|d| d.number);

    let roster: HashSet<u32> = drivers.iter().map(|d| d.number).collect();

    let positions = normalize_positions(docs, &meta, &roster)?;
    let car_data = normalize_car_data(docs, &meta, &roster);
    let laps = normalize_laps(docs, &meta, &roster);
    let weather = normalize_weather(docs, &meta);
    let race_control = normalize_race_control(docs, &meta);
    let track_status = normalize_track_status(docs, &meta);

    Ok(CanonicalSession {
        meta,
        drivers,
        positions,
        car_data,
        laps,
        weather,
        race_control,
        track_status,
    })
}

/// Concatenate the decoded windows of a high-volume feed into a single
/// document, preserving window order. Null windows are skipped.
pub fn merge_windows(feed: FeedKind, windows: Vec<serde_json::Value>) -> serde_json::Value {
    let key = match feed {
        FeedKind::Position => "Position",
        FeedKind::CarData => "Entries",
        _ => return windows.into_iter().next().unwrap_or(serde_json::Value::Null),
    };

    let mut merged = Vec::new();
    for window in windows {
        if let Some(entries) = window.get(key).and_then(|v| v.as_array()) {
            merged.extend(entries.iter().cloned());
        }
    }

    if merged.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::json!({ key: merged })
    }
}

fn parse_mandatory<T: serde::de::DeserializeOwned>(
    docs: &ProviderDocs,
    feed: FeedKind,
) -> Result<T, PipelineError> {
    let value = docs
        .get(&feed)
        .filter(|v| !v.is_null())
        .ok_or_else(|| PipelineError::Validation {
            feed,
            reason: "document missing".to_string(),
        })?;

    serde_json::from_value(value.clone()).map_err(|e| PipelineError::Validation {
        feed,
        reason: e.to_string(),
    })
}

/// Parse an optional feed document. Missing, null, or malformed documents
/// yield None with a warning for the malformed case.
fn parse_optional<T: serde::de::DeserializeOwned>(docs: &ProviderDocs, feed: FeedKind) -> Option<T> {
    let value = docs.get(&feed).filter(|v| !v.is_null())?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            log::warn!("⚠️  Skipping malformed optional feed {}: {}", feed, e);
            None
        }
    }
}

fn normalize_positions(
    docs: &ProviderDocs,
    meta: &SessionMeta,
    roster: &HashSet<u32>,
) -> Result<Vec<TelemetrySample>, PipelineError> {
    let doc: PositionDoc = parse_mandatory(docs, FeedKind::Position)?;

    let mut samples = Vec::new();
    let mut dropped_unknown = 0usize;
    let mut dropped_time = 0usize;

    for frame in &doc.position {
        let Some(ts) = parse_utc_ms(&frame.timestamp) else {
            dropped_time += 1;
            continue;
        };
        if ts < meta.start_ms || ts > meta.end_ms {
            dropped_time += 1;
            continue;
        }
        for (number, entry) in &frame.entries {
            let Ok(driver_number) = number.parse::<u32>() else {
                dropped_unknown += 1;
                continue;
            };
            if !roster.contains(&driver_number) {
                dropped_unknown += 1;
                continue;
            }
            samples.push(TelemetrySample {
                driver_number,
                timestamp_ms: ts,
                values: SampleValues::Position {
                    x: entry.x,
                    y: entry.y,
                    z: entry.z,
                },
            });
        }
    }

    if dropped_unknown > 0 {
        log::warn!(
            "⚠️  Dropped {} position samples for drivers not in roster",
            dropped_unknown
        );
    }
    if dropped_time > 0 {
        log::debug!("Dropped {} position samples outside session range", dropped_time);
    }

    // Per-frame entry maps iterate in hash order; the driver number in the
    // sort key keeps same-timestamp samples in a stable order regardless
    samples.sort_by_key(|s| (s.timestamp_ms, s.driver_number));
    let before = samples.len();
    let deduped = dedupe(samples);
    log::info!(
        "📉 Position dedup: {} -> {} samples ({:.1}% reduction)",
        before,
        deduped.len(),
        reduction_pct(before, deduped.len())
    );
    Ok(deduped)
}

fn normalize_car_data(
    docs: &ProviderDocs,
    meta: &SessionMeta,
    roster: &HashSet<u32>,
) -> Vec<TelemetrySample> {
    let Some(doc) = parse_optional::<CarDataDoc>(docs, FeedKind::CarData) else {
        return Vec::new();
    };

    let mut samples = Vec::new();
    let mut dropped_unknown = 0usize;

    for frame in &doc.entries {
        let Some(ts) = parse_utc_ms(&frame.utc) else {
            continue;
        };
        if ts < meta.start_ms || ts > meta.end_ms {
            continue;
        }
        for (number, car) in &frame.cars {
            let Ok(driver_number) = number.parse::<u32>() else {
                dropped_unknown += 1;
                continue;
            };
            if !roster.contains(&driver_number) {
                dropped_unknown += 1;
                continue;
            }

            let channel = |k: &str| car.channels.get(k).copied().unwrap_or(0.0);
            // DRS channel: 10/12/14 are the open states
            let drs = channel("45") as i64;

            samples.push(TelemetrySample {
                driver_number,
                timestamp_ms: ts,
                values: SampleValues::Car {
                    rpm: channel("0"),
                    speed: channel("2"),
                    gear: channel("3") as i32,
                    throttle: channel("4"),
                    brake: channel("5"),
                    drs_open: matches!(drs, 10 | 12 | 14),
                },
            });
        }
    }

    if dropped_unknown > 0 {
        log::warn!(
            "⚠️  Dropped {} car samples for drivers not in roster",
            dropped_unknown
        );
    }

    samples.sort_by_key(|s| (s.timestamp_ms, s.driver_number));
    let before = samples.len();
    let deduped = dedupe(samples);
    if before > 0 {
        log::info!(
            "📉 Car data dedup: {} -> {} samples ({:.1}% reduction)",
            before,
            deduped.len(),
            reduction_pct(before, deduped.len())
        );
    }
    deduped
}

fn normalize_laps(docs: &ProviderDocs, meta: &SessionMeta, roster: &HashSet<u32>) -> Vec<LapEvent> {
    let Some(doc) = parse_optional::<TimingDoc>(docs, FeedKind::Laps) else {
        return Vec::new();
    };

    let mut laps: Vec<LapEvent> = doc
        .laps
        .iter()
        .filter_map(|l| {
            let driver_number = l.driver_number.parse().ok()?;
            if !roster.contains(&driver_number) {
                log::warn!("⚠️  Dropping lap for unknown driver {}", l.driver_number);
                return None;
            }
            let ts = parse_utc_ms(&l.utc)?;
            if ts < meta.start_ms || ts > meta.end_ms {
                return None;
            }
            Some(LapEvent {
                driver_number,
                timestamp_ms: ts,
                lap_number: l.lap_number,
                lap_time_ms: l.lap_time.as_deref().and_then(parse_lap_time_ms),
            })
        })
        .collect();

    laps.sort_by_key(|l| l.timestamp_ms);
    laps
}

fn normalize_weather(docs: &ProviderDocs, meta: &SessionMeta) -> Vec<WeatherSample> {
    let Some(doc) = parse_optional::<WeatherDoc>(docs, FeedKind::Weather) else {
        return Vec::new();
    };

    let mut samples: Vec<WeatherSample> = doc
        .entries
        .iter()
        .filter_map(|w| {
            let ts = parse_utc_ms(&w.utc)?;
            if ts < meta.start_ms || ts > meta.end_ms {
                return None;
            }
            Some(WeatherSample {
                timestamp_ms: ts,
                air_temp_c: w.air_temp.parse().unwrap_or(0.0),
                track_temp_c: w.track_temp.parse().unwrap_or(0.0),
                humidity_pct: w.humidity.parse().unwrap_or(0.0),
                wind_speed_ms: w.wind_speed.parse().unwrap_or(0.0),
                rainfall: w.rainfall.trim() != "0" && !w.rainfall.trim().is_empty(),
            })
        })
        .collect();

    samples.sort_by_key(|w| w.timestamp_ms);
    samples
}

fn normalize_race_control(docs: &ProviderDocs, meta: &SessionMeta) -> Vec<RaceControlMessage> {
    let Some(doc) = parse_optional::<RaceControlDoc>(docs, FeedKind::RaceControl) else {
        return Vec::new();
    };

    let mut messages: Vec<RaceControlMessage> = doc
        .messages
        .iter()
        .filter_map(|m| {
            let ts = parse_utc_ms(&m.utc)?;
            if ts < meta.start_ms || ts > meta.end_ms {
                return None;
            }
            Some(RaceControlMessage {
                timestamp_ms: ts,
                category: m.category.clone(),
                message: m.message.clone(),
            })
        })
        .collect();

    messages.sort_by_key(|m| m.timestamp_ms);
    messages
}

fn normalize_track_status(docs: &ProviderDocs, meta: &SessionMeta) -> Vec<TrackStatusEvent> {
    let Some(doc) = parse_optional::<TrackStatusDoc>(docs, FeedKind::TrackStatus) else {
        return Vec::new();
    };

    let mut statuses: Vec<TrackStatusEvent> = doc
        .statuses
        .iter()
        .filter_map(|s| {
            let ts = parse_utc_ms(&s.utc)?;
            if ts < meta.start_ms || ts > meta.end_ms {
                return None;
            }
            Some(TrackStatusEvent {
                timestamp_ms: ts,
                status: s.status.clone(),
                label: s.message.clone(),
            })
        })
        .collect();

    statuses.sort_by_key(|s| s.timestamp_ms);
    statuses
}

/// Parse a provider UTC timestamp (RFC 3339) to epoch milliseconds.
pub fn parse_utc_ms(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Parse a lap time ("1:14.123" or "74.123") to milliseconds.
fn parse_lap_time_ms(raw: &str) -> Option<i64> {
    let (minutes, seconds) = match raw.split_once(':') {
        Some((m, s)) => (m.parse::<i64>().ok()?, s),
        None => (0, raw),
    };
    let secs: f64 = seconds.parse().ok()?;
    Some(minutes * 60_000 + (secs * 1000.0).round() as i64)
}
