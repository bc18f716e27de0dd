//! Deterministic replay of a session timeline
//!
//! Split in two: `ReplayEngine` is a pure, synchronous state machine with
//! an injectable clock so playback is testable without wall-clock waits;
//! `ReplayDriver` owns the periodic scheduling tick on a tokio task and
//! pushes one state snapshot per tick on a watch channel.
//!
//! State machine: Idle -> Ready -> Playing <-> Paused -> Ready (reset).
//! Destroy returns to Idle and stops the tick task immediately. Reaching
//! the timeline end transitions to Paused so the final state remains
//! inspectable.

use crate::timeline::{EventPayload, SessionContext, Timeline, TimelineEvent};
use crate::types::{LapEvent, RaceControlMessage, TelemetrySample, TrackStatusEvent, WeatherSample};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{interval, Duration};

/// Speed multipliers the engine accepts.
pub const SUPPORTED_SPEEDS: [f64; 5] = [0.5, 1.0, 2.0, 5.0, 10.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplayStatus {
    Idle,
    Ready,
    Playing,
    Paused,
}

/// Cumulative state derived from all events applied so far. Last-known
/// values persist until superseded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedState {
    /// Last known position per driver
    pub positions: HashMap<u32, TelemetrySample>,
    /// Last known car telemetry per driver
    pub car_data: HashMap<u32, TelemetrySample>,
    /// Most recent completed lap per driver
    pub laps: HashMap<u32, LapEvent>,
    /// Current track status, None until the first status event
    pub track_status: Option<TrackStatusEvent>,
    /// Latest weather reading
    pub weather: Option<WeatherSample>,
    /// All race-control messages issued so far, in order
    pub race_control_log: Vec<RaceControlMessage>,
}

impl DerivedState {
    fn apply(&mut self, event: &TimelineEvent) {
        match &event.payload {
            EventPayload::Position(s) => {
                self.positions.insert(s.driver_number, s.clone());
            }
            EventPayload::Car(s) => {
                self.car_data.insert(s.driver_number, s.clone());
            }
            EventPayload::Lap(l) => {
                self.laps.insert(l.driver_number, l.clone());
            }
            EventPayload::TrackStatus(t) => {
                self.track_status = Some(t.clone());
            }
            EventPayload::Weather(w) => {
                self.weather = Some(w.clone());
            }
            EventPayload::RaceControl(m) => {
                self.race_control_log.push(m.clone());
            }
        }
    }
}

/// One state-update notification, emitted once per tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplaySnapshot {
    pub status: ReplayStatus,
    pub cursor_ms: i64,
    /// Fractional progress through the timeline, 0-100
    pub progress: f64,
    pub speed: f64,
    pub state: DerivedState,
}

/// Cursor-driven replay state machine for one session. Owns its cursor
/// and derived state exclusively; never shared across sessions.
pub struct ReplayEngine {
    context: SessionContext,
    timeline: Arc<Timeline>,
    status: ReplayStatus,
    cursor_ms: i64,
    speed: f64,
    /// Index of the first event not yet applied
    next_event: usize,
    state: DerivedState,
    /// Wall clock at the last advancement, None while not playing
    last_tick_ms: Option<i64>,
    /// Sub-millisecond advancement carried between ticks so fractional
    /// speeds do not run slow
    frac_ms: f64,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl ReplayEngine {
    /// Build an engine over a finished timeline. Construction is the
    /// Idle -> Ready transition.
    pub fn new(context: SessionContext, timeline: Arc<Timeline>) -> Self {
        Self::with_clock(
            context,
            timeline,
            Box::new(|| chrono::Utc::now().timestamp_millis()),
        )
    }

    /// Construct with an injected millisecond clock for deterministic
    /// playback tests.
    pub fn with_clock(
        context: SessionContext,
        timeline: Arc<Timeline>,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        let cursor_ms = timeline.start_ms();
        Self {
            context,
            timeline,
            status: ReplayStatus::Ready,
            cursor_ms,
            speed: 1.0,
            next_event: 0,
            state: DerivedState::default(),
            last_tick_ms: None,
            frac_ms: 0.0,
            now_fn,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn status(&self) -> ReplayStatus {
        self.status
    }

    /// Ready/Paused -> Playing. No-op if already playing or destroyed.
    pub fn play(&mut self) {
        match self.status {
            ReplayStatus::Ready | ReplayStatus::Paused => {
                self.status = ReplayStatus::Playing;
                self.last_tick_ms = Some((self.now_fn)());
                self.frac_ms = 0.0;
            }
            ReplayStatus::Playing | ReplayStatus::Idle => {}
        }
    }

    /// Playing -> Paused.
    pub fn pause(&mut self) {
        if self.status == ReplayStatus::Playing {
            self.status = ReplayStatus::Paused;
            self.last_tick_ms = None;
        }
    }

    /// Jump to a fractional position. Never errors: the fraction is
    /// clamped to [0, 100]. Valid in any non-Idle state.
    ///
    /// Derived state is cumulative, so it is recomputed by replaying all
    /// events from the timeline start up to the new cursor.
    pub fn seek(&mut self, fraction: f64) {
        if self.status == ReplayStatus::Idle {
            return;
        }

        let fraction = fraction.clamp(0.0, 100.0);
        let target =
            self.timeline.start_ms() + (fraction / 100.0 * self.timeline.duration_ms() as f64) as i64;

        self.cursor_ms = target;
        self.frac_ms = 0.0;
        self.state = DerivedState::default();
        self.next_event = 0;
        self.apply_events_up_to_cursor();

        if self.status == ReplayStatus::Playing {
            self.last_tick_ms = Some((self.now_fn)());
        }
    }

    /// Change the playback rate. Only the discrete supported set is
    /// accepted; anything else is logged and ignored.
    pub fn set_speed(&mut self, multiplier: f64) {
        if SUPPORTED_SPEEDS.contains(&multiplier) {
            self.speed = multiplier;
        } else {
            log::warn!(
                "Unsupported speed multiplier {}, keeping {}",
                multiplier,
                self.speed
            );
        }
    }

    /// Return to the timeline start, state -> Ready.
    pub fn reset(&mut self) {
        if self.status == ReplayStatus::Idle {
            return;
        }
        self.cursor_ms = self.timeline.start_ms();
        self.frac_ms = 0.0;
        self.state = DerivedState::default();
        self.next_event = 0;
        self.status = ReplayStatus::Ready;
        self.last_tick_ms = None;
    }

    /// Pure read: fractional progress 0-100.
    pub fn progress(&self) -> f64 {
        let duration = self.timeline.duration_ms();
        if duration == 0 {
            return 100.0;
        }
        100.0 * (self.cursor_ms - self.timeline.start_ms()) as f64 / duration as f64
    }

    /// Pure read: current cursor position (UTC epoch ms).
    pub fn current_time(&self) -> i64 {
        self.cursor_ms
    }

    /// Stop this engine. Idle accepts no further operations.
    pub fn destroy(&mut self) {
        self.status = ReplayStatus::Idle;
        self.last_tick_ms = None;
    }

    /// One scheduling tick: advance the cursor by elapsed wall time times
    /// the speed multiplier, apply every event crossed, and return a
    /// single snapshot. Non-playing states return the snapshot unchanged.
    pub fn tick(&mut self) -> ReplaySnapshot {
        if self.status == ReplayStatus::Playing {
            let now = (self.now_fn)();
            let elapsed = now - self.last_tick_ms.unwrap_or(now);
            self.last_tick_ms = Some(now);

            // Carry the sub-millisecond remainder so fractional speeds
            // advance at exactly elapsed x speed over many ticks
            let advance = elapsed as f64 * self.speed + self.frac_ms;
            let whole = advance as i64;
            self.frac_ms = advance - whole as f64;
            self.cursor_ms += whole;

            if self.cursor_ms >= self.timeline.end_ms() {
                // End of timeline: pause, keep final state inspectable
                self.cursor_ms = self.timeline.end_ms();
                self.status = ReplayStatus::Paused;
                self.last_tick_ms = None;
                self.frac_ms = 0.0;
            }

            self.apply_events_up_to_cursor();
        }

        self.snapshot()
    }

    /// Pure read of the current state.
    pub fn snapshot(&self) -> ReplaySnapshot {
        ReplaySnapshot {
            status: self.status,
            cursor_ms: self.cursor_ms,
            progress: self.progress(),
            speed: self.speed,
            state: self.state.clone(),
        }
    }

    fn apply_events_up_to_cursor(&mut self) {
        let events = self.timeline.events();
        while self.next_event < events.len()
            && events[self.next_event].timestamp_ms <= self.cursor_ms
        {
            self.state.apply(&events[self.next_event]);
            self.next_event += 1;
        }
    }
}

/// Owns the periodic tick task for one engine. Control calls lock the
/// engine, so changes arriving between ticks take effect before the next
/// tick computes advancement.
pub struct ReplayDriver {
    engine: Arc<Mutex<ReplayEngine>>,
    updates: watch::Receiver<ReplaySnapshot>,
    tick_task: tokio::task::JoinHandle<()>,
}

impl ReplayDriver {
    /// Spawn the tick task at the given cadence.
    pub fn spawn(engine: ReplayEngine, tick_interval_ms: u64) -> Self {
        let engine = Arc::new(Mutex::new(engine));
        let (tx, rx) = watch::channel(engine.lock().unwrap().snapshot());

        let tick_engine = engine.clone();
        let tick_task = tokio::spawn(async move {
            let mut timer = interval(Duration::from_millis(tick_interval_ms.max(1)));
            loop {
                timer.tick().await;
                // One notification per tick, however many events applied
                let snapshot = tick_engine.lock().unwrap().tick();
                if tx.send(snapshot).is_err() {
                    break;
                }
            }
        });

        Self {
            engine,
            updates: rx,
            tick_task,
        }
    }

    /// Push-based state updates, one per tick.
    pub fn subscribe(&self) -> watch::Receiver<ReplaySnapshot> {
        self.updates.clone()
    }

    pub fn play(&self) {
        self.engine.lock().unwrap().play();
    }

    pub fn pause(&self) {
        self.engine.lock().unwrap().pause();
    }

    pub fn seek(&self, fraction: f64) {
        self.engine.lock().unwrap().seek(fraction);
    }

    pub fn set_speed(&self, multiplier: f64) {
        self.engine.lock().unwrap().set_speed(multiplier);
    }

    pub fn reset(&self) {
        self.engine.lock().unwrap().reset();
    }

    pub fn progress(&self) -> f64 {
        self.engine.lock().unwrap().progress()
    }

    pub fn current_time(&self) -> i64 {
        self.engine.lock().unwrap().current_time()
    }

    pub fn snapshot(&self) -> ReplaySnapshot {
        self.engine.lock().unwrap().snapshot()
    }

    /// Stop the tick task immediately and put the engine in Idle. No
    /// tick fires after this returns.
    pub fn destroy(self) {
        self.tick_task.abort();
        self.engine.lock().unwrap().destroy();
    }
}
