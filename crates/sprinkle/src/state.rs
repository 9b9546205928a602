use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::config::CardConfig;
use crate::countdown::CountdownInfo;
use crate::display::{tick_values, Battery};
use crate::optimistic::OptimisticSwitch;
use crate::weather::WeatherReport;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Labels shown under each slider.
const SLIDER_TICKS: usize = 5;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub(crate) type SharedState = Arc<RwLock<CardState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub(crate) struct CardState {
    pub(crate) started_at: Instant,
    pub(crate) countdown: CountdownInfo,
    pub(crate) switch: OptimisticSwitch,
    pub(crate) selection: Selection,
    pub(crate) events: VecDeque<CardEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Mode {
    #[default]
    Duration,
    Volume,
}

/// What the primary button will start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub(crate) struct Selection {
    pub(crate) mode: Mode,
    /// Minutes.
    pub(crate) duration: u32,
    /// Liters.
    pub(crate) volume: u32,
}

impl Selection {
    /// The amount selected for the active mode.
    pub(crate) fn active_amount(&self) -> u32 {
        match self.mode {
            Mode::Duration => self.duration,
            Mode::Volume => self.volume,
        }
    }
}

#[derive(Clone, Serialize)]
pub(crate) struct CardEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) ts: OffsetDateTime,
    pub(crate) kind: EventKind,
    pub(crate) detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum EventKind {
    Valve,
    Command,
    Countdown,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    pub(crate) valve_entity: String,
    pub(crate) title: Option<String>,
    pub(crate) uptime_secs: u64,
    pub(crate) valve_on: Option<bool>,
    pub(crate) switch_display: bool,
    pub(crate) switch_pending: bool,
    pub(crate) battery: Option<Battery>,
    pub(crate) weather: Option<WeatherReport>,
    pub(crate) countdown: CountdownInfo,
    pub(crate) selection: Selection,
    pub(crate) duration_ticks: Vec<f64>,
    pub(crate) volume_ticks: Vec<f64>,
    pub(crate) polling: bool,
    pub(crate) events: Vec<CardEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl CardState {
    pub(crate) fn new(optimistic_timeout: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            countdown: CountdownInfo::idle(),
            switch: OptimisticSwitch::new(optimistic_timeout),
            selection: Selection::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Store a fresh countdown, recording when a cycle starts, ends, or the
    /// telemetry turns unreadable.
    pub(crate) fn record_countdown(&mut self, info: CountdownInfo) {
        let was_active = self.countdown.is_active;
        let was_invalid = self.countdown.is_invalid();

        if info.is_active && !was_active {
            let detail = format!("cycle running, {} left", info.formatted);
            self.push_event(EventKind::Countdown, detail);
        } else if !info.is_active && was_active {
            self.push_event(EventKind::Countdown, "cycle finished".to_string());
        }
        if info.is_invalid() && !was_invalid {
            self.push_event(
                EventKind::Error,
                "irrigation telemetry could not be decoded".to_string(),
            );
        }

        self.countdown = info;
    }

    /// Record a valve command dispatched on behalf of the user.
    pub(crate) fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    /// Record a valve state observed on the host.
    pub(crate) fn record_valve(&mut self, on: bool) {
        let before = self.switch.display();
        self.switch.observe(on);
        if !self.switch.is_pending() && before != on {
            let state_str = if on { "ON" } else { "OFF" };
            self.push_event(EventKind::Valve, format!("valve {state_str}"));
        }
    }

    /// Record an error event.
    pub(crate) fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub(crate) fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub(crate) fn to_status(
        &self,
        config: &CardConfig,
        valve_on: Option<bool>,
        battery: Option<Battery>,
        weather: Option<WeatherReport>,
        polling: bool,
    ) -> StatusResponse {
        StatusResponse {
            valve_entity: config.valve_entity.clone(),
            title: config.title.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            valve_on,
            switch_display: self.switch.display(),
            switch_pending: self.switch.is_pending(),
            battery,
            weather,
            countdown: self.countdown.clone(),
            selection: self.selection,
            duration_ticks: tick_values(SLIDER_TICKS, 0.0, f64::from(config.duration_max)),
            volume_ticks: tick_values(SLIDER_TICKS, 0.0, f64::from(config.volume_max)),
            polling,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(CardEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
