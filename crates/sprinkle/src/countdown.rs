//! Countdown projection for an in-flight irrigation program.
//!
//! There is no "cycle started" or "cycle finished" event to listen to. All we
//! get on each poll is whether the valve is on, when it last changed, and the
//! program descriptor. Elapsed time since the valve opened is folded modulo
//! the per-iteration duration to recover the position inside the current
//! iteration.
//!
//! `irrigation_interval` is decoded but not part of the projection:
//! iterations are treated as back-to-back.

use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::hass::EntityState;
use crate::telemetry::{self, CyclicProgram};

/// Shown instead of `MM:SS` when nothing is counting down.
pub(crate) const PLACEHOLDER: &str = "--:--";

/// The state string that legitimately means "no program".
const EMPTY_PROGRAM: &str = "{}";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The valve as observed on a single poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct OutputState {
    pub(crate) is_on: bool,
    pub(crate) last_changed_at: Option<OffsetDateTime>,
}

impl From<Option<&EntityState>> for OutputState {
    fn from(entity: Option<&EntityState>) -> Self {
        match entity {
            Some(e) => Self {
                is_on: e.state == "on",
                last_changed_at: e.last_changed,
            },
            None => Self {
                is_on: false,
                last_changed_at: None,
            },
        }
    }
}

/// Display-ready countdown, rebuilt from scratch on every poll.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CountdownInfo {
    pub(crate) seconds_remaining: f64,
    /// `NaN` (serialized as `null`) when the telemetry could not be decoded.
    pub(crate) total_duration: f64,
    pub(crate) formatted: String,
    pub(crate) progress: f64,
    pub(crate) is_active: bool,
}

impl CountdownInfo {
    /// Nothing running, nothing configured.
    pub(crate) fn idle() -> Self {
        Self {
            seconds_remaining: 0.0,
            total_duration: 0.0,
            formatted: PLACEHOLDER.to_string(),
            progress: 0.0,
            is_active: false,
        }
    }

    /// Telemetry was present but unreadable.
    pub(crate) fn invalid() -> Self {
        Self {
            total_duration: f64::NAN,
            ..Self::idle()
        }
    }

    pub(crate) fn is_invalid(&self) -> bool {
        self.total_duration.is_nan()
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Seconds left in the iteration that is currently running, bounded to
/// `[0, irrigation_duration]`.
pub(crate) fn remaining_seconds(
    output: &OutputState,
    program: Option<&CyclicProgram>,
    now: OffsetDateTime,
) -> f64 {
    let Some(p) = program else {
        return 0.0;
    };
    if !output.is_on {
        return 0.0;
    }
    if p.current_count <= 0.0 || p.total_number <= 0.0 {
        return 0.0;
    }
    if p.total_number - p.current_count < 0.0 {
        return 0.0;
    }
    let duration = p.irrigation_duration;
    if duration <= 0.0 {
        return 0.0;
    }

    let Some(changed_at) = output.last_changed_at else {
        return duration;
    };

    let delta = (now - changed_at).as_seconds_f64();
    if delta < 0.0 {
        // Timestamp from the future; assume the iteration just started.
        return duration;
    }
    let elapsed = delta.floor();

    let elapsed_cycles = (elapsed / duration).floor();
    if elapsed_cycles >= p.total_number {
        return 0.0;
    }

    let remaining = duration - elapsed % duration;
    remaining.min(duration).max(0.0)
}

/// Build the [`CountdownInfo`] for one poll.
///
/// `raw_program` is the program entity's state string, or `None` when no
/// program entity is configured or it does not exist on the host.
pub(crate) fn present(
    output: &OutputState,
    raw_program: Option<&str>,
    now: OffsetDateTime,
) -> CountdownInfo {
    let Some(raw) = raw_program else {
        return CountdownInfo::idle();
    };

    let record = telemetry::decode(raw);
    if record.is_empty() && raw.trim() != EMPTY_PROGRAM {
        return CountdownInfo::invalid();
    }

    let program = CyclicProgram::from_record(&record);
    let seconds_remaining = remaining_seconds(output, program.as_ref(), now);
    let total_duration = declared_duration(&record);

    let progress = if seconds_remaining > 0.0 && total_duration > 0.0 {
        (total_duration - seconds_remaining) / total_duration * 100.0
    } else {
        0.0
    };

    CountdownInfo {
        seconds_remaining,
        total_duration,
        formatted: format_remaining(seconds_remaining),
        progress,
        is_active: seconds_remaining > 0.0,
    }
}

fn declared_duration(record: &Map<String, Value>) -> f64 {
    record
        .get("irrigation_duration")
        .and_then(Value::as_f64)
        .filter(|d| d.is_finite())
        .unwrap_or(0.0)
}

/// `MM:SS`, zero padded, minutes unbounded (`3661` → `61:01`).
pub(crate) fn format_remaining(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return PLACEHOLDER.to_string();
    }
    let whole = seconds.floor() as u64;
    format!("{:02}:{:02}", whole / 60, whole % 60)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    fn on_since(secs_ago: i64) -> OutputState {
        OutputState {
            is_on: true,
            last_changed_at: Some(NOW - Duration::seconds(secs_ago)),
        }
    }

    fn off() -> OutputState {
        OutputState {
            is_on: false,
            last_changed_at: Some(NOW - Duration::seconds(10)),
        }
    }

    fn program(current: f64, total: f64, duration: f64) -> CyclicProgram {
        CyclicProgram {
            current_count: current,
            total_number: total,
            irrigation_duration: duration,
            irrigation_interval: 0.0,
        }
    }

    fn raw(current: u32, total: u32, duration: u32) -> String {
        format!(
            "{{'current_count': {current}, 'total_number': {total}, 'irrigation_duration': {duration}, 'irrigation_interval': 0}}"
        )
    }

    // -- format_remaining ----------------------------------------------------

    #[test]
    fn format_zero_is_placeholder() {
        assert_eq!(format_remaining(0.0), "--:--");
    }

    #[test]
    fn format_negative_is_placeholder() {
        assert_eq!(format_remaining(-1.0), "--:--");
    }

    #[test]
    fn format_non_finite_is_placeholder() {
        assert_eq!(format_remaining(f64::NAN), "--:--");
        assert_eq!(format_remaining(f64::INFINITY), "--:--");
    }

    #[test]
    fn format_minutes_and_seconds() {
        assert_eq!(format_remaining(65.0), "01:05");
        assert_eq!(format_remaining(5.0), "00:05");
        assert_eq!(format_remaining(600.0), "10:00");
    }

    #[test]
    fn format_no_hour_rollover() {
        assert_eq!(format_remaining(3661.0), "61:01");
    }

    // -- remaining_seconds: guards -------------------------------------------

    #[test]
    fn valve_off_has_nothing_remaining() {
        let p = program(1.0, 1.0, 300.0);
        assert_eq!(remaining_seconds(&off(), Some(&p), NOW), 0.0);
        assert_eq!(remaining_seconds(&off(), None, NOW), 0.0);
    }

    #[test]
    fn invalid_program_has_nothing_remaining() {
        assert_eq!(remaining_seconds(&on_since(10), None, NOW), 0.0);
    }

    #[test]
    fn not_started_program_has_nothing_remaining() {
        let p = program(0.0, 1.0, 300.0);
        assert_eq!(remaining_seconds(&on_since(10), Some(&p), NOW), 0.0);
    }

    #[test]
    fn zero_total_has_nothing_remaining() {
        let p = program(1.0, 0.0, 300.0);
        assert_eq!(remaining_seconds(&on_since(10), Some(&p), NOW), 0.0);
    }

    #[test]
    fn overrun_count_has_nothing_remaining() {
        let p = program(4.0, 3.0, 300.0);
        assert_eq!(remaining_seconds(&on_since(10), Some(&p), NOW), 0.0);
    }

    #[test]
    fn zero_duration_has_nothing_remaining() {
        let p = program(1.0, 1.0, 0.0);
        assert_eq!(remaining_seconds(&on_since(10), Some(&p), NOW), 0.0);
    }

    #[test]
    fn missing_timestamp_assumes_full_duration() {
        let output = OutputState {
            is_on: true,
            last_changed_at: None,
        };
        let p = program(1.0, 1.0, 300.0);
        assert_eq!(remaining_seconds(&output, Some(&p), NOW), 300.0);
    }

    #[test]
    fn future_timestamp_clamped_to_full_duration() {
        let p = program(1.0, 1.0, 300.0);
        assert_eq!(remaining_seconds(&on_since(-45), Some(&p), NOW), 300.0);
    }

    // -- remaining_seconds: projection ---------------------------------------

    #[test]
    fn single_cycle_sixty_seconds_in() {
        let p = program(1.0, 1.0, 300.0);
        assert_eq!(remaining_seconds(&on_since(60), Some(&p), NOW), 240.0);
    }

    #[test]
    fn fractional_elapsed_is_floored() {
        let output = OutputState {
            is_on: true,
            last_changed_at: Some(NOW - Duration::milliseconds(60_900)),
        };
        let p = program(1.0, 1.0, 300.0);
        assert_eq!(remaining_seconds(&output, Some(&p), NOW), 240.0);
    }

    #[test]
    fn multi_cycle_wraps_into_current_iteration() {
        let p = program(1.0, 3.0, 120.0);
        assert_eq!(remaining_seconds(&on_since(150), Some(&p), NOW), 90.0);
    }

    #[test]
    fn exact_cycle_boundary_restarts_iteration() {
        let p = program(1.0, 3.0, 120.0);
        assert_eq!(remaining_seconds(&on_since(240), Some(&p), NOW), 120.0);
    }

    #[test]
    fn completed_program_has_nothing_remaining() {
        let p = program(1.0, 3.0, 120.0);
        assert_eq!(remaining_seconds(&on_since(360), Some(&p), NOW), 0.0);
        assert_eq!(remaining_seconds(&on_since(5000), Some(&p), NOW), 0.0);
    }

    #[test]
    fn single_cycle_completion() {
        let p = program(1.0, 1.0, 300.0);
        assert_eq!(remaining_seconds(&on_since(300), Some(&p), NOW), 0.0);
        assert_eq!(remaining_seconds(&on_since(299), Some(&p), NOW), 1.0);
    }

    #[test]
    fn remaining_always_within_bounds() {
        let p = program(1.0, 4.0, 90.0);
        for secs in (0..400).step_by(7) {
            let r = remaining_seconds(&on_since(secs), Some(&p), NOW);
            assert!(
                (0.0..=90.0).contains(&r),
                "remaining {r} out of bounds at {secs}s"
            );
        }
    }

    #[test]
    fn interval_does_not_affect_projection() {
        let with_gap = CyclicProgram {
            irrigation_interval: 600.0,
            ..program(1.0, 3.0, 120.0)
        };
        let without_gap = program(1.0, 3.0, 120.0);
        assert_eq!(
            remaining_seconds(&on_since(150), Some(&with_gap), NOW),
            remaining_seconds(&on_since(150), Some(&without_gap), NOW)
        );
    }

    // -- present ---------------------------------------------------------------

    #[test]
    fn present_single_cycle_scenario() {
        let info = present(&on_since(60), Some(&raw(1, 1, 300)), NOW);
        assert!(info.seconds_remaining > 235.0 && info.seconds_remaining <= 240.0);
        assert_eq!(info.formatted, "04:00");
        assert!(info.progress > 15.0 && info.progress <= 25.0);
        assert_eq!(info.total_duration, 300.0);
        assert!(info.is_active);
    }

    #[test]
    fn present_mid_minute_formatting() {
        let info = present(&on_since(63), Some(&raw(1, 1, 300)), NOW);
        assert_eq!(info.seconds_remaining, 237.0);
        assert_eq!(info.formatted, "03:57");
        assert!((info.progress - 21.0).abs() < 1e-9);
    }

    #[test]
    fn present_valve_off() {
        let info = present(&off(), Some(&raw(1, 1, 300)), NOW);
        assert_eq!(info.seconds_remaining, 0.0);
        assert!(!info.is_active);
        assert_eq!(info.formatted, "--:--");
        assert_eq!(info.progress, 0.0);
    }

    #[test]
    fn present_malformed_telemetry() {
        let info = present(&on_since(60), Some("invalid_json"), NOW);
        assert!(!info.is_active);
        assert_eq!(info.seconds_remaining, 0.0);
        assert_eq!(info.formatted, "--:--");
        assert!(info.total_duration.is_nan());
        assert!(info.is_invalid());
    }

    #[test]
    fn present_empty_string_is_malformed() {
        let info = present(&on_since(60), Some(""), NOW);
        assert!(info.is_invalid());
    }

    #[test]
    fn present_canonical_empty_program_is_not_malformed() {
        let info = present(&on_since(60), Some("{}"), NOW);
        assert!(!info.is_invalid());
        assert_eq!(info.total_duration, 0.0);
        assert!(!info.is_active);
    }

    #[test]
    fn present_without_program_entity_is_idle() {
        let info = present(&on_since(60), None, NOW);
        assert!(!info.is_invalid());
        assert!(!info.is_active);
        assert_eq!(info.total_duration, 0.0);
    }

    #[test]
    fn present_wrongly_typed_record_keeps_numeric_duration() {
        let info = present(
            &on_since(60),
            Some("{'current_count': 'one', 'irrigation_duration': 300}"),
            NOW,
        );
        assert!(!info.is_active);
        assert!(!info.is_invalid());
        assert_eq!(info.total_duration, 300.0);
        assert_eq!(info.progress, 0.0);
    }

    #[test]
    fn present_completed_program_is_inactive() {
        let info = present(&on_since(301), Some(&raw(1, 1, 300)), NOW);
        assert!(!info.is_active);
        assert_eq!(info.progress, 0.0);
        assert_eq!(info.total_duration, 300.0);
    }

    #[test]
    fn present_activity_tracks_remaining() {
        let sources = [
            raw(1, 1, 300),
            raw(0, 1, 300),
            raw(2, 3, 60),
            "{}".to_string(),
            "garbage".to_string(),
        ];
        for src in &sources {
            for secs in [0, 30, 59, 60, 61, 180, 299, 300, 1000] {
                for output in [on_since(secs), off()] {
                    let info = present(&output, Some(src), NOW);
                    assert_eq!(info.is_active, info.seconds_remaining > 0.0);
                }
            }
        }
    }

    #[test]
    fn countdown_serializes_camel_case_with_null_for_nan() {
        let json = serde_json::to_value(CountdownInfo::invalid()).unwrap();
        assert_eq!(json["secondsRemaining"], 0.0);
        assert!(json["totalDuration"].is_null());
        assert_eq!(json["formatted"], "--:--");
        assert_eq!(json["isActive"], false);
    }

    // -- OutputState -----------------------------------------------------------

    #[test]
    fn output_state_from_entity() {
        let entity = EntityState {
            state: "on".into(),
            last_changed: Some(NOW),
            attributes: Map::new(),
        };
        let output = OutputState::from(Some(&entity));
        assert!(output.is_on);
        assert_eq!(output.last_changed_at, Some(NOW));
    }

    #[test]
    fn output_state_only_exact_on_counts() {
        let entity = EntityState {
            state: "ON".into(),
            last_changed: None,
            attributes: Map::new(),
        };
        assert!(!OutputState::from(Some(&entity)).is_on);
    }

    #[test]
    fn output_state_missing_entity_is_off() {
        let output = OutputState::from(None);
        assert!(!output.is_on);
        assert!(output.last_changed_at.is_none());
    }
}
