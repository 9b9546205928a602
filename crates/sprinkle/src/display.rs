//! Small helpers for the dashboard: battery classification and slider ticks.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum BatteryClass {
    Critical,
    Low,
    Good,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub(crate) struct Battery {
    /// Clamped to 0..=100.
    pub(crate) percent: f64,
    pub(crate) class: BatteryClass,
}

impl Battery {
    pub(crate) fn from_level(level: f64) -> Self {
        let class = if level <= 20.0 {
            BatteryClass::Critical
        } else if level <= 50.0 {
            BatteryClass::Low
        } else {
            BatteryClass::Good
        };
        Self {
            percent: level.clamp(0.0, 100.0),
            class,
        }
    }
}

/// `n` evenly spaced, rounded values from `min` to `max` inclusive.
pub(crate) fn tick_values(n: usize, min: f64, max: f64) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![min],
        _ => {
            let step = (max - min) / (n - 1) as f64;
            (0..n).map(|i| (min + i as f64 * step).round()).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_thresholds() {
        assert_eq!(Battery::from_level(5.0).class, BatteryClass::Critical);
        assert_eq!(Battery::from_level(20.0).class, BatteryClass::Critical);
        assert_eq!(Battery::from_level(21.0).class, BatteryClass::Low);
        assert_eq!(Battery::from_level(50.0).class, BatteryClass::Low);
        assert_eq!(Battery::from_level(51.0).class, BatteryClass::Good);
    }

    #[test]
    fn battery_percent_clamped() {
        assert_eq!(Battery::from_level(-4.0).percent, 0.0);
        assert_eq!(Battery::from_level(130.0).percent, 100.0);
        assert_eq!(Battery::from_level(64.5).percent, 64.5);
    }

    #[test]
    fn ticks_single_value_is_min() {
        assert_eq!(tick_values(1, 0.0, 60.0), vec![0.0]);
    }

    #[test]
    fn ticks_evenly_spaced_and_rounded() {
        assert_eq!(tick_values(5, 0.0, 60.0), vec![0.0, 15.0, 30.0, 45.0, 60.0]);
        assert_eq!(tick_values(4, 0.0, 100.0), vec![0.0, 33.0, 67.0, 100.0]);
    }

    #[test]
    fn ticks_zero_count_is_empty() {
        assert!(tick_values(0, 0.0, 10.0).is_empty());
    }
}
