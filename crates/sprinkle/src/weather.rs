//! Weather next to the valve, read from a met.no weather entity on the host.
//!
//! Everything here fails soft: an unconfigured, missing or garbled weather
//! entity yields `None` and the card keeps working without it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::hass::{EntityState, HistoryEntry, HomeAssistant};

/// Plausible air temperatures in °C.
const TEMPERATURE_RANGE: std::ops::RangeInclusive<f64> = -50.0..=70.0;

/// Conditions counted as rain in the state history.
const RAIN_CONDITIONS: [&str; 3] = ["rainy", "pouring", "snowy-rainy"];

const FORECAST_WINDOW: time::Duration = time::Duration::hours(24);
const HISTORY_WINDOW: time::Duration = time::Duration::days(2);
const HISTORY_TTL: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ForecastItem {
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) datetime: OffsetDateTime,
    /// mm, never negative.
    pub(crate) precipitation: f64,
    pub(crate) condition: String,
    /// °C; 0 when the forecast value is missing or implausible.
    pub(crate) temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct CurrentWeather {
    pub(crate) condition: String,
    pub(crate) temperature: f64,
    pub(crate) humidity: Option<f64>,
    /// Forecast rain for the rest of today (UTC), mm.
    pub(crate) today_precipitation: f64,
    /// Forecast entries in the next 24 hours.
    pub(crate) forecast: Vec<ForecastItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct RainPeriod {
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) end: OffsetDateTime,
    pub(crate) precipitation_mm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct RainForecast {
    pub(crate) expected_rain_hours: f64,
    pub(crate) total_expected_mm: f64,
    pub(crate) periods: Vec<RainPeriod>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct RainHistory {
    /// Hours with a rain condition in the past two days.
    pub(crate) total_rain_hours: f64,
    /// When the last rain ended; `now` if it is still raining.
    #[serde(with = "time::serde::rfc3339::option")]
    pub(crate) last_rain: Option<OffsetDateTime>,
}

/// What the status response carries about the weather.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct WeatherReport {
    #[serde(flatten)]
    pub(crate) current: CurrentWeather,
    pub(crate) rain_forecast: RainForecast,
    pub(crate) rain_history: Option<RainHistory>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

fn plausible_temperature(value: Option<&Value>) -> Option<f64> {
    value
        .and_then(Value::as_f64)
        .filter(|t| TEMPERATURE_RANGE.contains(t))
}

/// Current conditions from the entity's state and attributes. `None` when
/// the entity is unavailable or reports no plausible temperature.
pub(crate) fn parse_current(entity: &EntityState, now: OffsetDateTime) -> Option<CurrentWeather> {
    let condition = entity.state.trim();
    if condition.is_empty() || condition == "unavailable" || condition == "unknown" {
        return None;
    }
    let temperature = plausible_temperature(entity.attributes.get("temperature"))?;
    let humidity = entity.attributes.get("humidity").and_then(Value::as_f64);

    let forecast = parse_forecast(&entity.attributes, now);
    let today = now.to_offset(UtcOffset::UTC).date();
    let today_precipitation = forecast
        .iter()
        .filter(|item| item.datetime.to_offset(UtcOffset::UTC).date() == today)
        .map(|item| item.precipitation)
        .sum();

    Some(CurrentWeather {
        condition: condition.to_string(),
        temperature,
        humidity,
        today_precipitation,
        forecast,
    })
}

/// Forecast entries inside `[now, now + 24h]`. Entries without a readable
/// datetime are dropped; bad numbers are sanitised.
fn parse_forecast(attributes: &Map<String, Value>, now: OffsetDateTime) -> Vec<ForecastItem> {
    let Some(entries) = attributes.get("forecast").and_then(Value::as_array) else {
        return Vec::new();
    };
    let horizon = now + FORECAST_WINDOW;

    entries
        .iter()
        .filter_map(|entry| {
            let datetime = entry
                .get("datetime")
                .and_then(Value::as_str)
                .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())?;
            if datetime < now || datetime > horizon {
                return None;
            }
            Some(ForecastItem {
                datetime,
                precipitation: entry
                    .get("precipitation")
                    .and_then(Value::as_f64)
                    .map_or(0.0, |p| p.max(0.0)),
                condition: entry
                    .get("condition")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .unwrap_or("unknown")
                    .to_string(),
                temperature: plausible_temperature(entry.get("temperature")).unwrap_or(0.0),
            })
        })
        .collect()
}

/// Group consecutive wet forecast entries into rain periods. A period ends
/// at the first dry entry; one that runs to the end of the forecast lasts
/// one hour past the last entry.
pub(crate) fn rain_forecast(forecast: &[ForecastItem]) -> RainForecast {
    let mut periods = Vec::new();
    let mut total_mm = 0.0;
    let mut open: Option<(OffsetDateTime, f64)> = None;

    for item in forecast {
        if item.precipitation > 0.0 {
            total_mm += item.precipitation;
            open = Some(match open {
                Some((start, mm)) => (start, mm + item.precipitation),
                None => (item.datetime, item.precipitation),
            });
        } else if let Some((start, mm)) = open.take() {
            periods.push(RainPeriod {
                start,
                end: item.datetime,
                precipitation_mm: mm,
            });
        }
    }
    if let (Some((start, mm)), Some(last)) = (open, forecast.last()) {
        periods.push(RainPeriod {
            start,
            end: last.datetime + time::Duration::hours(1),
            precipitation_mm: mm,
        });
    }

    let hours: f64 = periods
        .iter()
        .map(|p| (p.end - p.start).as_seconds_f64() / 3600.0)
        .sum();
    RainForecast {
        expected_rain_hours: round1(hours),
        total_expected_mm: round1(total_mm),
        periods,
    }
}

/// Rain time in a chronological state history. Each rainy record lasts
/// until the next record, the last one until `now`.
pub(crate) fn rain_history(records: &[HistoryEntry], now: OffsetDateTime) -> RainHistory {
    let mut seconds = 0.0;
    let mut last_rain = None;
    let mut raining = false;

    for (i, record) in records.iter().enumerate() {
        if RAIN_CONDITIONS.contains(&record.state.as_str()) {
            raining = true;
            let until = records.get(i + 1).map_or(now, |next| next.last_changed);
            seconds += (until - record.last_changed).as_seconds_f64().max(0.0);
        } else if raining {
            raining = false;
            last_rain = Some(record.last_changed);
        }
    }
    if raining {
        last_rain = Some(now);
    }

    RainHistory {
        total_rain_hours: round1(seconds / 3600.0),
        last_rain,
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Reads one weather entity. The two-day rain history is cached for an hour.
pub(crate) struct WeatherService<H> {
    hass: Arc<H>,
    entity_id: String,
    history: Mutex<Option<(Instant, RainHistory)>>,
}

impl<H: HomeAssistant> WeatherService<H> {
    pub(crate) fn new(hass: Arc<H>, entity_id: &str) -> Self {
        Self {
            hass,
            entity_id: entity_id.to_string(),
            history: Mutex::new(None),
        }
    }

    pub(crate) async fn current(&self, now: OffsetDateTime) -> Option<CurrentWeather> {
        match self.hass.entity_state(&self.entity_id).await {
            Ok(Some(entity)) => {
                let parsed = parse_current(&entity, now);
                if parsed.is_none() {
                    debug!(entity = %self.entity_id, state = %entity.state, "weather entity not usable");
                }
                parsed
            }
            Ok(None) => {
                warn!(entity = %self.entity_id, "weather entity not found");
                None
            }
            Err(e) => {
                warn!(entity = %self.entity_id, error = %e, "weather read failed");
                None
            }
        }
    }

    /// Rain over the past two days. A failed read is not cached.
    pub(crate) async fn recent_rain(&self, now: OffsetDateTime) -> Option<RainHistory> {
        if let Some((fetched_at, history)) = self.history.lock().await.as_ref() {
            if fetched_at.elapsed() < HISTORY_TTL {
                return Some(history.clone());
            }
        }

        let records = match self
            .hass
            .state_history(&self.entity_id, now - HISTORY_WINDOW, now)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(entity = %self.entity_id, error = %e, "rain history read failed");
                return None;
            }
        };
        let history = rain_history(&records, now);
        *self.history.lock().await = Some((Instant::now(), history.clone()));
        Some(history)
    }

    pub(crate) async fn report(&self, now: OffsetDateTime) -> Option<WeatherReport> {
        let current = self.current(now).await?;
        let rain_forecast = rain_forecast(&current.forecast);
        let rain_history = self.recent_rain(now).await;
        Some(WeatherReport {
            current,
            rain_forecast,
            rain_history,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
