//! TOML config file loading and validation.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::mqtt::{device_set_topic, extract_device_name};

/// Longest selectable run, one day. Keeps `duration_max * 60` well inside
/// the device's `u32` seconds field.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub hass: HassConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub cards: Vec<CardConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HassConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Publish through the host's `mqtt.publish` service.
    #[default]
    Hass,
    /// Publish directly to a broker.
    Broker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub kind: BusKind,
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::default(),
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: default_client_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_optimistic_timeout_ms")]
    pub optimistic_timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            settle_ms: default_settle_ms(),
            optimistic_timeout_ms: default_optimistic_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

/// One card: a valve and the entities that describe it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardConfig {
    /// zigbee2mqtt friendly name of the device.
    pub device_name: String,
    pub valve_entity: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub battery_entity: Option<String>,
    #[serde(default)]
    pub timed_irrigation_entity: Option<String>,
    #[serde(default)]
    pub quantitative_irrigation_entity: Option<String>,
    /// Host weather entity (met.no integration) shown next to the valve.
    #[serde(default)]
    pub weather_entity: Option<String>,
    /// Minutes.
    #[serde(default = "default_duration_max")]
    pub duration_max: u32,
    /// Liters.
    #[serde(default = "default_volume_max")]
    pub volume_max: u32,
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "sprinkle".to_string()
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_settle_ms() -> u64 {
    1000
}
fn default_optimistic_timeout_ms() -> u64 {
    5000
}
fn default_web_port() -> u16 {
    8080
}
fn default_duration_max() -> u32 {
    60
}
fn default_volume_max() -> u32 {
    100
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// `domain.object_id`, lowercase, no spaces.
fn is_entity_id(id: &str) -> bool {
    let Some((domain, object)) = id.split_once('.') else {
        return false;
    };
    let valid = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };
    valid(domain) && valid(object)
}

impl Config {
    /// Validate the whole config. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_hass(&mut errors);
        self.validate_bus(&mut errors);
        self.validate_poll(&mut errors);
        self.validate_cards(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_hass(&self, errors: &mut Vec<String>) {
        let url = self.hass.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!(
                "hass.url '{}' must start with http:// or https://",
                self.hass.url
            ));
        }
        if self.hass.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
            errors.push("hass.token is missing (set it in the file or HASS_TOKEN)".to_string());
        }
    }

    fn validate_bus(&self, errors: &mut Vec<String>) {
        if self.bus.kind != BusKind::Broker {
            return;
        }
        if self.bus.host.trim().is_empty() {
            errors.push("bus.host is empty".to_string());
        }
        if self.bus.port == 0 {
            errors.push("bus.port must be non-zero".to_string());
        }
        if self.bus.client_id.trim().is_empty() {
            errors.push("bus.client_id is empty".to_string());
        }
    }

    fn validate_poll(&self, errors: &mut Vec<String>) {
        for (name, value) in [
            ("interval_ms", self.poll.interval_ms),
            ("settle_ms", self.poll.settle_ms),
            ("optimistic_timeout_ms", self.poll.optimistic_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("poll.{name} must be positive"));
            }
        }
    }

    fn validate_cards(&self, errors: &mut Vec<String>) {
        if self.cards.is_empty() {
            errors.push("no cards configured".to_string());
        }

        let mut seen_valves: HashSet<&str> = HashSet::new();

        for (i, c) in self.cards.iter().enumerate() {
            let ctx = || {
                if c.valve_entity.is_empty() {
                    format!("cards[{i}]")
                } else {
                    format!("card '{}'", c.valve_entity)
                }
            };

            // ── Device ──────────────────────────────────────────
            if c.device_name.trim().is_empty() {
                errors.push(format!("{}: device_name is empty", ctx()));
            } else if c.device_name.contains(&['+', '#'][..])
                || extract_device_name(&device_set_topic(&c.device_name))
                    != Some(c.device_name.as_str())
            {
                errors.push(format!(
                    "{}: device_name '{}' contains an MQTT topic character",
                    ctx(),
                    c.device_name
                ));
            }

            // ── Entities ────────────────────────────────────────
            if !is_entity_id(&c.valve_entity) {
                errors.push(format!(
                    "{}: valve_entity '{}' is not a valid entity id",
                    ctx(),
                    c.valve_entity
                ));
            } else if !seen_valves.insert(&c.valve_entity) {
                errors.push(format!("{}: duplicate valve_entity", ctx()));
            }

            for (field, value) in [
                ("battery_entity", &c.battery_entity),
                ("timed_irrigation_entity", &c.timed_irrigation_entity),
                ("quantitative_irrigation_entity", &c.quantitative_irrigation_entity),
                ("weather_entity", &c.weather_entity),
            ] {
                if let Some(id) = value {
                    if !is_entity_id(id) {
                        errors.push(format!(
                            "{}: {field} '{id}' is not a valid entity id",
                            ctx()
                        ));
                    }
                }
            }

            // ── Slider ranges ───────────────────────────────────
            if c.duration_max == 0 {
                errors.push(format!("{}: duration_max must be positive", ctx()));
            } else if c.duration_max > MAX_DURATION_MINUTES {
                errors.push(format!(
                    "{}: duration_max must be at most {MAX_DURATION_MINUTES} minutes",
                    ctx()
                ));
            }
            if c.volume_max == 0 {
                errors.push(format!("{}: volume_max must be positive", ctx()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply `HASS_TOKEN`, then validate.
pub fn load(path: &str, token_override: Option<String>) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    if let Some(token) = token_override {
        config.hass.token = Some(token);
    }
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        cards = config.cards.len(),
        bus = ?config.bus.kind,
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
