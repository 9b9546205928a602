//! One configured valve card: the primary watering action, direct commands,
//! the amount selection, and the status snapshot served to the dashboard.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::config::{CardConfig, PollConfig};
use crate::display::Battery;
use crate::hass::HomeAssistant;
use crate::mqtt::{CommandBus, TimedProgram, VolumeProgram};
use crate::poller::CountdownPoller;
use crate::state::{CardState, Mode, Selection, SharedState, StatusResponse};
use crate::valve::ValveService;
use crate::weather::WeatherService;

/// What the primary button ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub(crate) enum Action {
    TurnOff,
    Toggle,
    Timed { duration_seconds: u32 },
    Volume { volume_liters: u32 },
}

/// Partial selection change; absent fields stay as they are.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct SelectionUpdate {
    pub(crate) mode: Option<Mode>,
    pub(crate) duration: Option<u32>,
    pub(crate) volume: Option<u32>,
}

pub(crate) struct Card<H, B> {
    valve: Arc<ValveService<H, B>>,
    poller: Arc<CountdownPoller<ValveService<H, B>>>,
    weather: Option<WeatherService<H>>,
    shared: SharedState,
}

impl<H: HomeAssistant, B: CommandBus> Card<H, B> {
    pub(crate) fn new(hass: Arc<H>, bus: Arc<B>, config: CardConfig, poll: &PollConfig) -> Self {
        let shared = Arc::new(RwLock::new(CardState::new(Duration::from_millis(
            poll.optimistic_timeout_ms,
        ))));
        let entity = config.valve_entity.clone();
        let weather = config
            .weather_entity
            .as_deref()
            .map(|id| WeatherService::new(Arc::clone(&hass), id));
        let valve = Arc::new(ValveService::new(hass, bus, config));
        let poller = Arc::new(CountdownPoller::new(
            &entity,
            Arc::clone(&valve),
            Arc::clone(&shared),
            Duration::from_millis(poll.interval_ms),
            Duration::from_millis(poll.settle_ms),
        ));
        Self {
            valve,
            poller,
            weather,
            shared,
        }
    }

    pub(crate) fn entity(&self) -> &str {
        &self.valve.config().valve_entity
    }

    /// Pick up a cycle that may already be running.
    pub(crate) async fn attach(&self) {
        self.shared
            .write()
            .await
            .record_system(format!("card {} attached", self.entity()));
        self.poller.start().await;
    }

    pub(crate) async fn detach(&self) {
        self.poller.stop().await;
        self.shared
            .write()
            .await
            .record_system(format!("card {} detached", self.entity()));
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    /// The single primary action: stop watering if the valve is open,
    /// otherwise start whatever the selection says.
    pub(crate) async fn toggle_valve(&self) -> Result<Action> {
        let on = self.valve.is_valve_on().await?;
        let selection = self.shared.read().await.selection;

        let action = if on {
            Action::TurnOff
        } else if selection.active_amount() == 0 {
            Action::Toggle
        } else {
            match selection.mode {
                Mode::Duration => {
                    let minutes = selection.duration;
                    let duration_seconds = minutes.checked_mul(60).ok_or_else(|| {
                        anyhow!("{minutes} minutes does not fit the device's duration field")
                    })?;
                    Action::Timed { duration_seconds }
                }
                Mode::Volume => Action::Volume {
                    volume_liters: selection.volume,
                },
            }
        };

        let label = match action {
            Action::TurnOff => "turn off".to_string(),
            Action::Toggle => "toggle".to_string(),
            Action::Timed { duration_seconds } => format!("water for {duration_seconds}s"),
            Action::Volume { volume_liters } => format!("water {volume_liters}L"),
        };

        self.command(&label, Some(on), !on, async {
            match action {
                Action::TurnOff => self.valve.turn_off().await,
                Action::Toggle => self.valve.toggle().await,
                Action::Timed { duration_seconds } => {
                    self.valve.start_timed_once(duration_seconds).await
                }
                Action::Volume { volume_liters } => {
                    self.valve.start_volume_based_once(volume_liters).await
                }
            }
        })
        .await?;
        Ok(action)
    }

    pub(crate) async fn turn_on(&self) -> Result<()> {
        let real = self.switch_hint().await;
        self.command("turn on", real, true, self.valve.turn_on())
            .await
    }

    pub(crate) async fn turn_off(&self) -> Result<()> {
        let real = self.switch_hint().await;
        self.command("turn off", real, false, self.valve.turn_off())
            .await
    }

    pub(crate) async fn water_timed(&self, program: TimedProgram) -> Result<()> {
        let label = format!(
            "timed program {}x{}s every {}s",
            program.total_number, program.irrigation_duration, program.irrigation_interval
        );
        let real = self.switch_hint().await;
        self.command(&label, real, true, self.valve.start_timed(program))
            .await
    }

    pub(crate) async fn water_volume(&self, program: VolumeProgram) -> Result<()> {
        let label = format!(
            "volume program {}x{}L every {}s",
            program.total_number, program.irrigation_capacity, program.irrigation_interval
        );
        let real = self.switch_hint().await;
        self.command(&label, real, true, self.valve.start_volume_based(program))
            .await
    }

    /// Best-effort current valve state for the optimistic switch. A read
    /// failure only means no optimistic feedback.
    async fn switch_hint(&self) -> Option<bool> {
        match self.valve.is_valve_on().await {
            Ok(on) => Some(on),
            Err(e) => {
                warn!(card = %self.entity(), error = %e, "valve state unavailable");
                None
            }
        }
    }

    /// Dispatch one command. When the valve is known to be in the other
    /// state, the switch shows `target` right away and is rolled back if the
    /// dispatch fails. On success the poller is resynchronised in the
    /// background.
    async fn command<F>(&self, label: &str, real: Option<bool>, target: bool, dispatch: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        if let Some(real) = real.filter(|r| *r != target) {
            self.shared
                .write()
                .await
                .switch
                .press(real, tokio::time::Instant::now());
        }

        if let Err(e) = dispatch.await {
            error!(card = %self.entity(), command = label, error = %e, "command failed");
            let mut st = self.shared.write().await;
            st.switch.revert();
            st.record_error(format!("{label} failed: {e:#}"));
            return Err(e);
        }

        self.shared.write().await.record_command(label.to_string());

        let poller = Arc::clone(&self.poller);
        tokio::spawn(async move {
            poller.resync().await;
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Selection
    // ---------------------------------------------------------------------

    /// Apply a partial change, clamping amounts to the card's maxima.
    pub(crate) async fn update_selection(&self, update: SelectionUpdate) -> Selection {
        let config = self.valve.config();
        let mut st = self.shared.write().await;
        if let Some(mode) = update.mode {
            st.selection.mode = mode;
        }
        if let Some(duration) = update.duration {
            st.selection.duration = duration.min(config.duration_max);
        }
        if let Some(volume) = update.volume {
            st.selection.volume = volume.min(config.volume_max);
        }
        st.selection
    }

    // ---------------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------------

    /// Fresh valve and battery readings merged with the last polled
    /// countdown. Host read failures are reported inside the snapshot.
    pub(crate) async fn status(&self) -> StatusResponse {
        let valve_on = self.switch_hint().await;
        let battery = match self.valve.battery_level().await {
            Ok(level) => level.map(Battery::from_level),
            Err(e) => {
                warn!(card = %self.entity(), error = %e, "battery level unavailable");
                None
            }
        };
        let weather = match &self.weather {
            Some(service) => service.report(OffsetDateTime::now_utc()).await,
            None => None,
        };
        let polling = self.poller.is_running().await;

        let mut st = self.shared.write().await;
        if let Some(on) = valve_on {
            st.record_valve(on);
        }
        if let Some(failed) = st.switch.expire(tokio::time::Instant::now()) {
            warn!(card = %self.entity(), "{}", failed.message);
            st.record_error(failed.message);
        }

        st.to_status(self.valve.config(), valve_on, battery, weather, polling)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
