//! Valve control and read-side projections for one configured card.
//!
//! Switch operations go to the host as `switch.*` service calls; cyclic
//! programs are published on the command bus to the device's zigbee2mqtt
//! topic. Failures are never swallowed here.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use time::OffsetDateTime;
use tracing::info;

use crate::config::CardConfig;
use crate::countdown::{self, CountdownInfo, OutputState};
use crate::hass::HomeAssistant;
use crate::mqtt::{device_set_topic, CommandBus, IrrigationCommand, TimedProgram, VolumeProgram};

pub(crate) struct ValveService<H, B> {
    hass: Arc<H>,
    bus: Arc<B>,
    config: CardConfig,
}

impl<H: HomeAssistant, B: CommandBus> ValveService<H, B> {
    pub(crate) fn new(hass: Arc<H>, bus: Arc<B>, config: CardConfig) -> Self {
        Self { hass, bus, config }
    }

    pub(crate) fn config(&self) -> &CardConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Read side
    // ---------------------------------------------------------------------

    pub(crate) async fn is_valve_on(&self) -> Result<bool> {
        let entity = self.hass.entity_state(&self.config.valve_entity).await?;
        Ok(OutputState::from(entity.as_ref()).is_on)
    }

    /// Battery percentage, `None` when unconfigured, missing or non-numeric.
    pub(crate) async fn battery_level(&self) -> Result<Option<f64>> {
        let Some(entity_id) = &self.config.battery_entity else {
            return Ok(None);
        };
        let level = self
            .hass
            .entity_state(entity_id)
            .await?
            .and_then(|e| e.state.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite());
        Ok(level)
    }

    /// Fresh countdown for the timed program, evaluated at `now`.
    pub(crate) async fn countdown_info(&self, now: OffsetDateTime) -> Result<CountdownInfo> {
        let valve = self.hass.entity_state(&self.config.valve_entity).await?;
        let output = OutputState::from(valve.as_ref());

        let raw_program = match &self.config.timed_irrigation_entity {
            Some(id) => self.hass.entity_state(id).await?.map(|e| e.state),
            None => None,
        };

        Ok(countdown::present(&output, raw_program.as_deref(), now))
    }

    // ---------------------------------------------------------------------
    // Switch passthroughs
    // ---------------------------------------------------------------------

    pub(crate) async fn toggle(&self) -> Result<()> {
        self.switch_service("toggle").await
    }

    pub(crate) async fn turn_on(&self) -> Result<()> {
        self.switch_service("turn_on").await
    }

    pub(crate) async fn turn_off(&self) -> Result<()> {
        self.switch_service("turn_off").await
    }

    async fn switch_service(&self, service: &str) -> Result<()> {
        info!(card = %self.config.valve_entity, service, "switch command");
        self.hass
            .call_service(
                "switch",
                service,
                json!({ "entity_id": self.config.valve_entity }),
            )
            .await
    }

    // ---------------------------------------------------------------------
    // Cyclic programs
    // ---------------------------------------------------------------------

    pub(crate) async fn start_timed_once(&self, duration_seconds: u32) -> Result<()> {
        self.start_timed(TimedProgram::once(duration_seconds)).await
    }

    pub(crate) async fn start_volume_based_once(&self, volume_liters: u32) -> Result<()> {
        self.start_volume_based(VolumeProgram::once(volume_liters))
            .await
    }

    pub(crate) async fn start_timed(&self, program: TimedProgram) -> Result<()> {
        self.dispatch(IrrigationCommand::CyclicTimedIrrigation(program))
            .await
    }

    pub(crate) async fn start_volume_based(&self, program: VolumeProgram) -> Result<()> {
        self.dispatch(IrrigationCommand::CyclicQuantitativeIrrigation(program))
            .await
    }

    async fn dispatch(&self, command: IrrigationCommand) -> Result<()> {
        let topic = device_set_topic(&self.config.device_name);
        let payload = command.to_payload()?;
        info!(card = %self.config.valve_entity, topic = %topic, payload = %payload, "irrigation command");
        self.bus.publish(&topic, payload).await
    }
}

// ---------------------------------------------------------------------------
// Countdown source
// ---------------------------------------------------------------------------

/// Anything the poller can pull a countdown from.
pub(crate) trait CountdownSource: Send + Sync + 'static {
    fn countdown(&self) -> impl Future<Output = Result<CountdownInfo>> + Send;
}

impl<H: HomeAssistant, B: CommandBus> CountdownSource for ValveService<H, B> {
    async fn countdown(&self) -> Result<CountdownInfo> {
        self.countdown_info(OffsetDateTime::now_utc()).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
