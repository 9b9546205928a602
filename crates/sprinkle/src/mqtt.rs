use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::hass::{HomeAssistant, RestClient};

// ---------------------------------------------------------------------------
// Command payloads (zigbee2mqtt wire format)
// ---------------------------------------------------------------------------

/// One timed cyclic program: `total_number` iterations of
/// `irrigation_duration` seconds, `irrigation_interval` seconds apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct TimedProgram {
    pub(crate) current_count: u32,
    pub(crate) total_number: u32,
    pub(crate) irrigation_duration: u32,
    pub(crate) irrigation_interval: u32,
}

impl TimedProgram {
    /// A single iteration.
    pub(crate) fn once(duration_seconds: u32) -> Self {
        Self {
            current_count: 0,
            total_number: 1,
            irrigation_duration: duration_seconds,
            irrigation_interval: 0,
        }
    }
}

/// One volume-based cyclic program; `irrigation_capacity` is in liters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct VolumeProgram {
    pub(crate) current_count: u32,
    pub(crate) total_number: u32,
    pub(crate) irrigation_capacity: u32,
    pub(crate) irrigation_interval: u32,
}

impl VolumeProgram {
    pub(crate) fn once(volume_liters: u32) -> Self {
        Self {
            current_count: 0,
            total_number: 1,
            irrigation_capacity: volume_liters,
            irrigation_interval: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum IrrigationCommand {
    CyclicTimedIrrigation(TimedProgram),
    CyclicQuantitativeIrrigation(VolumeProgram),
}

impl IrrigationCommand {
    pub(crate) fn to_payload(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode irrigation command")
    }
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// "zigbee2mqtt/<device_name>/set"
pub(crate) fn device_set_topic(device_name: &str) -> String {
    format!("zigbee2mqtt/{device_name}/set")
}

/// Extract device_name from "zigbee2mqtt/<device_name>/set".
pub(crate) fn extract_device_name(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "zigbee2mqtt" && parts[2] == "set" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Command bus
// ---------------------------------------------------------------------------

/// Where device-bound commands are published.
pub(crate) trait CommandBus: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: String) -> impl Future<Output = Result<()>> + Send;
}

/// Publishes through the host's `mqtt.publish` service, so the host's own
/// broker connection carries the command.
pub(crate) struct HassBus<H> {
    hass: Arc<H>,
}

impl<H: HomeAssistant> HassBus<H> {
    pub(crate) fn new(hass: Arc<H>) -> Self {
        Self { hass }
    }
}

impl<H: HomeAssistant> CommandBus for HassBus<H> {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        self.hass
            .call_service("mqtt", "publish", json!({ "topic": topic, "payload": payload }))
            .await
    }
}

/// Publishes straight to an MQTT broker.
pub(crate) struct BrokerBus {
    client: AsyncClient,
}

impl BrokerBus {
    /// Connect and keep the event loop running on a background task.
    pub(crate) fn connect(client_id: &str, host: &str, port: u16) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 20);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("command bus connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("command bus error: {e}. reconnecting...");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client }
    }
}

impl CommandBus for BrokerBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.into_bytes())
            .await
            .with_context(|| format!("failed to publish to {topic}"))
    }
}

/// The bus selected by configuration.
pub(crate) enum AnyBus {
    Hass(HassBus<RestClient>),
    Broker(BrokerBus),
}

impl CommandBus for AnyBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        match self {
            AnyBus::Hass(bus) => bus.publish(topic, payload).await,
            AnyBus::Broker(bus) => bus.publish(topic, payload).await,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
