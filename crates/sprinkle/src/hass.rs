//! Home Assistant host access: entity state reads and service calls over the
//! REST API.

use std::future::Future;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A state object as returned by `GET /api/states/<entity_id>`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EntityState {
    pub(crate) state: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub(crate) last_changed: Option<OffsetDateTime>,
    #[serde(default)]
    pub(crate) attributes: Map<String, Value>,
}

/// One recorded state change from `GET /api/history/period`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct HistoryEntry {
    pub(crate) state: String,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) last_changed: OffsetDateTime,
}

/// The host operations the card depends on.
pub(crate) trait HomeAssistant: Send + Sync + 'static {
    /// `Ok(None)` when the entity does not exist.
    fn entity_state(
        &self,
        entity_id: &str,
    ) -> impl Future<Output = Result<Option<EntityState>>> + Send;

    fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> impl Future<Output = Result<()>> + Send;

    /// State changes of one entity between `start` and `end`, oldest first.
    fn state_history(
        &self,
        entity_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>>> + Send;
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestClient {
    pub(crate) fn new(base_url: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url)
    }
}

impl HomeAssistant for RestClient {
    async fn entity_state(&self, entity_id: &str) -> Result<Option<EntityState>> {
        let response = self
            .http
            .get(self.url(&format!("states/{entity_id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET state of {entity_id} failed"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let state = response
            .error_for_status()
            .with_context(|| format!("host rejected state read of {entity_id}"))?
            .json::<EntityState>()
            .await
            .with_context(|| format!("unable to decode state of {entity_id}"))?;
        Ok(Some(state))
    }

    async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<()> {
        self.http
            .post(self.url(&format!("services/{domain}/{service}")))
            .bearer_auth(&self.token)
            .json(&data)
            .send()
            .await
            .with_context(|| format!("service call {domain}.{service} failed"))?
            .error_for_status()
            .with_context(|| format!("host rejected service call {domain}.{service}"))?;
        Ok(())
    }

    async fn state_history(
        &self,
        entity_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<HistoryEntry>> {
        let start = rfc3339(start)?;
        let end = rfc3339(end)?;
        let series = self
            .http
            .get(self.url(&format!("history/period/{start}")))
            .bearer_auth(&self.token)
            .query(&[
                ("filter_entity_id", entity_id),
                ("end_time", end.as_str()),
                ("minimal_response", ""),
                ("no_attributes", ""),
            ])
            .send()
            .await
            .with_context(|| format!("GET history of {entity_id} failed"))?
            .error_for_status()
            .with_context(|| format!("host rejected history read of {entity_id}"))?
            .json::<Vec<Vec<HistoryEntry>>>()
            .await
            .with_context(|| format!("unable to decode history of {entity_id}"))?;
        Ok(series.into_iter().next().unwrap_or_default())
    }
}

fn rfc3339(ts: OffsetDateTime) -> Result<String> {
    ts.to_offset(time::UtcOffset::UTC)
        .format(&Rfc3339)
        .context("failed to format timestamp")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn entity_state_deserialize_full() {
        let json = r#"{
            "entity_id": "switch.garden_valve",
            "state": "on",
            "last_changed": "2024-06-01T12:00:00.123456+00:00",
            "last_updated": "2024-06-01T12:00:00.123456+00:00",
            "attributes": {"friendly_name": "Garden valve"},
            "context": {"id": "abc", "parent_id": null, "user_id": null}
        }"#;
        let st: EntityState = serde_json::from_str(json).unwrap();
        assert_eq!(st.state, "on");
        assert_eq!(
            st.last_changed.unwrap().replace_nanosecond(0).unwrap(),
            datetime!(2024-06-01 12:00:00 UTC)
        );
        assert_eq!(st.attributes["friendly_name"], "Garden valve");
    }

    #[test]
    fn entity_state_deserialize_minimal() {
        let json = r#"{"entity_id": "sensor.x", "state": "{}"}"#;
        let st: EntityState = serde_json::from_str(json).unwrap();
        assert!(st.last_changed.is_none());
        assert!(st.attributes.is_empty());
    }

    #[test]
    fn entity_state_bad_timestamp_fails() {
        let json = r#"{"entity_id": "sensor.x", "state": "on", "last_changed": "yesterday"}"#;
        assert!(serde_json::from_str::<EntityState>(json).is_err());
    }

    #[test]
    fn history_response_deserialize() {
        // minimal_response drops everything but state and last_changed after
        // the first entry
        let json = r#"[[
            {"entity_id": "weather.home", "state": "rainy",
             "last_changed": "2024-06-01T10:00:00+00:00", "attributes": {}},
            {"state": "cloudy", "last_changed": "2024-06-01T12:30:00+00:00"}
        ]]"#;
        let series: Vec<Vec<HistoryEntry>> = serde_json::from_str(json).unwrap();
        assert_eq!(
            series[0],
            [
                HistoryEntry {
                    state: "rainy".into(),
                    last_changed: datetime!(2024-06-01 10:00:00 UTC),
                },
                HistoryEntry {
                    state: "cloudy".into(),
                    last_changed: datetime!(2024-06-01 12:30:00 UTC),
                },
            ]
        );
    }

    #[test]
    fn history_timestamps_are_utc() {
        let ts = datetime!(2024-06-01 14:00:00 +02:00);
        assert_eq!(rfc3339(ts).unwrap(), "2024-06-01T12:00:00Z");
    }

    #[test]
    fn rest_client_trims_trailing_slash() {
        let client = RestClient::new("http://ha.local:8123/", "token").unwrap();
        assert_eq!(
            client.url("states/switch.v"),
            "http://ha.local:8123/api/states/switch.v"
        );
    }
}
