//! In-memory stand-ins for the host and the command bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::hass::{EntityState, HistoryEntry, HomeAssistant};
use crate::mqtt::CommandBus;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServiceCall {
    pub(crate) domain: String,
    pub(crate) service: String,
    pub(crate) data: Value,
}

#[derive(Default)]
pub(crate) struct FakeHass {
    states: Mutex<HashMap<String, EntityState>>,
    calls: Mutex<Vec<ServiceCall>>,
    history: Mutex<HashMap<String, Vec<HistoryEntry>>>,
    history_reads: AtomicUsize,
    fail_reads: AtomicBool,
    fail_calls: AtomicBool,
}

impl FakeHass {
    pub(crate) fn set_state(&self, entity_id: &str, state: &str, last_changed: Option<OffsetDateTime>) {
        self.states.lock().unwrap().insert(
            entity_id.to_string(),
            EntityState {
                state: state.to_string(),
                last_changed,
                attributes: Map::new(),
            },
        );
    }

    /// Replace the attributes of an entity set with `set_state`.
    pub(crate) fn set_attributes(&self, entity_id: &str, attributes: Value) {
        if let (Some(entity), Value::Object(map)) =
            (self.states.lock().unwrap().get_mut(entity_id), attributes)
        {
            entity.attributes = map;
        }
    }

    pub(crate) fn set_history(&self, entity_id: &str, entries: Vec<(&str, OffsetDateTime)>) {
        let entries = entries
            .into_iter()
            .map(|(state, last_changed)| HistoryEntry {
                state: state.to_string(),
                last_changed,
            })
            .collect();
        self.history
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), entries);
    }

    pub(crate) fn history_reads(&self) -> usize {
        self.history_reads.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }
}

impl HomeAssistant for FakeHass {
    async fn entity_state(&self, entity_id: &str) -> Result<Option<EntityState>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("host unreachable");
        }
        Ok(self.states.lock().unwrap().get(entity_id).cloned())
    }

    async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<()> {
        if self.fail_calls.load(Ordering::SeqCst) {
            bail!("service call {domain}.{service} rejected");
        }
        self.calls.lock().unwrap().push(ServiceCall {
            domain: domain.to_string(),
            service: service.to_string(),
            data,
        });
        Ok(())
    }

    async fn state_history(
        &self,
        entity_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<HistoryEntry>> {
        self.history_reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("host unreachable");
        }
        let entries = self
            .history
            .lock()
            .unwrap()
            .get(entity_id)
            .cloned()
            .unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter(|e| e.last_changed >= start && e.last_changed <= end)
            .collect())
    }
}

#[derive(Default)]
pub(crate) struct FakeBus {
    published: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl FakeBus {
    pub(crate) fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    pub(crate) fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl CommandBus for FakeBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("broker connection refused");
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}
