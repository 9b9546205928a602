//! Card configuration shared between the HTTP layer and the card runtimes.
//!
//! A handle created once in `main` and cloned into whoever needs it; there is
//! no process-wide instance.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::CardConfig;

#[derive(Clone, Default)]
pub(crate) struct ConfigRegistry {
    configs: Arc<RwLock<HashMap<String, CardConfig>>>,
}

impl ConfigRegistry {
    /// Store a copy of `config` under `entity_id`, replacing any previous one.
    pub(crate) async fn set(&self, entity_id: &str, config: CardConfig) {
        self.configs
            .write()
            .await
            .insert(entity_id.to_string(), config);
    }

    pub(crate) async fn get(&self, entity_id: &str) -> Option<CardConfig> {
        self.configs.read().await.get(entity_id).cloned()
    }

    pub(crate) async fn contains(&self, entity_id: &str) -> bool {
        self.configs.read().await.contains_key(entity_id)
    }

    pub(crate) async fn remove(&self, entity_id: &str) -> Option<CardConfig> {
        self.configs.write().await.remove(entity_id)
    }

    /// Sorted, so listings are stable.
    pub(crate) async fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(valve: &str) -> CardConfig {
        CardConfig {
            device_name: "dev".into(),
            valve_entity: valve.into(),
            title: None,
            battery_entity: None,
            timed_irrigation_entity: None,
            quantitative_irrigation_entity: None,
            weather_entity: None,
            duration_max: 60,
            volume_max: 100,
        }
    }

    #[tokio::test]
    async fn entity_ids_sorted() {
        let reg = ConfigRegistry::default();
        reg.set("switch.b", card("switch.b")).await;
        reg.set("switch.a", card("switch.a")).await;
        assert_eq!(reg.entity_ids().await, ["switch.a", "switch.b"]);
        assert_eq!(reg.get("switch.a").await.unwrap().valve_entity, "switch.a");
    }

    #[tokio::test]
    async fn set_get_remove() {
        let reg = ConfigRegistry::default();
        assert!(!reg.contains("switch.a").await);

        reg.set("switch.a", card("switch.a")).await;
        assert!(reg.contains("switch.a").await);

        let removed = reg.remove("switch.a").await.unwrap();
        assert_eq!(removed.valve_entity, "switch.a");
        assert!(reg.get("switch.a").await.is_none());
    }

    #[tokio::test]
    async fn clones_share_contents() {
        let reg = ConfigRegistry::default();
        let other = reg.clone();
        reg.set("switch.a", card("switch.a")).await;
        assert!(other.contains("switch.a").await);

        other.remove("switch.a").await;
        assert!(reg.entity_ids().await.is_empty());
    }

    #[tokio::test]
    async fn stored_config_is_a_copy() {
        let reg = ConfigRegistry::default();
        let mut cfg = card("switch.a");
        reg.set("switch.a", cfg.clone()).await;
        cfg.duration_max = 5;
        assert_eq!(reg.get("switch.a").await.unwrap().duration_max, 60);
    }
}
