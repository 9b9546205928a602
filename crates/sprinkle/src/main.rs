mod card;
mod config;
mod countdown;
mod display;
mod hass;
mod mqtt;
mod optimistic;
mod poller;
mod registry;
mod state;
mod telemetry;
mod valve;
mod weather;
mod web;

#[cfg(test)]
mod testing;

use anyhow::Result;
use std::{collections::HashMap, env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use card::Card;
use config::BusKind;
use hass::RestClient;
use mqtt::{AnyBus, BrokerBus, HassBus};
use registry::ConfigRegistry;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path, env::var("HASS_TOKEN").ok())?;

    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(cfg.web.port);

    // ── Host + command bus ──────────────────────────────────────────
    let token = cfg.hass.token.as_deref().unwrap_or_default();
    let hass = Arc::new(RestClient::new(&cfg.hass.url, token)?);

    let bus = Arc::new(match cfg.bus.kind {
        BusKind::Hass => AnyBus::Hass(HassBus::new(Arc::clone(&hass))),
        BusKind::Broker => AnyBus::Broker(BrokerBus::connect(
            &cfg.bus.client_id,
            &cfg.bus.host,
            cfg.bus.port,
        )),
    });
    info!(url = %cfg.hass.url, bus = ?cfg.bus.kind, "host client ready");

    // ── Cards ───────────────────────────────────────────────────────
    let registry = ConfigRegistry::default();
    let mut cards = HashMap::new();
    for card_cfg in &cfg.cards {
        registry.set(&card_cfg.valve_entity, card_cfg.clone()).await;
        let card = Arc::new(Card::new(
            Arc::clone(&hass),
            Arc::clone(&bus),
            card_cfg.clone(),
            &cfg.poll,
        ));
        card.attach().await;
        cards.insert(card_cfg.valve_entity.clone(), card);
    }
    let cards = Arc::new(cards);
    info!(cards = cards.len(), "cards attached");

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState {
        registry: registry.clone(),
        cards: Arc::clone(&cards),
    };

    let outcome = tokio::select! {
        res = web::serve(web_state, web_port) => res,
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutting down");
            Ok(())
        }
    };

    // ── Teardown ────────────────────────────────────────────────────
    for card in cards.values() {
        card.detach().await;
        registry.remove(card.entity()).await;
    }

    outcome
}
