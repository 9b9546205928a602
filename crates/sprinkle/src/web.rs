use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::card::{Card, SelectionUpdate};
use crate::hass::HomeAssistant;
use crate::mqtt::{CommandBus, TimedProgram, VolumeProgram};
use crate::registry::ConfigRegistry;

const INDEX_HTML: &str = include_str!("ui/index.html");

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

pub(crate) type Cards<H, B> = Arc<HashMap<String, Arc<Card<H, B>>>>;

pub(crate) struct AppState<H, B> {
    pub(crate) registry: ConfigRegistry,
    pub(crate) cards: Cards<H, B>,
}

// Manual impl: derive would require `H: Clone, B: Clone`.
impl<H, B> Clone for AppState<H, B> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            cards: Arc::clone(&self.cards),
        }
    }
}

impl<H, B> AppState<H, B> {
    /// A card is only reachable while it is registered.
    async fn card(&self, entity: &str) -> Result<Arc<Card<H, B>>, Response> {
        if !self.registry.contains(entity).await {
            return Err(not_found(entity));
        }
        self.cards.get(entity).cloned().ok_or_else(|| not_found(entity))
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

fn one() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct TimedRequest {
    duration_seconds: u32,
    #[serde(default)]
    current_count: u32,
    #[serde(default = "one")]
    total_number: u32,
    #[serde(default)]
    irrigation_interval: u32,
}

#[derive(Debug, Deserialize)]
struct VolumeRequest {
    volume_liters: u32,
    #[serde(default)]
    current_count: u32,
    #[serde(default = "one")]
    total_number: u32,
    #[serde(default)]
    irrigation_interval: u32,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub(crate) fn router<H: HomeAssistant, B: CommandBus>(state: AppState<H, B>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/cards", get(list_cards::<H, B>))
        .route("/api/cards/{entity}", get(card_status::<H, B>))
        .route("/api/cards/{entity}/toggle", post(toggle::<H, B>))
        .route("/api/cards/{entity}/on", post(turn_on::<H, B>))
        .route("/api/cards/{entity}/off", post(turn_off::<H, B>))
        .route("/api/cards/{entity}/water/timed", post(water_timed::<H, B>))
        .route("/api/cards/{entity}/water/volume", post(water_volume::<H, B>))
        .route("/api/cards/{entity}/selection", put(selection::<H, B>))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn list_cards<H: HomeAssistant, B: CommandBus>(State(app): State<AppState<H, B>>) -> impl IntoResponse {
    let mut configs = Vec::new();
    for id in app.registry.entity_ids().await {
        if let Some(cfg) = app.registry.get(&id).await {
            configs.push(cfg);
        }
    }
    Json(configs)
}

async fn card_status<H: HomeAssistant, B: CommandBus>(
    State(app): State<AppState<H, B>>,
    Path(entity): Path<String>,
) -> Response {
    match app.card(&entity).await {
        Ok(card) => Json(card.status().await).into_response(),
        Err(resp) => resp,
    }
}

async fn toggle<H: HomeAssistant, B: CommandBus>(
    State(app): State<AppState<H, B>>,
    Path(entity): Path<String>,
) -> Response {
    let card = match app.card(&entity).await {
        Ok(card) => card,
        Err(resp) => return resp,
    };
    match card.toggle_valve().await {
        Ok(action) => Json(action).into_response(),
        Err(e) => bad_gateway(e),
    }
}

async fn turn_on<H: HomeAssistant, B: CommandBus>(
    State(app): State<AppState<H, B>>,
    Path(entity): Path<String>,
) -> Response {
    let card = match app.card(&entity).await {
        Ok(card) => card,
        Err(resp) => return resp,
    };
    acknowledged(card.turn_on().await)
}

async fn turn_off<H: HomeAssistant, B: CommandBus>(
    State(app): State<AppState<H, B>>,
    Path(entity): Path<String>,
) -> Response {
    let card = match app.card(&entity).await {
        Ok(card) => card,
        Err(resp) => return resp,
    };
    acknowledged(card.turn_off().await)
}

async fn water_timed<H: HomeAssistant, B: CommandBus>(
    State(app): State<AppState<H, B>>,
    Path(entity): Path<String>,
    Json(req): Json<TimedRequest>,
) -> Response {
    let card = match app.card(&entity).await {
        Ok(card) => card,
        Err(resp) => return resp,
    };
    if req.duration_seconds == 0 {
        return unprocessable("duration_seconds must be positive");
    }
    if req.total_number == 0 {
        return unprocessable("total_number must be positive");
    }
    let program = TimedProgram {
        current_count: req.current_count,
        total_number: req.total_number,
        irrigation_duration: req.duration_seconds,
        irrigation_interval: req.irrigation_interval,
    };
    acknowledged(card.water_timed(program).await)
}

async fn water_volume<H: HomeAssistant, B: CommandBus>(
    State(app): State<AppState<H, B>>,
    Path(entity): Path<String>,
    Json(req): Json<VolumeRequest>,
) -> Response {
    let card = match app.card(&entity).await {
        Ok(card) => card,
        Err(resp) => return resp,
    };
    if req.volume_liters == 0 {
        return unprocessable("volume_liters must be positive");
    }
    if req.total_number == 0 {
        return unprocessable("total_number must be positive");
    }
    let program = VolumeProgram {
        current_count: req.current_count,
        total_number: req.total_number,
        irrigation_capacity: req.volume_liters,
        irrigation_interval: req.irrigation_interval,
    };
    acknowledged(card.water_volume(program).await)
}

async fn selection<H: HomeAssistant, B: CommandBus>(
    State(app): State<AppState<H, B>>,
    Path(entity): Path<String>,
    Json(update): Json<SelectionUpdate>,
) -> Response {
    match app.card(&entity).await {
        Ok(card) => Json(card.update_selection(update).await).into_response(),
        Err(resp) => resp,
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

fn acknowledged(result: Result<()>) -> Response {
    match result {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => bad_gateway(e),
    }
}

fn not_found(entity: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown card {entity}") })),
    )
        .into_response()
}

fn unprocessable(message: &str) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "error": message })),
    )
        .into_response()
}

fn bad_gateway(e: anyhow::Error) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": format!("{e:#}") })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub(crate) async fn serve<H: HomeAssistant, B: CommandBus>(
    state: AppState<H, B>,
    port: u16,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web ui listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
