//! HTTP surface: tournament administration plus the websocket upgrade.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::error::{ArenaError, ErrorKind};
use crate::session::{run_session, Services};
use crate::types::UserId;

pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/tournaments", post(create_tournament).get(list_tournaments))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(services)
}

fn status_for(err: &ArenaError) -> StatusCode {
    match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::State => StatusCode::CONFLICT,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(err: &ArenaError) -> Response {
    (status_for(err), Json(json!({ "error": err.to_string() }))).into_response()
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTournamentRequest {
    name: Option<String>,
    created_by: Option<String>,
    player_limit: Option<usize>,
    max_players_per_room: Option<usize>,
}

async fn create_tournament(
    State(services): State<Arc<Services>>,
    Json(body): Json<CreateTournamentRequest>,
) -> Response {
    let (Some(name), Some(created_by), Some(player_limit)) =
        (body.name, body.created_by, body.player_limit)
    else {
        return error_response(&ArenaError::validation(
            "name, createdBy and playerLimit are required",
        ));
    };
    let per_room = body
        .max_players_per_room
        .unwrap_or(services.config.max_players_per_room);

    match services
        .tournaments
        .open_tournament(&name, &UserId::new(created_by), player_limit, per_room)
        .await
    {
        Ok(tournament) => (StatusCode::CREATED, Json(tournament)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn list_tournaments(State(services): State<Arc<Services>>) -> Response {
    match services.tournaments.list_open().await {
        Ok(tournaments) => Json(tournaments).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

async fn ws_upgrade(
    State(services): State<Arc<Services>>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let user_id = match services.gateway.authenticate(&query.token).await {
        Ok(user_id) => user_id,
        Err(err) => return error_response(&err),
    };
    upgrade.on_upgrade(move |socket| run_session(services, user_id, socket))
}
