//! Per-connection session handling.
//!
//! Each accepted websocket gets a [`run_session`] loop: commands flow
//! in as JSON frames, server events flow out through the fan-out bus.
//! Command errors never close the connection; they come back as an
//! `error` event on the same socket.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::fanout::{RoomBus, Target};
use crate::gateway::SessionGateway;
use crate::match_play::MatchService;
use crate::protocol::{ClientCommand, ServerEvent};
use crate::room::RoomService;
use crate::scheduler::TaskQueue;
use crate::store::DocumentStore;
use crate::tournament::TournamentService;
use crate::types::UserId;

/// Everything a connection or HTTP handler needs, shared per process.
pub struct Services {
    pub config: Arc<ArenaConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub tasks: Arc<dyn TaskQueue>,
    pub bus: Arc<RoomBus>,
    pub gateway: Arc<SessionGateway>,
    pub rooms: Arc<RoomService>,
    pub matches: Arc<MatchService>,
    pub tournaments: Arc<TournamentService>,
}

/// Drive one authenticated websocket until it closes.
pub async fn run_session(services: Arc<Services>, user_id: UserId, socket: WebSocket) {
    let connection_id = Uuid::new_v4().to_string();
    let session = match services.gateway.connect(&user_id, &connection_id).await {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(%user_id, error = %err, "failed to record presence, dropping connection");
            return;
        }
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();
    services.bus.register_session(user_id.clone(), events_tx);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::error!(error = %err, "failed to serialize outbound event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    tracing::info!(%user_id, connection_id, "session started");
    if let Err(err) = services
        .bus
        .broadcast(
            Target::Global,
            ServerEvent::UserOnline {
                user_id: user_id.clone(),
            },
        )
        .await
    {
        tracing::warn!(%user_id, error = %err, "failed to announce user online");
    }

    while let Some(frame) = ws_rx.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(_) => break,
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Pings are answered by axum; ignore the rest.
            _ => continue,
        };
        let command = match serde_json::from_str::<ClientCommand>(&text) {
            Ok(command) => command,
            Err(err) => {
                let _ = services
                    .bus
                    .send_to_user(
                        &user_id,
                        ServerEvent::from_error(&ArenaError::validation(format!(
                            "unrecognized command: {err}"
                        ))),
                    )
                    .await;
                continue;
            }
        };
        if let Err(err) = dispatch(&services, &user_id, command).await {
            tracing::debug!(%user_id, error = %err, "command rejected");
            let _ = services
                .bus
                .send_to_user(&user_id, ServerEvent::from_error(&err))
                .await;
        }
    }

    // Teardown in reverse order of setup.
    services.bus.unregister_session(&user_id);
    writer.abort();
    if let Err(err) = services.rooms.handle_disconnect(&user_id).await {
        tracing::warn!(%user_id, error = %err, "disconnect bookkeeping failed");
    }
    if let Err(err) = services.gateway.disconnect(&session).await {
        tracing::warn!(%user_id, error = %err, "failed to clear presence");
    }
    if let Err(err) = services
        .bus
        .broadcast(
            Target::Global,
            ServerEvent::UserOffline {
                user_id: user_id.clone(),
            },
        )
        .await
    {
        tracing::warn!(%user_id, error = %err, "failed to announce user offline");
    }
    tracing::info!(%user_id, connection_id, "session ended");
}

async fn dispatch(
    services: &Services,
    user_id: &UserId,
    command: ClientCommand,
) -> Result<(), ArenaError> {
    match command {
        ClientCommand::JoinRoom {
            room_id,
            create_new_room,
            user_name,
        } => {
            let name = user_name.unwrap_or_else(|| format!("Player_{user_id}"));
            services
                .rooms
                .join_room(user_id, &name, room_id, create_new_room)
                .await?;
        }
        ClientCommand::RollDice { room_id } | ClientCommand::TournamentRollDice { room_id } => {
            services.matches.roll_dice(&room_id, user_id).await?;
        }
        ClientCommand::MovePiece { room_id, piece_id }
        | ClientCommand::TournamentMovePiece { room_id, piece_id } => {
            services
                .matches
                .move_piece(&room_id, user_id, piece_id)
                .await?;
        }
        ClientCommand::JoinTournament { tournament_id } => {
            services
                .tournaments
                .join_tournament(&tournament_id, user_id)
                .await?;
        }
    }
    Ok(())
}
