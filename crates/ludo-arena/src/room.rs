//! Room documents and the ad-hoc room lifecycle.
//!
//! A room is created on first join (or by the bracket manager for
//! tournament rounds), mutated through match play, and archived shortly
//! after its game ends. Only this module and the bracket manager write
//! room documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::fanout::{RoomBus, Target};
use crate::game::{GameState, WinRule};
use crate::protocol::ServerEvent;
use crate::scheduler::{Schedule, TaskKind, TaskQueue};
use crate::store::{keys, with_document, DocumentStore, DocumentStoreExt, PutResult};
use crate::types::{RoomId, TournamentId, UserId};

/// Seat colors in join order.
pub const PLAYER_COLORS: [&str; 4] = ["red", "green", "yellow", "blue"];

/// A seated player. The seat survives disconnection; `is_online` tracks
/// the live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub user_id: UserId,
    pub user_name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub position: Option<usize>,
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Player {
    pub fn new(user_id: UserId, user_name: impl Into<String>, seat: usize) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            color: PLAYER_COLORS.get(seat).map(|c| (*c).to_string()),
            position: Some(seat),
            is_online: true,
            last_seen: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: RoomId,
    #[serde(default)]
    pub tournament_id: Option<TournamentId>,
    pub players: Vec<Player>,
    pub max_players: usize,
    pub game_started: bool,
    #[serde(default)]
    pub game_state: Option<GameState>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<UserId>,
}

impl Room {
    pub fn new(
        room_id: RoomId,
        max_players: usize,
        tournament_id: Option<TournamentId>,
        created_by: Option<UserId>,
    ) -> Self {
        Self {
            room_id,
            tournament_id,
            players: Vec::new(),
            max_players,
            game_started: false,
            game_state: None,
            created_at: Utc::now(),
            created_by,
        }
    }

    /// Seat a player in join order, assigning color and seat index.
    pub fn seat(&mut self, user_id: UserId, user_name: &str) -> Result<Player, ArenaError> {
        if self.game_started {
            return Err(ArenaError::AlreadyStarted);
        }
        if self.players.len() >= self.max_players {
            return Err(ArenaError::RoomFull);
        }
        let player = Player::new(user_id, user_name, self.players.len());
        self.players.push(player.clone());
        Ok(player)
    }

    /// Initialize the game state from the join order. Idempotent:
    /// returns false when the game already started.
    pub fn start(&mut self, win_rule: WinRule) -> Result<bool, ArenaError> {
        if self.game_started {
            return Ok(false);
        }
        let turn_order: Vec<UserId> = self.players.iter().map(|p| p.user_id.clone()).collect();
        self.game_state = Some(GameState::new(turn_order, win_rule)?);
        self.game_started = true;
        Ok(true)
    }

    /// The win rule this room plays under.
    pub fn win_rule(&self) -> WinRule {
        if self.tournament_id.is_some() {
            WinRule::FirstPieceFinished
        } else {
            WinRule::AllPiecesFinished
        }
    }

    pub fn player_mut(&mut self, user_id: &UserId) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| &p.user_id == user_id)
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players
    }
}

/// Orchestrates ad-hoc room membership over the shared store.
pub struct RoomService {
    store: Arc<dyn DocumentStore>,
    bus: Arc<RoomBus>,
    tasks: Arc<dyn TaskQueue>,
    config: Arc<ArenaConfig>,
}

impl RoomService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        bus: Arc<RoomBus>,
        tasks: Arc<dyn TaskQueue>,
        config: Arc<ArenaConfig>,
    ) -> Self {
        Self {
            store,
            bus,
            tasks,
            config,
        }
    }

    /// Join an existing room or create a new one. Starts the game when
    /// the last seat fills.
    pub async fn join_room(
        &self,
        user_id: &UserId,
        user_name: &str,
        room_id: Option<RoomId>,
        create_new: bool,
    ) -> Result<RoomId, ArenaError> {
        if self
            .store
            .get_raw(&keys::user_room(user_id))
            .await?
            .is_some()
        {
            return Err(ArenaError::AlreadyInRoom);
        }

        let (room_id, player, players) = if create_new || room_id.is_none() {
            self.create_room(user_id, user_name).await?
        } else {
            let room_id = room_id.unwrap_or_else(RoomId::generate);
            let key = keys::room(&room_id);
            let missing_id = room_id.clone();
            let (player, players) = with_document::<Room, _, _, _>(
                &*self.store,
                &key,
                self.config.cas_max_retries,
                move || ArenaError::RoomNotFound {
                    room_id: missing_id.clone(),
                },
                |room| {
                    let player = room.seat(user_id.clone(), user_name)?;
                    Ok((player, room.players.clone()))
                },
            )
            .await?;
            (room_id, player, players)
        };

        self.store
            .put_json(&keys::user_room(user_id), &room_id, None)
            .await?;
        self.bus.join(Target::room(&room_id), user_id.clone());

        self.bus
            .send_to_user(
                user_id,
                ServerEvent::RoomJoined {
                    room_id: room_id.clone(),
                    player: player.clone(),
                    players: players.clone(),
                },
            )
            .await?;
        self.bus
            .broadcast(
                Target::room(&room_id),
                ServerEvent::PlayerJoined {
                    room_id: Some(room_id.clone()),
                    tournament_id: None,
                    player,
                },
            )
            .await?;

        tracing::info!(%room_id, %user_id, seats = players.len(), "player joined room");

        if players.len() >= self.config.max_players_per_room {
            self.start_game(&room_id).await?;
        }
        Ok(room_id)
    }

    async fn create_room(
        &self,
        user_id: &UserId,
        user_name: &str,
    ) -> Result<(RoomId, Player, Vec<Player>), ArenaError> {
        // Room codes are short; retry on the unlikely collision.
        for _ in 0..3 {
            let room_id = RoomId::generate();
            let mut room = Room::new(
                room_id.clone(),
                self.config.max_players_per_room,
                None,
                Some(user_id.clone()),
            );
            let player = room.seat(user_id.clone(), user_name)?;
            match self
                .store
                .put_json(&keys::room(&room_id), &room, Some(0))
                .await?
            {
                PutResult::Stored(_) => return Ok((room_id, player, room.players)),
                PutResult::Conflict { .. } => continue,
            }
        }
        Err(ArenaError::transient("could not allocate a room id"))
    }

    /// Start a room's game. Idempotent when already started.
    pub async fn start_game(&self, room_id: &RoomId) -> Result<(), ArenaError> {
        let key = keys::room(room_id);
        let missing_id = room_id.clone();
        let started = with_document::<Room, _, _, _>(
            &*self.store,
            &key,
            self.config.cas_max_retries,
            move || ArenaError::RoomNotFound {
                room_id: missing_id.clone(),
            },
            |room| {
                let win_rule = room.win_rule();
                if !room.start(win_rule)? {
                    return Ok(None);
                }
                Ok(Some((
                    room.game_state.clone().expect("state set by start"),
                    room.players.clone(),
                )))
            },
        )
        .await?;

        let Some((game_state, players)) = started else {
            return Ok(());
        };

        tracing::info!(%room_id, players = players.len(), "game started");
        self.bus
            .broadcast(
                Target::room(room_id),
                ServerEvent::GameStarted {
                    room_id: room_id.clone(),
                    game_state,
                    players,
                },
            )
            .await?;

        // First turn's stall guard.
        self.tasks
            .enqueue(
                TaskKind::TurnTimeout {
                    room_id: room_id.clone(),
                    turn_serial: 0,
                },
                Schedule::Once {
                    delay: self.config.turn_timeout,
                },
            )
            .await?;
        Ok(())
    }

    /// Mark a disconnected player offline, preserving their seat.
    pub async fn handle_disconnect(&self, user_id: &UserId) -> Result<(), ArenaError> {
        let link_key = keys::user_room(user_id);
        let Some((room_id, _)) = self.store.get_json::<RoomId>(&link_key).await? else {
            return Ok(());
        };

        let key = keys::room(&room_id);
        let updated = {
            let user_id = user_id.clone();
            let missing_id = room_id.clone();
            with_document::<Room, _, _, _>(
                &*self.store,
                &key,
                self.config.cas_max_retries,
                move || ArenaError::RoomNotFound {
                    room_id: missing_id.clone(),
                },
                move |room| {
                    if let Some(player) = room.player_mut(&user_id) {
                        player.is_online = false;
                        player.last_seen = Some(Utc::now());
                    }
                    let online = room.players.iter().filter(|p| p.is_online).count();
                    Ok((room.game_started, online, room.players.len()))
                },
            )
            .await
        };

        match updated {
            Ok((game_started, online, total)) => {
                self.bus
                    .broadcast(
                        Target::room(&room_id),
                        ServerEvent::PlayerDisconnected {
                            room_id: room_id.clone(),
                            user_id: user_id.clone(),
                            online_players: online,
                            total_players: total,
                        },
                    )
                    .await?;
                // An unstarted room releases the seat link so the player
                // can join elsewhere; a started game keeps it for
                // reconnection.
                if !game_started {
                    self.store.delete(&link_key).await?;
                }
            }
            Err(ArenaError::RoomNotFound { .. }) => {
                // Room already archived; just clear the stale link.
                self.store.delete(&link_key).await?;
            }
            Err(err) => return Err(err),
        }
        self.bus.leave(&Target::room(&room_id), user_id);
        Ok(())
    }

    /// Delete a finished room and clear its players' seat links.
    pub async fn archive_room(&self, room_id: &RoomId) -> Result<(), ArenaError> {
        let key = keys::room(room_id);
        let Some((room, _)) = self.store.get_json::<Room>(&key).await? else {
            return Ok(());
        };
        self.store.delete(&key).await?;
        for player in &room.players {
            self.store.delete(&keys::user_room(&player.user_id)).await?;
        }
        tracing::info!(%room_id, "room archived");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seating_assigns_colors_in_join_order() {
        let mut room = Room::new(RoomId::new("AB12CD"), 4, None, None);
        let p0 = room.seat(UserId::new("a"), "Alice").unwrap();
        let p1 = room.seat(UserId::new("b"), "Bob").unwrap();
        assert_eq!(p0.color.as_deref(), Some("red"));
        assert_eq!(p0.position, Some(0));
        assert_eq!(p1.color.as_deref(), Some("green"));
        assert_eq!(p1.position, Some(1));
    }

    #[test]
    fn full_room_rejects_seating() {
        let mut room = Room::new(RoomId::new("AB12CD"), 2, None, None);
        room.seat(UserId::new("a"), "a").unwrap();
        room.seat(UserId::new("b"), "b").unwrap();
        assert!(matches!(
            room.seat(UserId::new("c"), "c"),
            Err(ArenaError::RoomFull)
        ));
    }

    #[test]
    fn started_room_rejects_seating() {
        let mut room = Room::new(RoomId::new("AB12CD"), 4, None, None);
        room.seat(UserId::new("a"), "a").unwrap();
        room.seat(UserId::new("b"), "b").unwrap();
        assert!(room.start(WinRule::AllPiecesFinished).unwrap());
        assert!(matches!(
            room.seat(UserId::new("c"), "c"),
            Err(ArenaError::AlreadyStarted)
        ));
    }

    #[test]
    fn start_is_idempotent() {
        let mut room = Room::new(RoomId::new("AB12CD"), 4, None, None);
        room.seat(UserId::new("a"), "a").unwrap();
        room.seat(UserId::new("b"), "b").unwrap();
        assert!(room.start(WinRule::AllPiecesFinished).unwrap());
        assert!(!room.start(WinRule::AllPiecesFinished).unwrap());
    }

    #[test]
    fn win_rule_follows_room_mode() {
        let standalone = Room::new(RoomId::new("AB12CD"), 4, None, None);
        assert_eq!(standalone.win_rule(), WinRule::AllPiecesFinished);
        let tournament = Room::new(
            RoomId::new("EF34GH"),
            4,
            Some(TournamentId::new("t-1")),
            None,
        );
        assert_eq!(tournament.win_rule(), WinRule::FirstPieceFinished);
    }

    #[test]
    fn room_document_wire_shape() {
        let mut room = Room::new(RoomId::new("AB12CD"), 4, None, Some(UserId::new("a")));
        room.seat(UserId::new("a"), "Alice").unwrap();
        let json = serde_json::to_value(&room).unwrap();
        assert_eq!(json["roomId"], "AB12CD");
        assert_eq!(json["gameStarted"], false);
        assert_eq!(json["maxPlayers"], 4);
        assert_eq!(json["players"][0]["userId"], "a");
        assert_eq!(json["players"][0]["isOnline"], true);
    }
}
