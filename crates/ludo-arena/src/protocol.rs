//! The real-time message surface.
//!
//! Frames are JSON objects tagged by a `type` field; field names are
//! camelCase to match the stored document shapes.

use serde::{Deserialize, Serialize};

use crate::error::ArenaError;
use crate::game::{Capture, GameState, Piece};
use crate::room::Player;
use crate::types::{RoomId, TournamentId, UserId};

/// Commands a client may issue over an authenticated connection. The
/// acting user is always taken from the session, never from the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinRoom {
        #[serde(default, rename = "roomId")]
        room_id: Option<RoomId>,
        #[serde(default, rename = "createNewRoom")]
        create_new_room: bool,
        #[serde(default, rename = "userName")]
        user_name: Option<String>,
    },
    RollDice {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    MovePiece {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        #[serde(rename = "pieceId")]
        piece_id: u8,
    },
    JoinTournament {
        #[serde(rename = "tournamentId")]
        tournament_id: TournamentId,
    },
    TournamentRollDice {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    TournamentMovePiece {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        #[serde(rename = "pieceId")]
        piece_id: u8,
    },
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerEvent {
    RoomJoined {
        room_id: RoomId,
        player: Player,
        players: Vec<Player>,
    },
    PlayerJoined {
        room_id: Option<RoomId>,
        tournament_id: Option<TournamentId>,
        player: Player,
    },
    GameStarted {
        room_id: RoomId,
        game_state: GameState,
        players: Vec<Player>,
    },
    DiceResult {
        room_id: RoomId,
        user_id: UserId,
        dice_value: u8,
        game_state: GameState,
    },
    PieceMoved {
        room_id: RoomId,
        user_id: UserId,
        piece_id: u8,
        piece: Piece,
        next_player: UserId,
        game_state: GameState,
    },
    PieceCaptured {
        room_id: RoomId,
        #[serde(flatten)]
        capture: Capture,
    },
    TurnSkipped {
        room_id: RoomId,
        user_id: UserId,
        next_player: UserId,
    },
    GameOver {
        room_id: RoomId,
        winner: UserId,
        final_state: GameState,
    },
    RoomAssigned {
        room_id: RoomId,
        tournament_id: TournamentId,
    },
    TournamentJoined {
        tournament_id: TournamentId,
        room_id: RoomId,
        players: Vec<Player>,
    },
    TournamentOver {
        tournament_id: TournamentId,
        winner: Option<UserId>,
    },
    PlayerDisconnected {
        room_id: RoomId,
        user_id: UserId,
        online_players: usize,
        total_players: usize,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    /// Build the `error` event reported to the originating connection.
    pub fn from_error(err: &ArenaError) -> Self {
        ServerEvent::Error {
            message: err.to_string(),
        }
    }
}
