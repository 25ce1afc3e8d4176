use crate::game::GamePhase;
use crate::types::{RoomId, TournamentId};

/// Errors that can occur in the arena.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("invalid request: {reason}")]
    Validation { reason: String },

    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    #[error("token has been revoked")]
    TokenRevoked,

    #[error("room {room_id} not found")]
    RoomNotFound { room_id: RoomId },

    #[error("tournament {tournament_id} not found")]
    TournamentNotFound { tournament_id: TournamentId },

    #[error("game has not started yet")]
    GameNotStarted,

    #[error("game has already started")]
    AlreadyStarted,

    #[error("room is full")]
    RoomFull,

    #[error("you are already in a room")]
    AlreadyInRoom,

    #[error("it is not your turn")]
    NotYourTurn,

    #[error("dice already rolled for this turn")]
    AlreadyRolled,

    #[error("expected {expected} phase, game is in {actual}")]
    WrongPhase {
        expected: GamePhase,
        actual: GamePhase,
    },

    #[error("piece {piece_id} is not a valid piece")]
    InvalidPiece { piece_id: u8 },

    #[error("illegal move: {reason}")]
    IllegalMove { reason: String },

    #[error("tournament joining is closed")]
    JoiningClosed,

    #[error("already joined this tournament")]
    AlreadyJoined,

    #[error("revision conflict writing {key}")]
    RevisionConflict { key: String },

    #[error("transient infrastructure error: {reason}")]
    Transient {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("server is shutting down")]
    ShuttingDown,
}

/// Coarse classification used when reporting errors to a connection
/// or mapping them onto HTTP statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing request fields.
    Validation,
    /// Missing, invalid, or revoked credentials.
    Auth,
    /// The request conflicts with the current game or tournament state.
    State,
    /// The referenced room or tournament does not exist.
    NotFound,
    /// Store or queue unavailable; safe to retry.
    Transient,
}

impl ArenaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArenaError::Validation { .. }
            | ArenaError::InvalidPiece { .. }
            | ArenaError::InvalidConfig { .. } => ErrorKind::Validation,
            ArenaError::Auth { .. } | ArenaError::TokenRevoked => ErrorKind::Auth,
            ArenaError::RoomNotFound { .. } | ArenaError::TournamentNotFound { .. } => {
                ErrorKind::NotFound
            }
            ArenaError::Transient { .. }
            | ArenaError::RevisionConflict { .. }
            | ArenaError::ShuttingDown => ErrorKind::Transient,
            _ => ErrorKind::State,
        }
    }

    /// Shorthand for a transient error without an underlying source.
    pub fn transient(reason: impl Into<String>) -> Self {
        ArenaError::Transient {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        ArenaError::Validation {
            reason: reason.into(),
        }
    }
}
