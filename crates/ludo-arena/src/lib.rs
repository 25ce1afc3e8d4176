//! Real-time Ludo match and tournament orchestration.
//!
//! The crate is organized around a shared [`store::DocumentStore`]:
//! rooms, tournaments, and presence live there as revisioned JSON
//! documents, every mutation is a compare-and-swap cycle, and all
//! server-to-client events travel through the store's pub/sub channel
//! so any process can serve any connection.
//!
//! - [`game`] is the pure per-room state machine.
//! - [`room`], [`match_play`], and [`tournament`] orchestrate documents
//!   and broadcasts.
//! - [`scheduler`] and [`worker`] drive the time-based lifecycle:
//!   joining windows, round monitoring, turn timeouts, room archival.
//! - [`gateway`], [`session`], and [`http`] form the serving edge.

pub mod config;
pub mod error;
pub mod fanout;
pub mod game;
pub mod gateway;
pub mod http;
pub mod match_play;
pub mod protocol;
pub mod room;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod testing;
pub mod tournament;
pub mod types;
pub mod worker;

pub mod prelude {
    pub use crate::config::ArenaConfig;
    pub use crate::error::{ArenaError, ErrorKind};
    pub use crate::protocol::{ClientCommand, ServerEvent};
    pub use crate::types::{RoomId, TournamentId, UserId};
}
