//! Live match actions: dice rolls, piece moves, and stalled-turn skips.
//!
//! Every action mutates the room document through a compare-and-swap
//! retry loop, so two processes acting on the same room serialize
//! cleanly, then broadcasts the result on the room channel.

use rand::Rng;
use std::sync::Arc;

use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::fanout::{RoomBus, Target};
use crate::game::{GamePhase, GameState, MoveOutcome};
use crate::protocol::ServerEvent;
use crate::room::Room;
use crate::scheduler::{Schedule, TaskKind, TaskQueue};
use crate::store::{keys, with_document, DocumentStore};
use crate::tournament::TournamentService;
use crate::types::{RoomId, TournamentId, UserId};

/// Source of dice values. Production uses the thread RNG; tests inject
/// a scripted sequence.
pub trait DiceRoller: Send + Sync {
    fn roll(&self) -> u8;
}

pub struct ThreadRngDice;

impl DiceRoller for ThreadRngDice {
    fn roll(&self) -> u8 {
        rand::thread_rng().gen_range(1..=6)
    }
}

/// Orchestrates in-game actions over the shared store.
pub struct MatchService {
    store: Arc<dyn DocumentStore>,
    bus: Arc<RoomBus>,
    tasks: Arc<dyn TaskQueue>,
    config: Arc<ArenaConfig>,
    tournaments: Arc<TournamentService>,
    dice: Arc<dyn DiceRoller>,
}

impl MatchService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        bus: Arc<RoomBus>,
        tasks: Arc<dyn TaskQueue>,
        config: Arc<ArenaConfig>,
        tournaments: Arc<TournamentService>,
        dice: Arc<dyn DiceRoller>,
    ) -> Self {
        Self {
            store,
            bus,
            tasks,
            config,
            tournaments,
            dice,
        }
    }

    /// Roll for the acting player and broadcast the result.
    pub async fn roll_dice(&self, room_id: &RoomId, user_id: &UserId) -> Result<u8, ArenaError> {
        // Drawn outside the retry loop so a revision conflict does not
        // reroll.
        let value = self.dice.roll();

        let game_state = {
            let user_id = user_id.clone();
            let missing_id = room_id.clone();
            with_document::<Room, _, _, _>(
                &*self.store,
                &keys::room(room_id),
                self.config.cas_max_retries,
                move || ArenaError::RoomNotFound {
                    room_id: missing_id.clone(),
                },
                move |room| {
                    let state = room.game_state.as_mut().ok_or(ArenaError::GameNotStarted)?;
                    state.roll(&user_id, value)?;
                    Ok(state.clone())
                },
            )
            .await?
        };

        tracing::debug!(%room_id, %user_id, value, "dice rolled");
        self.bus
            .broadcast(
                Target::room(room_id),
                ServerEvent::DiceResult {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                    dice_value: value,
                    game_state,
                },
            )
            .await?;
        Ok(value)
    }

    /// Apply a piece move, broadcast its effects, and drive the room's
    /// end-of-game bookkeeping when it produces a winner.
    pub async fn move_piece(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        piece_id: u8,
    ) -> Result<MoveOutcome, ArenaError> {
        let (outcome, game_state, tournament_id) = {
            let user_id = user_id.clone();
            let missing_id = room_id.clone();
            with_document::<Room, _, _, _>(
                &*self.store,
                &keys::room(room_id),
                self.config.cas_max_retries,
                move || ArenaError::RoomNotFound {
                    room_id: missing_id.clone(),
                },
                move |room| {
                    let tournament_id = room.tournament_id.clone();
                    let state = room.game_state.as_mut().ok_or(ArenaError::GameNotStarted)?;
                    let outcome = state.move_piece(&user_id, piece_id)?;
                    Ok((outcome, state.clone(), tournament_id))
                },
            )
            .await?
        };

        self.bus
            .broadcast(
                Target::room(room_id),
                ServerEvent::PieceMoved {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                    piece_id,
                    piece: outcome.piece.clone(),
                    next_player: outcome.next_player.clone(),
                    game_state: game_state.clone(),
                },
            )
            .await?;

        if let Some(capture) = &outcome.capture {
            self.bus
                .broadcast(
                    Target::room(room_id),
                    ServerEvent::PieceCaptured {
                        room_id: room_id.clone(),
                        capture: capture.clone(),
                    },
                )
                .await?;
        }

        match &outcome.winner {
            Some(winner) => {
                self.finish_game(room_id, winner, &game_state, tournament_id.as_ref())
                    .await?;
            }
            None => {
                self.arm_turn_timeout(room_id, game_state.turn_serial)
                    .await?;
            }
        }
        Ok(outcome)
    }

    async fn finish_game(
        &self,
        room_id: &RoomId,
        winner: &UserId,
        final_state: &GameState,
        tournament_id: Option<&TournamentId>,
    ) -> Result<(), ArenaError> {
        tracing::info!(%room_id, %winner, "game over");
        self.bus
            .broadcast(
                Target::room(room_id),
                ServerEvent::GameOver {
                    room_id: room_id.clone(),
                    winner: winner.clone(),
                    final_state: final_state.clone(),
                },
            )
            .await?;

        if let Some(tournament_id) = tournament_id {
            // The match monitor advances the bracket once every summary
            // of the round carries a winner.
            self.tournaments
                .record_room_winner(tournament_id, room_id, winner)
                .await?;
        }

        // Keep the final board visible briefly before teardown.
        self.tasks
            .enqueue(
                TaskKind::ArchiveRoom {
                    room_id: room_id.clone(),
                },
                Schedule::Once {
                    delay: self.config.room_archive_delay,
                },
            )
            .await?;
        Ok(())
    }

    /// Skip the turn a timeout fired for. A no-op when the room is gone,
    /// the game is over, or the turn already changed hands.
    pub async fn skip_stalled_turn(
        &self,
        room_id: &RoomId,
        turn_serial: u64,
    ) -> Result<(), ArenaError> {
        let key = keys::room(room_id);
        let missing_id = room_id.clone();
        let skipped = with_document::<Room, _, _, _>(
            &*self.store,
            &key,
            self.config.cas_max_retries,
            move || ArenaError::RoomNotFound {
                room_id: missing_id.clone(),
            },
            move |room| {
                let Some(state) = room.game_state.as_mut() else {
                    return Ok(None);
                };
                if state.phase == GamePhase::GameOver || state.turn_serial != turn_serial {
                    return Ok(None);
                }
                let stalled = state.current_turn.clone();
                let next = state.skip_turn()?;
                Ok(Some((stalled, next, state.turn_serial)))
            },
        )
        .await;

        let skipped = match skipped {
            Ok(skipped) => skipped,
            // Archived under the timer; nothing to skip.
            Err(ArenaError::RoomNotFound { .. }) => return Ok(()),
            Err(err) => return Err(err),
        };
        let Some((stalled, next, new_serial)) = skipped else {
            return Ok(());
        };

        tracing::info!(%room_id, user_id = %stalled, "turn skipped after timeout");
        self.bus
            .broadcast(
                Target::room(room_id),
                ServerEvent::TurnSkipped {
                    room_id: room_id.clone(),
                    user_id: stalled,
                    next_player: next,
                },
            )
            .await?;
        self.arm_turn_timeout(room_id, new_serial).await?;
        Ok(())
    }

    async fn arm_turn_timeout(&self, room_id: &RoomId, turn_serial: u64) -> Result<(), ArenaError> {
        self.tasks
            .enqueue(
                TaskKind::TurnTimeout {
                    room_id: room_id.clone(),
                    turn_serial,
                },
                Schedule::Once {
                    delay: self.config.turn_timeout,
                },
            )
            .await?;
        Ok(())
    }
}
