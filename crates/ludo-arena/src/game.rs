//! The per-room Ludo state machine.
//!
//! This module is pure: no I/O, no randomness. Dice values are drawn by
//! the caller and fed in, so the same transitions run identically in
//! production and in tests. The state is fully serializable and lives
//! inside the room document in the shared store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::ArenaError;
use crate::types::UserId;

/// Track index of the final square. Reaching it exactly finishes a piece.
pub const TRACK_END: i8 = 56;

/// Sentinel position for a piece still at home.
pub const HOME: i8 = -1;

/// Squares immune to capture.
pub const SAFE_SQUARES: [i8; 8] = [0, 8, 13, 21, 26, 34, 39, 47];

/// Pieces owned by each player.
pub const PIECES_PER_PLAYER: usize = 4;

/// Where a room sits in the per-turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    Rolling,
    Moving,
    GameOver,
}

impl fmt::Display for GamePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GamePhase::Rolling => f.write_str("rolling"),
            GamePhase::Moving => f.write_str("moving"),
            GamePhase::GameOver => f.write_str("game_over"),
        }
    }
}

/// When a player has won the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinRule {
    /// Standalone rooms: all four pieces must reach the end.
    AllPiecesFinished,
    /// Tournament rooms: the first finished piece decides the match.
    FirstPieceFinished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Piece {
    pub id: u8,
    /// Track index 0..=56, or -1 while at home.
    pub position: i8,
    pub is_home: bool,
    pub is_finished: bool,
}

impl Piece {
    fn at_home(id: u8) -> Self {
        Self {
            id,
            position: HOME,
            is_home: true,
            is_finished: false,
        }
    }

    /// On the board and still capturable.
    pub fn is_active(&self) -> bool {
        !self.is_home && !self.is_finished
    }

    fn send_home(&mut self) {
        self.position = HOME;
        self.is_home = true;
        self.is_finished = false;
    }
}

/// A capture resolved during a move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capture {
    pub owner: UserId,
    pub piece_id: u8,
    pub captured_by: UserId,
}

/// Everything a move did, for the caller to broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    pub piece: Piece,
    pub capture: Option<Capture>,
    pub winner: Option<UserId>,
    pub next_player: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub turn_order: Vec<UserId>,
    pub current_player_index: usize,
    pub current_turn: UserId,
    /// 0 = unrolled; 1..=6 only while in the moving phase.
    pub dice_value: u8,
    pub phase: GamePhase,
    pub pieces: HashMap<UserId, Vec<Piece>>,
    pub winner: Option<UserId>,
    pub win_rule: WinRule,
    /// Incremented on every turn handover. Lets the turn-timeout task
    /// detect that it fired for a turn that already ended.
    #[serde(default)]
    pub turn_serial: u64,
}

impl GameState {
    pub fn new(turn_order: Vec<UserId>, win_rule: WinRule) -> Result<Self, ArenaError> {
        if turn_order.len() < 2 {
            return Err(ArenaError::validation(
                "a game needs at least two players",
            ));
        }
        let pieces = turn_order
            .iter()
            .map(|user| {
                let set = (0..PIECES_PER_PLAYER as u8).map(Piece::at_home).collect();
                (user.clone(), set)
            })
            .collect();
        let current_turn = turn_order[0].clone();
        Ok(Self {
            turn_order,
            current_player_index: 0,
            current_turn,
            dice_value: 0,
            phase: GamePhase::Rolling,
            pieces,
            winner: None,
            win_rule,
            turn_serial: 0,
        })
    }

    fn require_turn(&self, user: &UserId) -> Result<(), ArenaError> {
        if &self.current_turn != user {
            return Err(ArenaError::NotYourTurn);
        }
        Ok(())
    }

    /// Record a dice roll for the current player.
    pub fn roll(&mut self, user: &UserId, value: u8) -> Result<u8, ArenaError> {
        if self.phase != GamePhase::Rolling {
            return Err(ArenaError::WrongPhase {
                expected: GamePhase::Rolling,
                actual: self.phase,
            });
        }
        self.require_turn(user)?;
        if self.dice_value != 0 {
            return Err(ArenaError::AlreadyRolled);
        }
        if !(1..=6).contains(&value) {
            return Err(ArenaError::validation(format!(
                "dice value {value} out of range"
            )));
        }
        self.dice_value = value;
        self.phase = GamePhase::Moving;
        Ok(value)
    }

    /// Move a piece by the rolled dice value, resolving captures and the
    /// win condition.
    pub fn move_piece(&mut self, user: &UserId, piece_id: u8) -> Result<MoveOutcome, ArenaError> {
        if self.phase != GamePhase::Moving {
            return Err(ArenaError::WrongPhase {
                expected: GamePhase::Moving,
                actual: self.phase,
            });
        }
        self.require_turn(user)?;
        if piece_id as usize >= PIECES_PER_PLAYER {
            return Err(ArenaError::InvalidPiece { piece_id });
        }

        let steps = self.dice_value as i8;
        let piece = {
            let pieces = self
                .pieces
                .get_mut(user)
                .ok_or(ArenaError::InvalidPiece { piece_id })?;
            let piece = &mut pieces[piece_id as usize];

            if piece.is_finished {
                return Err(ArenaError::IllegalMove {
                    reason: "piece has already finished".into(),
                });
            }
            if piece.is_home {
                if steps != 6 {
                    return Err(ArenaError::IllegalMove {
                        reason: "a piece can only leave home on a six".into(),
                    });
                }
                piece.position = 0;
                piece.is_home = false;
            } else {
                let target = piece.position + steps;
                if target > TRACK_END {
                    return Err(ArenaError::IllegalMove {
                        reason: format!("move would overshoot square {TRACK_END}"),
                    });
                }
                piece.position = target;
                if target == TRACK_END {
                    piece.is_finished = true;
                }
            }
            piece.clone()
        };

        let capture = self.resolve_capture(user, &piece);

        let won = match self.win_rule {
            WinRule::FirstPieceFinished => piece.is_finished,
            WinRule::AllPiecesFinished => self.pieces[user].iter().all(|p| p.is_finished),
        };

        self.dice_value = 0;
        let winner = if won {
            self.phase = GamePhase::GameOver;
            self.winner = Some(user.clone());
            Some(user.clone())
        } else {
            self.phase = GamePhase::Rolling;
            self.advance_turn();
            None
        };

        Ok(MoveOutcome {
            piece,
            capture,
            winner,
            next_player: self.current_turn.clone(),
        })
    }

    /// Skip the current player's turn, discarding any rolled dice.
    /// Used when a player stalls past the turn timeout.
    pub fn skip_turn(&mut self) -> Result<UserId, ArenaError> {
        if self.phase == GamePhase::GameOver {
            return Err(ArenaError::WrongPhase {
                expected: GamePhase::Rolling,
                actual: self.phase,
            });
        }
        self.dice_value = 0;
        self.phase = GamePhase::Rolling;
        self.advance_turn();
        Ok(self.current_turn.clone())
    }

    fn advance_turn(&mut self) {
        self.current_player_index = (self.current_player_index + 1) % self.turn_order.len();
        self.current_turn = self.turn_order[self.current_player_index].clone();
        self.turn_serial += 1;
    }

    /// Landing on an occupied, non-safe square sends the first matching
    /// opposing active piece back home.
    fn resolve_capture(&mut self, mover: &UserId, landed: &Piece) -> Option<Capture> {
        if !landed.is_active() || SAFE_SQUARES.contains(&landed.position) {
            return None;
        }
        for (owner, pieces) in self.pieces.iter_mut() {
            if owner == mover {
                continue;
            }
            for other in pieces.iter_mut() {
                if other.is_active() && other.position == landed.position {
                    other.send_home();
                    return Some(Capture {
                        owner: owner.clone(),
                        piece_id: other.id,
                        captured_by: mover.clone(),
                    });
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(n: usize) -> Vec<UserId> {
        (0..n).map(|i| UserId::new(format!("u{i}"))).collect()
    }

    fn game(n: usize, rule: WinRule) -> GameState {
        GameState::new(users(n), rule).unwrap()
    }

    #[test]
    fn new_game_invariants() {
        let state = game(3, WinRule::AllPiecesFinished);
        assert_eq!(state.current_turn, state.turn_order[state.current_player_index]);
        assert_eq!(state.dice_value, 0);
        assert_eq!(state.phase, GamePhase::Rolling);
        assert!(state
            .pieces
            .values()
            .all(|set| set.len() == PIECES_PER_PLAYER && set.iter().all(|p| p.is_home)));
    }

    #[test]
    fn single_player_game_rejected() {
        assert!(GameState::new(users(1), WinRule::AllPiecesFinished).is_err());
    }

    #[test]
    fn roll_guards() {
        let mut state = game(2, WinRule::AllPiecesFinished);
        let u0 = state.turn_order[0].clone();
        let u1 = state.turn_order[1].clone();

        assert!(matches!(
            state.roll(&u1, 4),
            Err(ArenaError::NotYourTurn)
        ));
        state.roll(&u0, 4).unwrap();
        assert_eq!(state.phase, GamePhase::Moving);
        assert!(matches!(
            state.roll(&u0, 3),
            Err(ArenaError::WrongPhase { .. })
        ));
    }

    #[test]
    fn home_piece_needs_a_six() {
        let mut state = game(2, WinRule::AllPiecesFinished);
        let u0 = state.turn_order[0].clone();
        state.roll(&u0, 3).unwrap();
        assert!(matches!(
            state.move_piece(&u0, 0),
            Err(ArenaError::IllegalMove { .. })
        ));

        // Dice stays rolled after a rejected move.
        assert_eq!(state.dice_value, 3);
        assert_eq!(state.phase, GamePhase::Moving);
    }

    #[test]
    fn six_leaves_home_and_advances_turn() {
        let mut state = game(2, WinRule::AllPiecesFinished);
        let u0 = state.turn_order[0].clone();
        let u1 = state.turn_order[1].clone();

        state.roll(&u0, 6).unwrap();
        let outcome = state.move_piece(&u0, 0).unwrap();
        assert_eq!(outcome.piece.position, 0);
        assert!(!outcome.piece.is_home);
        assert_eq!(outcome.next_player, u1);
        assert_eq!(state.dice_value, 0);
        assert_eq!(state.phase, GamePhase::Rolling);
        assert_eq!(state.current_turn, state.turn_order[state.current_player_index]);
        assert_eq!(state.turn_serial, 1);
    }

    #[test]
    fn overshoot_is_rejected() {
        let mut state = game(2, WinRule::AllPiecesFinished);
        let u0 = state.turn_order[0].clone();
        state.pieces.get_mut(&u0).unwrap()[0] = Piece {
            id: 0,
            position: 54,
            is_home: false,
            is_finished: false,
        };
        state.roll(&u0, 5).unwrap();
        assert!(matches!(
            state.move_piece(&u0, 0),
            Err(ArenaError::IllegalMove { .. })
        ));
    }

    #[test]
    fn exact_landing_finishes_piece() {
        let mut state = game(2, WinRule::FirstPieceFinished);
        let u0 = state.turn_order[0].clone();
        state.pieces.get_mut(&u0).unwrap()[2] = Piece {
            id: 2,
            position: 52,
            is_home: false,
            is_finished: false,
        };
        state.roll(&u0, 4).unwrap();
        let outcome = state.move_piece(&u0, 2).unwrap();
        assert!(outcome.piece.is_finished);
        assert_eq!(outcome.piece.position, TRACK_END);
        assert_eq!(outcome.winner, Some(u0.clone()));
        assert_eq!(state.phase, GamePhase::GameOver);
        assert_eq!(state.winner, Some(u0));
        assert_eq!(state.dice_value, 0);
    }

    #[test]
    fn all_pieces_rule_does_not_end_on_first_finish() {
        let mut state = game(2, WinRule::AllPiecesFinished);
        let u0 = state.turn_order[0].clone();
        state.pieces.get_mut(&u0).unwrap()[0] = Piece {
            id: 0,
            position: 52,
            is_home: false,
            is_finished: false,
        };
        state.roll(&u0, 4).unwrap();
        let outcome = state.move_piece(&u0, 0).unwrap();
        assert!(outcome.piece.is_finished);
        assert_eq!(outcome.winner, None);
        assert_eq!(state.phase, GamePhase::Rolling);
    }

    #[test]
    fn all_pieces_rule_ends_on_last_finish() {
        let mut state = game(2, WinRule::AllPiecesFinished);
        let u0 = state.turn_order[0].clone();
        for piece in state.pieces.get_mut(&u0).unwrap().iter_mut().take(3) {
            piece.position = TRACK_END;
            piece.is_home = false;
            piece.is_finished = true;
        }
        state.pieces.get_mut(&u0).unwrap()[3] = Piece {
            id: 3,
            position: 50,
            is_home: false,
            is_finished: false,
        };
        state.roll(&u0, 6).unwrap();
        let outcome = state.move_piece(&u0, 3).unwrap();
        assert_eq!(outcome.winner, Some(u0));
        assert_eq!(state.phase, GamePhase::GameOver);
    }

    #[test]
    fn landing_captures_opposing_piece() {
        let mut state = game(2, WinRule::AllPiecesFinished);
        let u0 = state.turn_order[0].clone();
        let u1 = state.turn_order[1].clone();
        state.pieces.get_mut(&u0).unwrap()[0] = Piece {
            id: 0,
            position: 10,
            is_home: false,
            is_finished: false,
        };
        state.pieces.get_mut(&u1).unwrap()[1] = Piece {
            id: 1,
            position: 14,
            is_home: false,
            is_finished: false,
        };
        state.roll(&u0, 4).unwrap();
        let outcome = state.move_piece(&u0, 0).unwrap();
        let capture = outcome.capture.expect("capture expected");
        assert_eq!(capture.owner, u1);
        assert_eq!(capture.piece_id, 1);
        assert_eq!(capture.captured_by, u0);
        assert!(state.pieces[&u1][1].is_home);
        assert_eq!(state.pieces[&u1][1].position, HOME);
    }

    #[test]
    fn safe_square_prevents_capture() {
        let mut state = game(2, WinRule::AllPiecesFinished);
        let u0 = state.turn_order[0].clone();
        let u1 = state.turn_order[1].clone();
        // Square 13 is safe.
        state.pieces.get_mut(&u0).unwrap()[0] = Piece {
            id: 0,
            position: 10,
            is_home: false,
            is_finished: false,
        };
        state.pieces.get_mut(&u1).unwrap()[0] = Piece {
            id: 0,
            position: 13,
            is_home: false,
            is_finished: false,
        };
        state.roll(&u0, 3).unwrap();
        let outcome = state.move_piece(&u0, 0).unwrap();
        assert!(outcome.capture.is_none());
        assert!(state.pieces[&u1][0].is_active());
        assert_eq!(state.pieces[&u1][0].position, 13);
    }

    #[test]
    fn own_pieces_are_never_captured() {
        let mut state = game(2, WinRule::AllPiecesFinished);
        let u0 = state.turn_order[0].clone();
        state.pieces.get_mut(&u0).unwrap()[0] = Piece {
            id: 0,
            position: 10,
            is_home: false,
            is_finished: false,
        };
        state.pieces.get_mut(&u0).unwrap()[1] = Piece {
            id: 1,
            position: 14,
            is_home: false,
            is_finished: false,
        };
        state.roll(&u0, 4).unwrap();
        let outcome = state.move_piece(&u0, 0).unwrap();
        assert!(outcome.capture.is_none());
    }

    #[test]
    fn turn_advances_circularly() {
        let mut state = game(3, WinRule::AllPiecesFinished);
        for expected_index in [1usize, 2, 0, 1] {
            let current = state.current_turn.clone();
            state.roll(&current, 6).unwrap();
            state.move_piece(&current, 0).unwrap();
            assert_eq!(state.current_player_index, expected_index);
            assert_eq!(state.current_turn, state.turn_order[expected_index]);
        }
    }

    #[test]
    fn skip_turn_discards_dice_and_advances() {
        let mut state = game(2, WinRule::AllPiecesFinished);
        let u0 = state.turn_order[0].clone();
        let u1 = state.turn_order[1].clone();
        state.roll(&u0, 4).unwrap();
        let next = state.skip_turn().unwrap();
        assert_eq!(next, u1);
        assert_eq!(state.dice_value, 0);
        assert_eq!(state.phase, GamePhase::Rolling);
        assert_eq!(state.turn_serial, 1);
    }

    #[test]
    fn invalid_piece_id_rejected() {
        let mut state = game(2, WinRule::AllPiecesFinished);
        let u0 = state.turn_order[0].clone();
        state.roll(&u0, 6).unwrap();
        assert!(matches!(
            state.move_piece(&u0, 7),
            Err(ArenaError::InvalidPiece { piece_id: 7 })
        ));
    }
}
