//! Bracket-style tournaments.
//!
//! A tournament opens in the joining state, partitions its roster into
//! round-1 rooms when joining closes, and advances rounds as the match
//! monitor observes winners, until one survivor remains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::fanout::{RoomBus, Target};
use crate::protocol::ServerEvent;
use crate::room::{Player, Room};
use crate::scheduler::{Schedule, TaskKind, TaskQueue};
use crate::store::{keys, with_document, DocumentStore, DocumentStoreExt, PutResult};
use crate::types::{RoomId, TournamentId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TournamentStatus {
    Joining,
    InProgress,
    Completed,
    Cancelled,
}

/// Denormalized per-round view of one room, kept inside the tournament
/// document so the monitor and bracket manager never depend on room
/// documents that may already be archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub players: Vec<UserId>,
    #[serde(default)]
    pub winner: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tournament {
    pub tournament_id: TournamentId,
    pub name: String,
    pub status: TournamentStatus,
    pub joining_open: bool,
    pub player_limit: usize,
    pub max_players_per_room: usize,
    /// 0 while joining; increments by exactly one per partition.
    pub current_round: u32,
    pub players: Vec<UserId>,
    pub rooms: Vec<RoomSummary>,
    #[serde(default)]
    pub winner: Option<UserId>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Partition survivors into rooms of at most `capacity` players.
///
/// Produces `ceil(n / capacity)` rooms filled left to right in roster
/// order. A trailing 1-player room is repaired by shifting one seat
/// from each of up to two preceding rooms into it; if no room can spare
/// a seat (capacity 2), the straggler is folded into the previous room
/// instead. Every room holds at least two players whenever `n >= 2`.
pub fn partition_players(players: &[UserId], capacity: usize) -> Vec<Vec<UserId>> {
    debug_assert!(capacity >= 2);
    let mut rooms: Vec<Vec<UserId>> = players
        .chunks(capacity.max(1))
        .map(|chunk| chunk.to_vec())
        .collect();

    let last = match rooms.len().checked_sub(1) {
        Some(last) if last > 0 => last,
        _ => return rooms,
    };
    if rooms[last].len() != 1 {
        return rooms;
    }

    let mut donors = 0;
    for i in (0..last).rev() {
        if donors == 2 {
            break;
        }
        if rooms[i].len() > 2 {
            let seat = rooms[i].pop().expect("donor room is non-empty");
            rooms[last].push(seat);
            donors += 1;
        }
    }
    if rooms[last].len() < 2 {
        let orphan = rooms.pop().expect("checked above");
        rooms
            .last_mut()
            .expect("at least one room remains")
            .extend(orphan);
    }
    rooms
}

enum CloseOutcome {
    Noop,
    Understaffed,
    Start,
}

enum ProceedOutcome {
    AlreadyOver,
    RoundInProgress,
    Completed(Option<UserId>),
    NextRound(u32),
}

/// Orchestrates tournament lifecycle over the shared store.
pub struct TournamentService {
    store: Arc<dyn DocumentStore>,
    bus: Arc<RoomBus>,
    tasks: Arc<dyn TaskQueue>,
    config: Arc<ArenaConfig>,
}

impl TournamentService {
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

    /// Create a tournament in the joining state and arm the one-shot
    /// close-joining task.
    pub async fn open_tournament(
        &self,
        name: &str,
        created_by: &UserId,
        player_limit: usize,
        max_players_per_room: usize,
    ) -> Result<Tournament, ArenaError> {
        if name.trim().is_empty() {
            return Err(ArenaError::validation("tournament name must not be empty"));
        }
        if player_limit < 2 {
            return Err(ArenaError::validation("player_limit must be at least 2"));
        }
        if max_players_per_room < 2 {
            return Err(ArenaError::validation(
                "max_players_per_room must be at least 2",
            ));
        }

        let tournament = Tournament {
            tournament_id: TournamentId::generate(),
            name: name.to_string(),
            status: TournamentStatus::Joining,
            joining_open: true,
            player_limit,
            max_players_per_room,
            current_round: 0,
            players: Vec::new(),
            rooms: Vec::new(),
            winner: None,
            created_by: created_by.clone(),
            created_at: Utc::now(),
        };
        let id = &tournament.tournament_id;
        self.store
            .put_json(&keys::tournament(id), &tournament, None)
            .await?;
        self.store
            .put_json(&keys::tournament_rooms(id), &Vec::<RoomId>::new(), None)
            .await?;

        self.tasks
            .enqueue(
                TaskKind::CloseJoining {
                    tournament_id: id.clone(),
                },
                Schedule::Once {
                    delay: self.config.joining_grace,
                },
            )
            .await?;

        tracing::info!(tournament_id = %id, player_limit, max_players_per_room, "tournament opened");
        Ok(tournament)
    }

    /// All tournaments still open for joining, newest first.
    pub async fn list_open(&self) -> Result<Vec<Tournament>, ArenaError> {
        let mut open = Vec::new();
        for key in self.store.list_keys("tournament:").await? {
            // Skip sub-keys like "tournament:{id}:rooms".
            if key.matches(':').count() != 1 {
                continue;
            }
            if let Some((tournament, _)) = self.store.get_json::<Tournament>(&key).await? {
                if tournament.status == TournamentStatus::Joining {
                    open.push(tournament);
                }
            }
        }
        open.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(open)
    }

    /// Register a player, seat them in a joining-phase room, and start
    /// the tournament early when the roster hits the limit.
    pub async fn join_tournament(
        &self,
        tournament_id: &TournamentId,
        user_id: &UserId,
    ) -> Result<RoomId, ArenaError> {
        let key = keys::tournament(tournament_id);
        let roster_len = {
            let user_id = user_id.clone();
            let missing_id = tournament_id.clone();
            with_document::<Tournament, _, _, _>(
                &*self.store,
                &key,
                self.config.cas_max_retries,
                move || ArenaError::TournamentNotFound {
                    tournament_id: missing_id.clone(),
                },
                move |tournament| {
                    if !tournament.joining_open {
                        return Err(ArenaError::JoiningClosed);
                    }
                    if tournament.players.contains(&user_id) {
                        return Err(ArenaError::AlreadyJoined);
                    }
                    tournament.players.push(user_id.clone());
                    Ok(tournament.players.len())
                },
            )
            .await?
        };

        let (room_id, players) = self.assign_joining_room(tournament_id, user_id).await?;
        self.bus
            .join(Target::tournament(tournament_id), user_id.clone());
        self.bus.join(Target::room(&room_id), user_id.clone());

        let seated = players
            .iter()
            .find(|p| &p.user_id == user_id)
            .cloned()
            .unwrap_or_else(|| Player::new(user_id.clone(), format!("Player_{user_id}"), 0));
        self.bus
            .broadcast(
                Target::tournament(tournament_id),
                ServerEvent::PlayerJoined {
                    room_id: None,
                    tournament_id: Some(tournament_id.clone()),
                    player: seated,
                },
            )
            .await?;
        self.bus
            .send_to_user(
                user_id,
                ServerEvent::TournamentJoined {
                    tournament_id: tournament_id.clone(),
                    room_id: room_id.clone(),
                    players,
                },
            )
            .await?;

        tracing::info!(%tournament_id, %user_id, %room_id, roster = roster_len, "player joined tournament");

        let limit_reached = {
            let (tournament, _) = self
                .store
                .get_json::<Tournament>(&key)
                .await?
                .ok_or_else(|| ArenaError::TournamentNotFound {
                    tournament_id: tournament_id.clone(),
                })?;
            tournament.players.len() >= tournament.player_limit
        };
        if limit_reached {
            // Pre-empt the joining timer.
            self.tasks
                .cancel(&format!("close-joining:{tournament_id}"))
                .await?;
            self.close_joining_and_start(tournament_id).await?;
        }
        Ok(room_id)
    }

    /// Seat a player in the first joining-phase room with spare
    /// capacity, or create a new one.
    async fn assign_joining_room(
        &self,
        tournament_id: &TournamentId,
        user_id: &UserId,
    ) -> Result<(RoomId, Vec<Player>), ArenaError> {
        let user_name = format!("Player_{user_id}");
        let index_key = keys::tournament_rooms(tournament_id);
        let (room_ids, _) = self
            .store
            .get_json::<Vec<RoomId>>(&index_key)
            .await?
            .unwrap_or_default();

        for room_id in &room_ids {
            let room_key = keys::room(room_id);
            let Some((room, _)) = self.store.get_json::<Room>(&room_key).await? else {
                continue;
            };
            if room.game_started || room.is_full() {
                continue;
            }
            let seated = {
                let user_id = user_id.clone();
                let user_name = user_name.clone();
                let missing_id = room_id.clone();
                with_document::<Room, _, _, _>(
                    &*self.store,
                    &room_key,
                    self.config.cas_max_retries,
                    move || ArenaError::RoomNotFound {
                        room_id: missing_id.clone(),
                    },
                    move |room| match room.seat(user_id.clone(), &user_name) {
                        Ok(_) => Ok(Some(room.players.clone())),
                        // Lost the seat to a concurrent join; try the
                        // next room.
                        Err(ArenaError::RoomFull) | Err(ArenaError::AlreadyStarted) => Ok(None),
                        Err(err) => Err(err),
                    },
                )
                .await?
            };
            if let Some(players) = seated {
                return Ok((room_id.clone(), players));
            }
        }

        // No open room; create one and append it to the index.
        let room_id = RoomId::generate();
        let mut room = Room::new(
            room_id.clone(),
            self.max_room_size(tournament_id).await?,
            Some(tournament_id.clone()),
            None,
        );
        room.seat(user_id.clone(), &user_name)?;
        let players = room.players.clone();
        self.store
            .put_json(&keys::room(&room_id), &room, Some(0))
            .await?;

        let appended_id = room_id.clone();
        with_document::<Vec<RoomId>, _, _, _>(
            &*self.store,
            &index_key,
            self.config.cas_max_retries,
            || ArenaError::transient("joining room index missing"),
            move |index| {
                if !index.contains(&appended_id) {
                    index.push(appended_id.clone());
                }
                Ok(())
            },
        )
        .await?;
        Ok((room_id, players))
    }

    async fn max_room_size(&self, tournament_id: &TournamentId) -> Result<usize, ArenaError> {
        let (tournament, _) = self
            .store
            .get_json::<Tournament>(&keys::tournament(tournament_id))
            .await?
            .ok_or_else(|| ArenaError::TournamentNotFound {
                tournament_id: tournament_id.clone(),
            })?;
        Ok(tournament.max_players_per_room)
    }

    /// Close the joining window and start round 1. Safe to re-run: the
    /// joining flip and the round-1 partition (room ids included) commit
    /// in one document write, and room documents are created with
    /// must-not-exist writes keyed by those ids, so a timer racing the
    /// player-limit path or a re-delivered task resumes whatever part of
    /// the start is still owed instead of repeating it.
    pub async fn close_joining_and_start(
        &self,
        tournament_id: &TournamentId,
    ) -> Result<(), ArenaError> {
        let key = keys::tournament(tournament_id);
        let missing_id = tournament_id.clone();
        let outcome = with_document::<Tournament, _, _, _>(
            &*self.store,
            &key,
            self.config.cas_max_retries,
            move || ArenaError::TournamentNotFound {
                tournament_id: missing_id.clone(),
            },
            |tournament| {
                if tournament.joining_open {
                    tournament.joining_open = false;
                    tournament.status = TournamentStatus::InProgress;
                    if tournament.players.len() < 2 {
                        return Ok(CloseOutcome::Understaffed);
                    }
                    let groups = partition_players(
                        &tournament.players,
                        tournament.max_players_per_room,
                    );
                    tournament.rooms = groups
                        .into_iter()
                        .map(|players| RoomSummary {
                            room_id: RoomId::generate(),
                            players,
                            winner: None,
                        })
                        .collect();
                    tournament.current_round = 1;
                    return Ok(CloseOutcome::Start);
                }
                if tournament.status == TournamentStatus::InProgress
                    && tournament.current_round == 1
                {
                    // An earlier attempt committed the bracket but may
                    // not have built every room document.
                    return Ok(CloseOutcome::Start);
                }
                Ok(CloseOutcome::Noop)
            },
        )
        .await?;

        match outcome {
            CloseOutcome::Noop => Ok(()),
            CloseOutcome::Understaffed => {
                tracing::warn!(%tournament_id, "not enough players, cancelling");
                self.cancel_tournament(tournament_id).await
            }
            CloseOutcome::Start => {
                // The ad-hoc joining rooms are replaced by the partition.
                self.discard_joining_rooms(tournament_id).await?;
                self.ensure_round_rooms(tournament_id).await?;
                self.tasks
                    .enqueue(
                        TaskKind::MatchMonitor {
                            tournament_id: tournament_id.clone(),
                        },
                        Schedule::Every {
                            interval: self.config.monitor_interval,
                        },
                    )
                    .await?;
                tracing::info!(%tournament_id, round = 1, "tournament started");
                Ok(())
            }
        }
    }

    async fn discard_joining_rooms(&self, tournament_id: &TournamentId) -> Result<(), ArenaError> {
        let index_key = keys::tournament_rooms(tournament_id);
        if let Some((room_ids, _)) = self.store.get_json::<Vec<RoomId>>(&index_key).await? {
            for room_id in room_ids {
                self.store.delete(&keys::room(&room_id)).await?;
            }
        }
        self.store.delete(&index_key).await?;
        Ok(())
    }

    /// Build the room document for every committed round summary that
    /// does not have one yet: seats, started game, seat links, room
    /// assignments, and the first turn's stall guard. Safe to re-run —
    /// each room is created with a must-not-exist write keyed by the
    /// summary's room id, so a room already built is skipped whole.
    /// Rooms with a recorded winner are never rebuilt; archival may have
    /// already removed them.
    pub async fn ensure_round_rooms(
        &self,
        tournament_id: &TournamentId,
    ) -> Result<(), ArenaError> {
        let (tournament, _) = self
            .store
            .get_json::<Tournament>(&keys::tournament(tournament_id))
            .await?
            .ok_or_else(|| ArenaError::TournamentNotFound {
                tournament_id: tournament_id.clone(),
            })?;

        for summary in &tournament.rooms {
            if summary.winner.is_some() {
                continue;
            }
            // The partition may fold a straggler into an oversized room.
            let seats = tournament.max_players_per_room.max(summary.players.len());
            let mut room = Room::new(
                summary.room_id.clone(),
                seats,
                Some(tournament_id.clone()),
                None,
            );
            for user_id in &summary.players {
                room.seat(user_id.clone(), &format!("Player_{user_id}"))?;
            }
            let win_rule = room.win_rule();
            room.start(win_rule)?;
            let game_state = room.game_state.clone().expect("state set by start");
            let players = room.players.clone();
            match self
                .store
                .put_json(&keys::room(&summary.room_id), &room, Some(0))
                .await?
            {
                PutResult::Conflict { .. } => continue,
                PutResult::Stored(_) => {}
            }

            for user_id in &summary.players {
                self.store
                    .put_json(&keys::user_room(user_id), &summary.room_id, None)
                    .await?;
                self.bus
                    .send_to_user(
                        user_id,
                        ServerEvent::RoomAssigned {
                            room_id: summary.room_id.clone(),
                            tournament_id: tournament_id.clone(),
                        },
                    )
                    .await?;
            }
            self.bus
                .broadcast(
                    Target::room(&summary.room_id),
                    ServerEvent::GameStarted {
                        room_id: summary.room_id.clone(),
                        game_state,
                        players,
                    },
                )
                .await?;
            self.tasks
                .enqueue(
                    TaskKind::TurnTimeout {
                        room_id: summary.room_id.clone(),
                        turn_serial: 0,
                    },
                    Schedule::Once {
                        delay: self.config.turn_timeout,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Record a finished room's winner in the tournament document.
    /// Called by match play when a tournament room's game ends.
    pub async fn record_room_winner(
        &self,
        tournament_id: &TournamentId,
        room_id: &RoomId,
        winner: &UserId,
    ) -> Result<(), ArenaError> {
        let key = keys::tournament(tournament_id);
        let missing_id = tournament_id.clone();
        let room_id = room_id.clone();
        let winner = winner.clone();
        with_document::<Tournament, _, _, _>(
            &*self.store,
            &key,
            self.config.cas_max_retries,
            move || ArenaError::TournamentNotFound {
                tournament_id: missing_id.clone(),
            },
            move |tournament| {
                if let Some(summary) =
                    tournament.rooms.iter_mut().find(|s| s.room_id == room_id)
                {
                    summary.winner = Some(winner.clone());
                }
                Ok(())
            },
        )
        .await
    }

    /// Advance the bracket once every current-round room has reported.
    /// The decision and the next round's partition commit in one
    /// document write; room documents follow through
    /// [`Self::ensure_round_rooms`]. Idempotent against completed and
    /// cancelled tournaments and against rounds still in progress.
    pub async fn proceed_to_next_round(
        &self,
        tournament_id: &TournamentId,
    ) -> Result<(), ArenaError> {
        let key = keys::tournament(tournament_id);
        let missing_id = tournament_id.clone();
        let outcome = with_document::<Tournament, _, _, _>(
            &*self.store,
            &key,
            self.config.cas_max_retries,
            move || ArenaError::TournamentNotFound {
                tournament_id: missing_id.clone(),
            },
            |tournament| {
                if matches!(
                    tournament.status,
                    TournamentStatus::Completed | TournamentStatus::Cancelled
                ) {
                    return Ok(ProceedOutcome::AlreadyOver);
                }
                if tournament.rooms.is_empty() {
                    return Ok(ProceedOutcome::RoundInProgress);
                }
                let winners: Vec<UserId> = tournament
                    .rooms
                    .iter()
                    .filter_map(|s| s.winner.clone())
                    .collect();
                if winners.len() < tournament.rooms.len() {
                    return Ok(ProceedOutcome::RoundInProgress);
                }
                if winners.len() <= 1 {
                    tournament.status = TournamentStatus::Completed;
                    tournament.winner = winners.into_iter().next();
                    return Ok(ProceedOutcome::Completed(tournament.winner.clone()));
                }
                let groups =
                    partition_players(&winners, tournament.max_players_per_room);
                tournament.rooms = groups
                    .into_iter()
                    .map(|players| RoomSummary {
                        room_id: RoomId::generate(),
                        players,
                        winner: None,
                    })
                    .collect();
                tournament.current_round += 1;
                Ok(ProceedOutcome::NextRound(tournament.current_round))
            },
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(ArenaError::TournamentNotFound { .. }) => {
                // Nothing left to drive; drop any orphaned timers.
                self.cancel_tournament_tasks(tournament_id).await?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match outcome {
            ProceedOutcome::RoundInProgress => Ok(()),
            ProceedOutcome::AlreadyOver => self.cancel_tournament_tasks(tournament_id).await,
            ProceedOutcome::Completed(champion) => {
                self.cancel_tournament_tasks(tournament_id).await?;
                self.bus
                    .broadcast(
                        Target::tournament(tournament_id),
                        ServerEvent::TournamentOver {
                            tournament_id: tournament_id.clone(),
                            winner: champion.clone(),
                        },
                    )
                    .await?;
                tracing::info!(%tournament_id, winner = ?champion, "tournament completed");
                Ok(())
            }
            ProceedOutcome::NextRound(round) => {
                self.ensure_round_rooms(tournament_id).await?;
                tracing::info!(%tournament_id, round, "next round started");
                Ok(())
            }
        }
    }

    /// Cancel a tournament and remove its scheduled tasks.
    pub async fn cancel_tournament(&self, tournament_id: &TournamentId) -> Result<(), ArenaError> {
        let key = keys::tournament(tournament_id);
        let missing_id = tournament_id.clone();
        with_document::<Tournament, _, _, _>(
            &*self.store,
            &key,
            self.config.cas_max_retries,
            move || ArenaError::TournamentNotFound {
                tournament_id: missing_id.clone(),
            },
            |tournament| {
                if tournament.status != TournamentStatus::Completed {
                    tournament.status = TournamentStatus::Cancelled;
                    tournament.joining_open = false;
                }
                Ok(())
            },
        )
        .await?;
        self.cancel_tournament_tasks(tournament_id).await?;
        tracing::info!(%tournament_id, "tournament cancelled");
        Ok(())
    }

    async fn cancel_tournament_tasks(&self, tournament_id: &TournamentId) -> Result<(), ArenaError> {
        for task_key in TaskKind::tournament_keys(tournament_id) {
            self.tasks.cancel(&task_key).await?;
        }
        Ok(())
    }
}
