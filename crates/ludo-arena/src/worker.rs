//! Dispatches fired scheduler tasks to the owning service.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ArenaError;
use crate::match_play::MatchService;
use crate::room::RoomService;
use crate::scheduler::{TaskHandler, TaskKind, TaskQueue};
use crate::store::{keys, DocumentStore, DocumentStoreExt};
use crate::tournament::{Tournament, TournamentService};

pub struct ArenaWorker {
    store: Arc<dyn DocumentStore>,
    tasks: Arc<dyn TaskQueue>,
    rooms: Arc<RoomService>,
    matches: Arc<MatchService>,
    tournaments: Arc<TournamentService>,
}

impl ArenaWorker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        tasks: Arc<dyn TaskQueue>,
        rooms: Arc<RoomService>,
        matches: Arc<MatchService>,
        tournaments: Arc<TournamentService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tasks,
            rooms,
            matches,
            tournaments,
        })
    }

    /// One monitor tick: rebuild any round room whose document was lost
    /// between the bracket commit and room creation, then advance the
    /// bracket when every room of the active round has reported.
    async fn monitor_tick(&self, task: &TaskKind) -> Result<(), ArenaError> {
        let TaskKind::MatchMonitor { tournament_id } = task else {
            return Ok(());
        };
        let Some((tournament, _)) = self
            .store
            .get_json::<Tournament>(&keys::tournament(tournament_id))
            .await?
        else {
            // Tournament document is gone; stop monitoring it.
            self.tasks.cancel(&task.idempotency_key()).await?;
            return Ok(());
        };

        tracing::debug!(
            %tournament_id,
            round = tournament.current_round,
            reported = tournament.rooms.iter().filter(|s| s.winner.is_some()).count(),
            total = tournament.rooms.len(),
            "monitor tick"
        );
        self.tournaments.ensure_round_rooms(tournament_id).await?;

        // The monitor stays armed across rounds; advancing into a new
        // round leaves it watching the fresh summaries, and completion
        // cancels it from inside proceed_to_next_round.
        self.tournaments.proceed_to_next_round(tournament_id).await
    }
}

#[async_trait]
impl TaskHandler for ArenaWorker {
    async fn handle(&self, task: &TaskKind) -> Result<(), ArenaError> {
        match task {
            TaskKind::CloseJoining { tournament_id } => {
                self.tournaments
                    .close_joining_and_start(tournament_id)
                    .await
            }
            TaskKind::MatchMonitor { .. } => self.monitor_tick(task).await,
            TaskKind::TurnTimeout {
                room_id,
                turn_serial,
            } => self.matches.skip_stalled_turn(room_id, *turn_serial).await,
            TaskKind::ArchiveRoom { room_id } => self.rooms.archive_room(room_id).await,
        }
    }
}
