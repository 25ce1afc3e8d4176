//! Durable delayed and repeating tasks.
//!
//! Tasks carry a stable idempotency key: enqueueing a key that is
//! already pending is a no-op, and any pending task can be cancelled by
//! key when its tournament completes. Handlers run under at-least-once
//! delivery — a failed run is retried, so handlers must be safe to
//! re-run.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ArenaError;
use crate::types::{RoomId, TournamentId};

/// The work items the arena schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// One-shot: close a tournament's joining window and start round 1.
    CloseJoining { tournament_id: TournamentId },
    /// Repeating: check whether every room of the active round has a
    /// winner, and advance the bracket when so.
    MatchMonitor { tournament_id: TournamentId },
    /// One-shot: skip a stalled player's turn. `turn_serial` pins the
    /// task to one specific turn so a late fire is a no-op.
    TurnTimeout { room_id: RoomId, turn_serial: u64 },
    /// One-shot: delete a finished room and clear its presence links.
    ArchiveRoom { room_id: RoomId },
}

impl TaskKind {
    /// Stable key for deduplication and cancellation.
    pub fn idempotency_key(&self) -> String {
        match self {
            TaskKind::CloseJoining { tournament_id } => format!("close-joining:{tournament_id}"),
            TaskKind::MatchMonitor { tournament_id } => format!("match-monitor:{tournament_id}"),
            TaskKind::TurnTimeout {
                room_id,
                turn_serial,
            } => format!("turn-timeout:{room_id}:{turn_serial}"),
            TaskKind::ArchiveRoom { room_id } => format!("archive-room:{room_id}"),
        }
    }

    /// Keys of the tournament-scoped tasks, for bulk cancellation when a
    /// tournament completes or is cancelled.
    pub fn tournament_keys(tournament_id: &TournamentId) -> [String; 2] {
        [
            format!("close-joining:{tournament_id}"),
            format!("match-monitor:{tournament_id}"),
        ]
    }
}

/// When a task should run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Schedule {
    /// Fire once after the delay.
    Once { delay: Duration },
    /// Fire every interval until cancelled.
    Every { interval: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Scheduled,
    /// A task with the same idempotency key is already pending.
    Duplicate,
}

/// Handles a fired task. Errors propagate to the queue's retry policy.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskKind) -> Result<(), ArenaError>;
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedule a task. Returns [`EnqueueResult::Duplicate`] without
    /// scheduling when the task's key is already pending.
    async fn enqueue(&self, task: TaskKind, schedule: Schedule)
        -> Result<EnqueueResult, ArenaError>;

    /// Cancel a pending task by key. Returns whether one was pending.
    async fn cancel(&self, key: &str) -> Result<bool, ArenaError>;

    /// Cancel every pending task whose key starts with the prefix.
    async fn cancel_prefix(&self, prefix: &str) -> Result<usize, ArenaError>;

    /// Whether a task with this key is currently pending.
    fn is_pending(&self, key: &str) -> bool;
}

struct PendingTask {
    cancel: CancellationToken,
}

struct Inner {
    pending: DashMap<String, PendingTask>,
    handler: RwLock<Option<Arc<dyn TaskHandler>>>,
    max_retries: u32,
    retry_backoff: Duration,
    shutdown: CancellationToken,
}

impl Inner {
    /// Run the handler with the queue's retry policy. At-least-once:
    /// a handler error triggers a retry after the backoff.
    async fn run_with_retries(&self, task: &TaskKind) {
        let key = task.idempotency_key();
        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            tracing::warn!(%key, "task fired with no handler registered");
            return;
        };
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match handler.handle(task).await {
                Ok(()) => return,
                Err(err) => {
                    if self.max_retries != 0 && attempt >= self.max_retries {
                        tracing::error!(%key, attempt, error = %err, "task failed, giving up");
                        return;
                    }
                    tracing::warn!(%key, attempt, error = %err, "task failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }
}

/// In-memory task queue driven by tokio timers.
///
/// Suitable for tests and single-process deployments; a clustered
/// deployment swaps in a queue backed by the shared store. Clones share
/// the same pending set.
#[derive(Clone)]
pub struct MemoryTaskQueue {
    inner: Arc<Inner>,
}

impl MemoryTaskQueue {
    pub fn new(max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                handler: RwLock::new(None),
                max_retries,
                retry_backoff,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register the dispatch handler. Must be called before tasks fire;
    /// a fire without a handler is logged and dropped.
    pub fn set_handler(&self, handler: Arc<dyn TaskHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Cancel all pending tasks and stop accepting new ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.pending.clear();
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(
        &self,
        task: TaskKind,
        schedule: Schedule,
    ) -> Result<EnqueueResult, ArenaError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ArenaError::ShuttingDown);
        }
        let key = task.idempotency_key();
        let cancel = self.inner.shutdown.child_token();
        match self.inner.pending.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Ok(EnqueueResult::Duplicate),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(PendingTask {
                    cancel: cancel.clone(),
                });
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match schedule {
                Schedule::Once { delay } => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // Remove before running so the handler may re-arm
                    // the same key.
                    inner.pending.remove(&key);
                    inner.run_with_retries(&task).await;
                }
                Schedule::Every { interval } => {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(interval) => {}
                        }
                        inner.run_with_retries(&task).await;
                        // The handler may have cancelled its own key.
                        if cancel.is_cancelled() {
                            break;
                        }
                    }
                    inner.pending.remove(&key);
                }
            }
        });
        Ok(EnqueueResult::Scheduled)
    }

    async fn cancel(&self, key: &str) -> Result<bool, ArenaError> {
        match self.inner.pending.remove(key) {
            Some((_, pending)) => {
                pending.cancel.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cancel_prefix(&self, prefix: &str) -> Result<usize, ArenaError> {
        let keys: Vec<String> = self
            .inner
            .pending
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        let mut cancelled = 0;
        for key in keys {
            if self.cancel(&key).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    fn is_pending(&self, key: &str) -> bool {
        self.inner.pending.contains_key(key)
    }
}
