//! Cross-process event fan-out.
//!
//! Every server-to-client event is published on one store channel as an
//! [`Envelope`] naming its target: a room channel, a tournament channel,
//! a single user, or everyone. Each process runs a bridge task that
//! re-delivers inbound envelopes to the connections it hosts, so a
//! room's members receive the same events no matter which process they
//! are connected to. The publishing process receives its own envelopes
//! through the same subscription, so there is exactly one delivery path.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ArenaError;
use crate::protocol::ServerEvent;
use crate::store::DocumentStore;
use crate::types::{RoomId, TournamentId, UserId};

/// Store pub/sub channel all envelopes travel on.
const EVENTS_CHANNEL: &str = "arena:events";

/// Addressing for a published event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Target {
    Room { room_id: RoomId },
    Tournament { tournament_id: TournamentId },
    User { user_id: UserId },
    Global,
}

impl Target {
    pub fn room(room_id: &RoomId) -> Self {
        Target::Room {
            room_id: room_id.clone(),
        }
    }

    pub fn tournament(tournament_id: &TournamentId) -> Self {
        Target::Tournament {
            tournament_id: tournament_id.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    target: Target,
    event: ServerEvent,
}

/// Per-process fan-out hub: local connection registry plus the bridge
/// onto the store's pub/sub channel.
pub struct RoomBus {
    store: Arc<dyn DocumentStore>,
    sessions: DashMap<UserId, mpsc::UnboundedSender<ServerEvent>>,
    members: DashMap<Target, HashSet<UserId>>,
}

impl RoomBus {
    pub fn new(store: Arc<dyn DocumentStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            sessions: DashMap::new(),
            members: DashMap::new(),
        })
    }

    /// Register a connected user's outbound sender.
    pub fn register_session(&self, user_id: UserId, sender: mpsc::UnboundedSender<ServerEvent>) {
        self.sessions.insert(user_id, sender);
    }

    /// Drop a user's connection and all their channel memberships.
    pub fn unregister_session(&self, user_id: &UserId) {
        self.sessions.remove(user_id);
        for mut entry in self.members.iter_mut() {
            entry.value_mut().remove(user_id);
        }
    }

    /// Add a local user to a room or tournament channel.
    pub fn join(&self, target: Target, user_id: UserId) {
        self.members.entry(target).or_default().insert(user_id);
    }

    pub fn leave(&self, target: &Target, user_id: &UserId) {
        if let Some(mut entry) = self.members.get_mut(target) {
            entry.value_mut().remove(user_id);
        }
    }

    /// Publish an event to every member of the target, cluster-wide.
    pub async fn broadcast(&self, target: Target, event: ServerEvent) -> Result<(), ArenaError> {
        let envelope = Envelope { target, event };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| ArenaError::Transient {
            reason: "failed to serialize event envelope".into(),
            source: Some(Box::new(e)),
        })?;
        self.store.publish(EVENTS_CHANNEL, bytes).await
    }

    /// Route a direct message to one user's live connection, wherever
    /// they are connected.
    pub async fn send_to_user(&self, user_id: &UserId, event: ServerEvent) -> Result<(), ArenaError> {
        self.broadcast(
            Target::User {
                user_id: user_id.clone(),
            },
            event,
        )
        .await
    }

    /// Start the bridge task delivering published envelopes to local
    /// connections. Runs until the token is cancelled.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        let mut rx = bus.store.subscribe(EVENTS_CHANNEL);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(bytes) => bus.deliver(&bytes),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "fan-out bridge lagged, events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn deliver(&self, bytes: &[u8]) {
        let envelope: Envelope = match serde_json::from_slice(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed event envelope");
                return;
            }
        };
        match &envelope.target {
            Target::Global => {
                for entry in self.sessions.iter() {
                    let _ = entry.value().send(envelope.event.clone());
                }
            }
            Target::User { user_id } => {
                // A room assignment published by the bracket manager (on
                // whichever process ran it) also subscribes the user's
                // hosting process to the new room channel, so follow-up
                // room broadcasts reach them.
                if let ServerEvent::RoomAssigned { room_id, .. } = &envelope.event {
                    if self.sessions.contains_key(user_id) {
                        self.join(Target::room(room_id), user_id.clone());
                    }
                }
                if let Some(sender) = self.sessions.get(user_id) {
                    let _ = sender.send(envelope.event.clone());
                }
            }
            target => {
                let Some(members) = self.members.get(target) else {
                    return;
                };
                for user_id in members.iter() {
                    if let Some(sender) = self.sessions.get(user_id) {
                        let _ = sender.send(envelope.event.clone());
                    }
                }
            }
        }
    }
}
