//! Shared state store: whole-document key-value storage with optimistic
//! revisions, plus the publish/subscribe channel that fans events out
//! across serving processes.
//!
//! Documents are stored as serialized JSON under stable keys; every
//! mutation is a read-modify-write on the entire document. The revision
//! returned by a read must be presented on the write, so two processes
//! racing on the same key cannot silently lose an update.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::ArenaError;
use crate::types::{RoomId, TournamentId, UserId};

/// Monotonic per-key revision. 0 means "does not exist".
pub type Revision = u64;

/// Result of a conditional write.
#[derive(Debug, PartialEq, Eq)]
pub enum PutResult {
    /// Write applied; this is the new revision.
    Stored(Revision),
    /// Expected revision did not match the stored one.
    Conflict { actual: Revision },
}

/// Key-value storage with per-key revisions and a pub/sub bridge.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a value and its current revision.
    async fn get_raw(&self, key: &str) -> Result<Option<(Vec<u8>, Revision)>, ArenaError>;

    /// Store a value. With `expected = None` the write is unconditional;
    /// with `expected = Some(rev)` it only applies if the stored revision
    /// still equals `rev` (0 = key must not exist).
    async fn put_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<Revision>,
    ) -> Result<PutResult, ArenaError>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), ArenaError>;

    /// List all keys with the given prefix.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ArenaError>;

    /// Publish a payload on a channel, reaching every subscribed process.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), ArenaError>;

    /// Subscribe to a channel. The receiver sees payloads published by
    /// any process, including this one.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>>;
}

/// Typed helpers over [`DocumentStore`]. This is the single
/// (de)serialization boundary for shared documents.
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    async fn get_json<T>(&self, key: &str) -> Result<Option<(T, Revision)>, ArenaError>
    where
        T: DeserializeOwned + Send,
    {
        match self.get_raw(key).await? {
            None => Ok(None),
            Some((bytes, revision)) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| ArenaError::Transient {
                    reason: format!("corrupt document at {key}"),
                    source: Some(Box::new(e)),
                })?;
                Ok(Some((value, revision)))
            }
        }
    }

    async fn put_json<T>(
        &self,
        key: &str,
        value: &T,
        expected: Option<Revision>,
    ) -> Result<PutResult, ArenaError>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value).map_err(|e| ArenaError::Transient {
            reason: format!("failed to serialize document for {key}"),
            source: Some(Box::new(e)),
        })?;
        self.put_raw(key, bytes, expected).await
    }
}

impl<S: DocumentStore + ?Sized> DocumentStoreExt for S {}

/// Run a read-modify-write cycle on a document with compare-and-swap
/// retries. `mutate` must be safe to re-run: on a revision conflict the
/// document is reloaded and the closure applied again, up to
/// `max_retries` additional attempts.
///
/// `missing` produces the error returned when the key does not exist.
pub async fn with_document<T, R, F, M>(
    store: &dyn DocumentStore,
    key: &str,
    max_retries: u32,
    missing: M,
    mut mutate: F,
) -> Result<R, ArenaError>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    F: FnMut(&mut T) -> Result<R, ArenaError> + Send,
    M: Fn() -> ArenaError + Send + Sync,
{
    let mut conflicts = 0;
    loop {
        let (mut doc, revision) = store
            .get_json::<T>(key)
            .await?
            .ok_or_else(&missing)?;
        let value = mutate(&mut doc)?;
        match store.put_json(key, &doc, Some(revision)).await? {
            PutResult::Stored(_) => return Ok(value),
            PutResult::Conflict { actual } => {
                conflicts += 1;
                if conflicts > max_retries {
                    return Err(ArenaError::RevisionConflict {
                        key: key.to_string(),
                    });
                }
                tracing::debug!(key, actual, conflicts, "revision conflict, retrying");
            }
        }
    }
}

/// Stable key scheme for shared documents and presence entries.
pub mod keys {
    use super::*;

    pub fn room(id: &RoomId) -> String {
        format!("room:{id}")
    }

    pub fn tournament(id: &TournamentId) -> String {
        format!("tournament:{id}")
    }

    /// Room-id index for a tournament's joining-phase rooms.
    pub fn tournament_rooms(id: &TournamentId) -> String {
        format!("tournament:{id}:rooms")
    }

    /// Which room a user currently occupies.
    pub fn user_room(id: &UserId) -> String {
        format!("user:{id}:room")
    }

    /// Presence: the live connection handle for a user.
    pub fn user_socket(id: &UserId) -> String {
        format!("user:{id}:socket")
    }

    /// Deny-list entry for an explicitly revoked token.
    pub fn revoked_token(token: &str) -> String {
        format!("token:{token}")
    }
}

/// Capacity of each in-memory pub/sub channel.
const CHANNEL_CAPACITY: usize = 256;

/// In-memory store for tests and single-process deployments.
///
/// Clones share the same underlying data. Pub/sub is backed by a
/// `tokio::sync::broadcast` channel per topic.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, (Vec<u8>, Revision)>,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<(Vec<u8>, Revision)>, ArenaError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<Revision>,
    ) -> Result<PutResult, ArenaError> {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let current = occupied.get().1;
                if let Some(expected) = expected {
                    if expected != current {
                        return Ok(PutResult::Conflict { actual: current });
                    }
                }
                let next = current + 1;
                occupied.insert((value, next));
                Ok(PutResult::Stored(next))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if let Some(expected) = expected {
                    if expected != 0 {
                        return Ok(PutResult::Conflict { actual: 0 });
                    }
                }
                vacant.insert((value, 1));
                Ok(PutResult::Stored(1))
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ArenaError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ArenaError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), ArenaError> {
        // A send error only means there are no subscribers right now.
        let _ = self.channel(channel).send(payload);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        self.channel(channel).subscribe()
    }
}
