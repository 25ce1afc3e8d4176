//! In-process harness for integration tests.
//!
//! Wires the full service stack against the in-memory store and task
//! queue, with scripted dice, so tests exercise the same code paths as
//! the server binary without any network or external processes.

use jsonwebtoken::{encode, EncodingKey, Header};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ArenaConfig;
use crate::fanout::RoomBus;
use crate::gateway::{Claims, SessionGateway};
use crate::match_play::{DiceRoller, MatchService};
use crate::protocol::ServerEvent;
use crate::room::RoomService;
use crate::scheduler::MemoryTaskQueue;
use crate::session::Services;
use crate::store::{DocumentStore, MemoryStore};
use crate::tournament::TournamentService;
use crate::types::UserId;
use crate::worker::ArenaWorker;

pub const TEST_JWT_SECRET: &str = "arena-test-secret";

/// Deterministic dice: pops scripted values, panics when the script
/// runs dry so a test failure points at the missing roll.
pub struct FixedDice {
    values: Mutex<VecDeque<u8>>,
}

impl FixedDice {
    pub fn queued(values: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(values.iter().copied().collect()),
        })
    }

    pub fn push(&self, value: u8) {
        self.values.lock().push_back(value);
    }
}

impl DiceRoller for FixedDice {
    fn roll(&self) -> u8 {
        self.values.lock().pop_front().expect("dice script exhausted")
    }
}

pub struct TestArena {
    pub services: Arc<Services>,
    pub dice: Arc<FixedDice>,
    shutdown: CancellationToken,
}

impl TestArena {
    pub fn new() -> Self {
        Self::with_config(ArenaConfig {
            jwt_secret: TEST_JWT_SECRET.to_string(),
            ..ArenaConfig::default()
        })
    }

    pub fn with_config(config: ArenaConfig) -> Self {
        let config = Arc::new(config);
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let bus = RoomBus::new(Arc::clone(&store));
        let shutdown = CancellationToken::new();
        bus.start(shutdown.clone());

        let queue = MemoryTaskQueue::new(config.task_max_retries, config.task_retry_backoff);
        let tasks: Arc<dyn crate::scheduler::TaskQueue> = Arc::new(queue.clone());
        let dice = FixedDice::queued(&[]);

        let gateway = Arc::new(SessionGateway::new(Arc::clone(&store), Arc::clone(&config)));
        let rooms = Arc::new(RoomService::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&tasks),
            Arc::clone(&config),
        ));
        let tournaments = Arc::new(TournamentService::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&tasks),
            Arc::clone(&config),
        ));
        let matches = Arc::new(MatchService::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&tasks),
            Arc::clone(&config),
            Arc::clone(&tournaments),
            dice.clone() as Arc<dyn DiceRoller>,
        ));
        let worker = ArenaWorker::new(
            Arc::clone(&store),
            Arc::clone(&tasks),
            Arc::clone(&rooms),
            Arc::clone(&matches),
            Arc::clone(&tournaments),
        );
        queue.set_handler(worker);

        let services = Arc::new(Services {
            config,
            store,
            tasks,
            bus,
            gateway,
            rooms,
            matches,
            tournaments,
        });
        Self {
            services,
            dice,
            shutdown,
        }
    }

    /// Register a live session for the user and return its event feed.
    pub fn connect_user(&self, user_id: &UserId) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.services.bus.register_session(user_id.clone(), tx);
        rx
    }
}

impl Default for TestArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Mint a token the gateway accepts, signed with [`TEST_JWT_SECRET`].
pub fn issue_token(user_id: &str) -> String {
    let claims = Claims {
        id: user_id.to_string(),
        sub: "auth".to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
    )
    .expect("token encoding cannot fail")
}

/// Receive the next event or panic after a second.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event feed closed")
}

/// Drain events until one matches, panicking after `limit` events.
pub async fn wait_for_event<F>(
    rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    limit: usize,
    mut matches: F,
) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    for _ in 0..limit {
        let event = next_event(rx).await;
        if matches(&event) {
            return event;
        }
    }
    panic!("event did not arrive within {limit} events");
}
