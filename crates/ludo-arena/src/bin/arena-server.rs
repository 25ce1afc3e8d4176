use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ludo_arena::config::ArenaConfig;
use ludo_arena::fanout::RoomBus;
use ludo_arena::gateway::SessionGateway;
use ludo_arena::http;
use ludo_arena::match_play::{MatchService, ThreadRngDice};
use ludo_arena::room::RoomService;
use ludo_arena::scheduler::{MemoryTaskQueue, TaskQueue};
use ludo_arena::session::Services;
use ludo_arena::store::{DocumentStore, MemoryStore};
use ludo_arena::tournament::TournamentService;
use ludo_arena::worker::ArenaWorker;

#[derive(Debug, Parser)]
#[command(name = "arena-server", about = "Ludo match and tournament server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "ARENA_LISTEN", default_value = "0.0.0.0:3000")]
    listen: SocketAddr,

    /// HS256 secret for verifying session tokens.
    #[arg(long, env = "ARENA_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Seconds a tournament stays open for joining.
    #[arg(long, env = "ARENA_JOINING_GRACE_SECS", default_value_t = 120)]
    joining_grace_secs: u64,

    /// Seconds a player may sit on their turn before it is skipped.
    #[arg(long, env = "ARENA_TURN_TIMEOUT_SECS", default_value_t = 30)]
    turn_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(ArenaConfig {
        jwt_secret: args.jwt_secret,
        joining_grace: Duration::from_secs(args.joining_grace_secs),
        turn_timeout: Duration::from_secs(args.turn_timeout_secs),
        ..ArenaConfig::default()
    });
    config.validate().context("invalid configuration")?;

    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let bus = RoomBus::new(Arc::clone(&store));
    let shutdown = CancellationToken::new();
    bus.start(shutdown.clone());

    let queue = MemoryTaskQueue::new(config.task_max_retries, config.task_retry_backoff);
    let tasks: Arc<dyn TaskQueue> = Arc::new(queue.clone());

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
        Arc::new(ThreadRngDice),
    ));
    queue.set_handler(ArenaWorker::new(
        Arc::clone(&store),
        Arc::clone(&tasks),
        Arc::clone(&rooms),
        Arc::clone(&matches),
        Arc::clone(&tournaments),
    ));

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

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    tracing::info!(listen = %args.listen, "arena server listening");

    let app = http::router(services);
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
        })
        .await
        .context("server error")?;

    queue.shutdown();
    Ok(())
}
