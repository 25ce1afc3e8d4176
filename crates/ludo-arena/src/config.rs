use crate::error::ArenaError;
use std::time::Duration;

/// Configuration for the arena orchestration core.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Seats per ad-hoc room. Default: 4.
    pub max_players_per_room: usize,
    /// How long tournament joining stays open before the close-joining
    /// task fires. Default: 2 minutes.
    pub joining_grace: Duration,
    /// Interval between match-monitor checks for round completion.
    /// Default: 5s.
    pub monitor_interval: Duration,
    /// Delay between a game ending and the room document being archived
    /// (deleted from the store with presence links cleared). Default: 60s.
    pub room_archive_delay: Duration,
    /// How long a player may sit on their turn before it is skipped.
    /// Default: 30s.
    pub turn_timeout: Duration,
    /// Maximum delivery attempts for a failed task handler before the
    /// task is dropped. 0 = unlimited. Default: 3.
    pub task_max_retries: u32,
    /// Backoff between task handler retries. Default: 1s.
    pub task_retry_backoff: Duration,
    /// Maximum compare-and-swap retries for a read-modify-write cycle on
    /// a shared document before giving up. Default: 5.
    pub cas_max_retries: u32,
    /// HS256 secret used to verify session tokens.
    pub jwt_secret: String,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            max_players_per_room: 4,
            joining_grace: Duration::from_secs(120),
            monitor_interval: Duration::from_secs(5),
            room_archive_delay: Duration::from_secs(60),
            turn_timeout: Duration::from_secs(30),
            task_max_retries: 3,
            task_retry_backoff: Duration::from_secs(1),
            cas_max_retries: 5,
            jwt_secret: String::new(),
        }
    }
}

impl ArenaConfig {
    /// Validate configuration values. Returns an error if any value is invalid.
    pub fn validate(&self) -> Result<(), ArenaError> {
        if self.max_players_per_room < 2 {
            return Err(ArenaError::InvalidConfig {
                reason: format!(
                    "max_players_per_room must be >= 2, got {}",
                    self.max_players_per_room
                ),
            });
        }
        if self.joining_grace.is_zero() {
            return Err(ArenaError::InvalidConfig {
                reason: "joining_grace must be > 0".to_string(),
            });
        }
        if self.monitor_interval.is_zero() {
            return Err(ArenaError::InvalidConfig {
                reason: "monitor_interval must be > 0".to_string(),
            });
        }
        if self.turn_timeout.is_zero() {
            return Err(ArenaError::InvalidConfig {
                reason: "turn_timeout must be > 0".to_string(),
            });
        }
        if self.cas_max_retries == 0 {
            return Err(ArenaError::InvalidConfig {
                reason: "cas_max_retries must be >= 1".to_string(),
            });
        }
        if self.jwt_secret.is_empty() {
            return Err(ArenaError::InvalidConfig {
                reason: "jwt_secret must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
