//! Client configuration.

use anyhow::{Context, Result};
use scenesync_core::history::DEFAULT_RETENTION;
use scenesync_proto::{AddressError, RoomAddress, MAX_MESSAGE_SIZE};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sync server host, e.g. `wss://sync.example.com`
    pub host: String,

    /// Room to join
    pub room_id: String,

    /// Client identifier, used for logging
    pub client_id: Option<Uuid>,

    /// Outbound payloads at or above this size are chunked
    pub max_message_size: usize,

    /// Minimum spacing between accepted connect calls
    pub connect_throttle: Duration,

    /// Quiet period before a scheduled resync fires
    pub resync_debounce: Duration,

    /// Acknowledged deltas kept in memory
    pub history_retention: usize,

    /// Reconnection policy
    pub reconnect: ReconnectConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,
}

/// Reconnection policy for the socket.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub min_delay: Duration,

    /// Upper bound for any retry delay
    pub max_delay: Duration,

    /// Multiplier applied per attempt
    pub growth_factor: f64,

    /// A connection that lived this long resets the backoff
    pub min_uptime: Duration,

    /// Give up on a dial after this long
    pub connect_timeout: Duration,

    /// Stop retrying after this many attempts (`None` = forever)
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            growth_factor: 1.3,
            min_uptime: Duration::from_millis(5000),
            connect_timeout: Duration::from_millis(4000),
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry `attempt` (1-based); attempt 0 is immediate.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay = self.min_delay.as_secs_f64() * self.growth_factor.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Check if another attempt is allowed.
    #[must_use]
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_retries.map_or(true, |max| attempt <= max)
    }
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Persistence type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for SQLite)
    pub db_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "ws://localhost:8787".to_string(),
            room_id: "default".to_string(),
            client_id: None,
            max_message_size: MAX_MESSAGE_SIZE,
            connect_throttle: Duration::from_millis(1000),
            resync_debounce: Duration::from_millis(1000),
            history_retention: DEFAULT_RETENTION,
            reconnect: ReconnectConfig::default(),
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./scenesync.db"),
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SCENESYNC_HOST`: Sync server host
    /// - `SCENESYNC_ROOM_ID`: Room identifier
    /// - `SCENESYNC_CLIENT_ID`: Client UUID
    /// - `SCENESYNC_DB_PATH`: SQLite database path
    /// - `SCENESYNC_STORE`: "sqlite" or "memory"
    /// - `SCENESYNC_MAX_MESSAGE_SIZE`: Chunking threshold in bytes
    /// - `SCENESYNC_HISTORY_RETENTION`: Acknowledged deltas kept in memory
    /// - `SCENESYNC_RECONNECT_MIN_MS` / `SCENESYNC_RECONNECT_MAX_MS`: Backoff bounds
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = lookup("SCENESYNC_HOST") {
            config.host = host;
        }

        if let Some(room_id) = lookup("SCENESYNC_ROOM_ID") {
            config.room_id = room_id;
        }

        if let Some(id) = lookup("SCENESYNC_CLIENT_ID") {
            config.client_id = Some(Uuid::parse_str(&id).context("Invalid SCENESYNC_CLIENT_ID")?);
        }

        if let Some(db_path) = lookup("SCENESYNC_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(store_type) = lookup("SCENESYNC_STORE") {
            match store_type.as_str() {
                "sqlite" | "memory" => config.persistence.store_type = store_type,
                other => anyhow::bail!("Invalid SCENESYNC_STORE '{other}', expected sqlite or memory"),
            }
        }

        if let Some(size) = parse_var(&lookup, "SCENESYNC_MAX_MESSAGE_SIZE")? {
            anyhow::ensure!(size > 0, "SCENESYNC_MAX_MESSAGE_SIZE must be positive");
            config.max_message_size = size;
        }

        if let Some(retention) = parse_var(&lookup, "SCENESYNC_HISTORY_RETENTION")? {
            config.history_retention = retention;
        }

        if let Some(ms) = parse_var(&lookup, "SCENESYNC_RECONNECT_MIN_MS")? {
            config.reconnect.min_delay = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var(&lookup, "SCENESYNC_RECONNECT_MAX_MS")? {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }

        anyhow::ensure!(
            config.reconnect.min_delay <= config.reconnect.max_delay,
            "SCENESYNC_RECONNECT_MIN_MS exceeds SCENESYNC_RECONNECT_MAX_MS"
        );

        Ok(config)
    }

    /// Resolve the room address.
    ///
    /// # Errors
    ///
    /// Returns error if the host or room id is invalid.
    pub fn room_address(&self) -> Result<RoomAddress, AddressError> {
        RoomAddress::new(&self.host, self.room_id.clone())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| value.trim().parse::<T>().with_context(|| format!("Invalid {key}")))
        .transpose()
}
