use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use pinpoint_core::lobby::{LobbySettings, MAX_PLAYERS_LIMIT, MAX_ROUND_COUNT};

/// Top-level server configuration, loaded from `pinpoint.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub auth: AuthFileConfig,
    pub limits: LimitsConfig,
    pub lobbies: LobbiesConfig,
    pub retry: RetryConfig,
    pub shutdown: ShutdownConfig,
    pub persistence: PersistenceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            auth: AuthFileConfig::default(),
            limits: LimitsConfig::default(),
            lobbies: LobbiesConfig::default(),
            retry: RetryConfig::default(),
            shutdown: ShutdownConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// Auth section of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthFileConfig {
    /// HS256 secret shared with the credential issuer.
    pub jwt_secret: String,
    /// Expected `iss` claim. None = not checked.
    pub issuer: Option<String>,
}

/// Infrastructure limits (connection caps, buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    /// Outbound frames buffered per connection before writes start timing out.
    pub connection_buffer: usize,
    pub broadcast_write_timeout_ms: u64,
    pub ws_rate_limit_per_sec: f64,
    pub max_frame_bytes: usize,
    /// Upper bound on a single REST request.
    pub request_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 1000,
            connection_buffer: 64,
            broadcast_write_timeout_ms: 250,
            ws_rate_limit_per_sec: 20.0,
            max_frame_bytes: pinpoint_core::net::protocol::MAX_MESSAGE_SIZE,
            request_timeout_secs: 10,
        }
    }
}

impl LimitsConfig {
    pub fn broadcast_write_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_write_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Lobby lifecycle and default match settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LobbiesConfig {
    /// Sliding expiry window.
    pub ttl_secs: u64,
    pub reap_interval_secs: u64,
    /// Delay between a round being scheduled and it accepting guesses.
    pub start_delay_ms: u64,
    pub max_players: u8,
    pub default_round_count: u8,
    pub default_round_time_limit_secs: u64,
}

impl Default for LobbiesConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            reap_interval_secs: 30,
            start_delay_ms: 3000,
            max_players: 8,
            default_round_count: 5,
            default_round_time_limit_secs: 30,
        }
    }
}

impl LobbiesConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    /// Settings a new lobby starts from before host overrides.
    pub fn default_settings(&self) -> LobbySettings {
        LobbySettings {
            round_count: self.default_round_count,
            round_time_limit_ms: self.default_round_time_limit_secs * 1000,
            max_players: self.max_players,
            ..LobbySettings::default()
        }
    }
}

/// Bounded retry for transient store and persistence failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time in-flight games get to flush a final broadcast.
    pub grace_ms: u64,
    /// Overall deadline for closing registered resources.
    pub deadline_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: 2000,
            deadline_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// JSON-lines file for finished games. None = in-memory only.
    pub results_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("listen_addr {0:?} is not a valid socket address")]
    InvalidListenAddr(String),
    #[error("auth.jwt_secret must be set")]
    MissingJwtSecret,
    #[error("{0} must be > 0")]
    Zero(&'static str),
    #[error("{field} must be <= {max}")]
    TooLarge { field: &'static str, max: u64 },
    #[error("retry.max_delay_ms must be >= retry.base_delay_ms")]
    RetryDelays,
}

impl ServerConfig {
    /// Check the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(ConfigError::InvalidListenAddr(self.listen_addr.clone()));
        }
        if self.auth.jwt_secret.is_empty() {
            errors.push(ConfigError::MissingJwtSecret);
        }

        let nonzero: [(&'static str, u64); 11] = [
            ("limits.max_ws_connections", self.limits.max_ws_connections as u64),
            ("limits.connection_buffer", self.limits.connection_buffer as u64),
            ("limits.broadcast_write_timeout_ms", self.limits.broadcast_write_timeout_ms),
            ("limits.max_frame_bytes", self.limits.max_frame_bytes as u64),
            ("limits.request_timeout_secs", self.limits.request_timeout_secs),
            ("lobbies.ttl_secs", self.lobbies.ttl_secs),
            ("lobbies.reap_interval_secs", self.lobbies.reap_interval_secs),
            ("lobbies.max_players", u64::from(self.lobbies.max_players)),
            ("lobbies.default_round_count", u64::from(self.lobbies.default_round_count)),
            ("lobbies.default_round_time_limit_secs", self.lobbies.default_round_time_limit_secs),
            ("retry.max_attempts", u64::from(self.retry.max_attempts)),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                errors.push(ConfigError::Zero(field));
            }
        }
        if self.limits.ws_rate_limit_per_sec <= 0.0 {
            errors.push(ConfigError::Zero("limits.ws_rate_limit_per_sec"));
        }
        if self.shutdown.deadline_ms == 0 {
            errors.push(ConfigError::Zero("shutdown.deadline_ms"));
        }

        if self.lobbies.max_players > MAX_PLAYERS_LIMIT {
            errors.push(ConfigError::TooLarge {
                field: "lobbies.max_players",
                max: u64::from(MAX_PLAYERS_LIMIT),
            });
        }
        if self.lobbies.default_round_count > MAX_ROUND_COUNT {
            errors.push(ConfigError::TooLarge {
                field: "lobbies.default_round_count",
                max: u64::from(MAX_ROUND_COUNT),
            });
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push(ConfigError::RetryDelays);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load config from `pinpoint.toml` if it exists, then apply env var overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string("pinpoint.toml") {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from pinpoint.toml");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse pinpoint.toml: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No pinpoint.toml found, using defaults");
                ServerConfig::default()
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply `PINPOINT_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(addr) = var("PINPOINT_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(secret) = var("PINPOINT_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(path) = var("PINPOINT_RESULTS_PATH") {
            self.persistence.results_path = Some(path);
        }
        if let Some(n) = var("PINPOINT_LOBBY_TTL_SECS").and_then(|v| v.parse::<u64>().ok()) {
            self.lobbies.ttl_secs = n;
        }
        if let Some(n) = var("PINPOINT_MAX_WS_CONNECTIONS").and_then(|v| v.parse::<usize>().ok()) {
            self.limits.max_ws_connections = n;
        }
    }
}
