//! Signaling node configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::signaling::protocol::IceServer;
use crate::worker_pool::WorkerPoolConfig;
use common::secret::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:4000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Upper bound for the default worker count.
pub const DEFAULT_MAX_WORKERS: usize = 4;

pub const DEFAULT_RESPAWN_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_RESPAWN_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_QUALITY_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_ROOM_SWEEP_INTERVAL_MS: u64 = 30_000;

/// Default STUN server advertised to clients.
pub const DEFAULT_ICE_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Default node ID prefix.
pub const DEFAULT_NODE_ID_PREFIX: &str = "signaling";

/// Signaling node configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:4000").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Identity of this node in logs.
    pub node_id: String,

    /// Number of media workers (default: CPU count, at most 4).
    pub worker_count: usize,

    /// Delay before replacing a dead worker.
    pub respawn_backoff: Duration,

    /// Cap for the replacement backoff after repeated spawn failures.
    pub respawn_max_backoff: Duration,

    pub quality_poll_interval: Duration,

    pub room_sweep_interval: Duration,

    /// Durable store URL; the in-memory store is used when absent.
    /// Protected by `SecretString` since it may embed a password.
    pub redis_url: Option<SecretString>,

    pub ice_stun_url: String,

    pub ice_turn_url: Option<String>,

    pub ice_turn_username: Option<String>,

    /// Protected by `SecretString`; only sent to joined clients.
    pub ice_turn_credential: Option<SecretString>,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("node_id", &self.node_id)
            .field("worker_count", &self.worker_count)
            .field("respawn_backoff", &self.respawn_backoff)
            .field("respawn_max_backoff", &self.respawn_max_backoff)
            .field("quality_poll_interval", &self.quality_poll_interval)
            .field("room_sweep_interval", &self.room_sweep_interval)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("ice_stun_url", &self.ice_stun_url)
            .field("ice_turn_url", &self.ice_turn_url)
            .field("ice_turn_username", &self.ice_turn_username)
            .field(
                "ice_turn_credential",
                &self.ice_turn_credential.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

impl ConfigError {
    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SIGNALING_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let worker_count = match parse_var::<usize>(vars, "MEDIA_WORKER_COUNT")? {
            Some(0) => {
                return Err(ConfigError::invalid("MEDIA_WORKER_COUNT", "must be at least 1"))
            }
            Some(count) => count,
            None => std::thread::available_parallelism()
                .map_or(1, std::num::NonZeroUsize::get)
                .min(DEFAULT_MAX_WORKERS),
        };

        let respawn_backoff = millis_var(
            vars,
            "MEDIA_WORKER_RESPAWN_BACKOFF_MS",
            DEFAULT_RESPAWN_BACKOFF_MS,
        )?;
        let respawn_max_backoff = millis_var(
            vars,
            "MEDIA_WORKER_RESPAWN_MAX_BACKOFF_MS",
            DEFAULT_RESPAWN_MAX_BACKOFF_MS,
        )?;
        if respawn_max_backoff < respawn_backoff {
            return Err(ConfigError::invalid(
                "MEDIA_WORKER_RESPAWN_MAX_BACKOFF_MS",
                "must not be below MEDIA_WORKER_RESPAWN_BACKOFF_MS",
            ));
        }

        let quality_poll_interval = millis_var(
            vars,
            "QUALITY_POLL_INTERVAL_MS",
            DEFAULT_QUALITY_POLL_INTERVAL_MS,
        )?;
        let room_sweep_interval =
            millis_var(vars, "ROOM_SWEEP_INTERVAL_MS", DEFAULT_ROOM_SWEEP_INTERVAL_MS)?;

        let redis_url = non_empty(vars, "REDIS_URL").map(SecretString::from);

        let ice_stun_url = non_empty(vars, "ICE_STUN_URL")
            .unwrap_or_else(|| DEFAULT_ICE_STUN_URL.to_string());
        let ice_turn_url = non_empty(vars, "ICE_TURN_URL");
        let ice_turn_username = non_empty(vars, "ICE_TURN_USERNAME");
        let ice_turn_credential = non_empty(vars, "ICE_TURN_CREDENTIAL").map(SecretString::from);

        let node_id = vars.get("SIGNALING_NODE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_NODE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            health_bind_address,
            node_id,
            worker_count,
            respawn_backoff,
            respawn_max_backoff,
            quality_poll_interval,
            room_sweep_interval,
            redis_url,
            ice_stun_url,
            ice_turn_url,
            ice_turn_username,
            ice_turn_credential,
        })
    }

    #[must_use]
    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            size: self.worker_count,
            respawn_backoff: self.respawn_backoff,
            max_respawn_backoff: self.respawn_max_backoff,
        }
    }

    /// ICE servers advertised in `room-joined`: STUN, plus TURN when set.
    #[must_use]
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = vec![IceServer {
            urls: vec![self.ice_stun_url.clone()],
            username: None,
            credential: None,
        }];
        if let Some(turn_url) = &self.ice_turn_url {
            servers.push(IceServer {
                urls: vec![turn_url.clone()],
                username: self.ice_turn_username.clone(),
                credential: self
                    .ice_turn_credential
                    .as_ref()
                    .map(|c| c.expose_secret().to_string()),
            });
        }
        servers
    }
}

fn non_empty(vars: &HashMap<String, String>, name: &str) -> Option<String> {
    vars.get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match non_empty(vars, name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(name, format!("{raw:?}: {e}"))),
        None => Ok(None),
    }
}

/// A positive millisecond duration.
fn millis_var(
    vars: &HashMap<String, String>,
    name: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    match parse_var::<u64>(vars, name)? {
        Some(0) => Err(ConfigError::invalid(name, "must be greater than zero")),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(Duration::from_millis(default_ms)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert!((1..=DEFAULT_MAX_WORKERS).contains(&config.worker_count));
        assert_eq!(config.respawn_backoff, Duration::from_secs(2));
        assert_eq!(config.respawn_max_backoff, Duration::from_secs(30));
        assert_eq!(config.quality_poll_interval, Duration::from_secs(5));
        assert_eq!(config.room_sweep_interval, Duration::from_secs(30));
        assert!(config.redis_url.is_none());
        assert!(config.node_id.starts_with("signaling-"));

        let ice = config.ice_servers();
        assert_eq!(ice.len(), 1);
        assert_eq!(ice.first().unwrap().urls, [DEFAULT_ICE_STUN_URL]);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let config = Config::from_vars(&vars(&[
            ("SIGNALING_BIND_ADDRESS", "127.0.0.1:4001"),
            ("SIGNALING_HEALTH_BIND_ADDRESS", "127.0.0.1:8082"),
            ("SIGNALING_NODE_ID", "signaling-test-01"),
            ("MEDIA_WORKER_COUNT", "3"),
            ("MEDIA_WORKER_RESPAWN_BACKOFF_MS", "500"),
            ("MEDIA_WORKER_RESPAWN_MAX_BACKOFF_MS", "4000"),
            ("QUALITY_POLL_INTERVAL_MS", "1000"),
            ("ROOM_SWEEP_INTERVAL_MS", "10000"),
            ("REDIS_URL", "redis://:pw@cache:6379"),
        ]))
        .expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:4001");
        assert_eq!(config.health_bind_address, "127.0.0.1:8082");
        assert_eq!(config.node_id, "signaling-test-01");
        assert_eq!(config.worker_count, 3);

        let pool = config.worker_pool();
        assert_eq!(pool.size, 3);
        assert_eq!(pool.respawn_backoff, Duration::from_millis(500));
        assert_eq!(pool.max_respawn_backoff, Duration::from_millis(4000));
        assert_eq!(config.quality_poll_interval, Duration::from_secs(1));
        assert_eq!(config.room_sweep_interval, Duration::from_secs(10));
        assert_eq!(
            config.redis_url.as_ref().unwrap().expose_secret(),
            "redis://:pw@cache:6379"
        );
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        for (name, value) in [
            ("MEDIA_WORKER_COUNT", "many"),
            ("MEDIA_WORKER_COUNT", "0"),
            ("QUALITY_POLL_INTERVAL_MS", "0"),
            ("ROOM_SWEEP_INTERVAL_MS", "-5"),
            ("MEDIA_WORKER_RESPAWN_BACKOFF_MS", "1.5"),
        ] {
            let result = Config::from_vars(&vars(&[(name, value)]));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue { name: ref n, .. }) if n == name),
                "{name}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_max_backoff_below_initial_is_rejected() {
        let result = Config::from_vars(&vars(&[
            ("MEDIA_WORKER_RESPAWN_BACKOFF_MS", "5000"),
            ("MEDIA_WORKER_RESPAWN_MAX_BACKOFF_MS", "1000"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_turn_server_added_when_configured() {
        let config = Config::from_vars(&vars(&[
            ("ICE_TURN_URL", "turn:turn.example.org:3478"),
            ("ICE_TURN_USERNAME", "interview"),
            ("ICE_TURN_CREDENTIAL", "s3cret"),
        ]))
        .unwrap();

        let ice = config.ice_servers();
        assert_eq!(ice.len(), 2);
        let turn = ice.last().unwrap();
        assert_eq!(turn.username.as_deref(), Some("interview"));
        assert_eq!(turn.credential.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let config = Config::from_vars(&vars(&[
            ("REDIS_URL", "redis://:hunter2@cache:6379"),
            ("ICE_TURN_URL", "turn:turn.example.org:3478"),
            ("ICE_TURN_CREDENTIAL", "s3cret"),
        ]))
        .unwrap();

        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
        assert!(!debug_output.contains("s3cret"));
    }
}
