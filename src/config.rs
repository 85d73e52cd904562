//! Configuration for the relay, signing sessions and the coordinator
//!
//! Values come from defaults, a TOML file, or environment variables.
//!
//! # Environment Variables
//!
//! - `MPC_KEYSIGN_PARTY_ID` - this device's party identifier (required)
//! - `MPC_KEYSIGN_RELAY_URL` - external relay; unset means self-hosted
//! - `MPC_KEYSIGN_RELAY_BIND` - bind address of a self-hosted relay (default: 127.0.0.1:0)
//! - `MPC_KEYSIGN_PUBLIC_URL` - relay URL advertised to joining devices
//! - `MPC_KEYSIGN_REQUEST_TIMEOUT_SECS` - HTTP request timeout (default: 10)
//! - `MPC_KEYSIGN_PEER_WAIT_SECS` - peer join bound (default: 120)
//! - `MPC_KEYSIGN_PROTOCOL_TIMEOUT_SECS` - round completion bound (default: 60)
//! - `MPC_KEYSIGN_LOG_LEVEL` - logging level (default: info)

use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Relay server settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address; port 0 picks a free port
    pub bind: SocketAddr,
    /// Maximum accepted request body
    pub body_limit_bytes: usize,
    /// URL advertised to joining devices instead of the bound address
    pub public_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            body_limit_bytes: 10 * 1024 * 1024,
            public_url: None,
        }
    }
}

/// Wait bounds and poll intervals of a signing session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// How long to wait for another device to join
    pub peer_wait: Duration,
    /// How long the rounds may take once started
    pub protocol: Duration,
    /// How long a joiner waits for the initiator's setup message
    pub setup_wait: Duration,
    /// Idle delay between engine / inbox polls
    pub poll_interval: Duration,
    /// Delay after a failed relay call
    pub retry_backoff: Duration,
    /// Delay between session membership polls
    pub peer_poll_interval: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            peer_wait: Duration::from_secs(120),
            protocol: Duration::from_secs(60),
            setup_wait: Duration::from_secs(120),
            poll_interval: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(500),
            peer_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// This device's party identifier
    pub local_party_id: String,
    /// External relay; `None` starts a relay for each signing attempt
    pub relay_url: Option<String>,
    /// Settings of the self-hosted relay
    pub relay: RelayConfig,
    /// HTTP request timeout towards the relay
    pub request_timeout: Duration,
    pub timeouts: SessionTimeouts,
    pub log_level: String,
}

impl CoordinatorConfig {
    pub fn new(local_party_id: impl Into<String>) -> Self {
        Self {
            local_party_id: local_party_id.into(),
            relay_url: None,
            relay: RelayConfig::default(),
            request_timeout: Duration::from_secs(10),
            timeouts: SessionTimeouts::default(),
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let party_id = env::var("MPC_KEYSIGN_PARTY_ID")
            .map_err(|_| ConfigError::MissingEnvVar("MPC_KEYSIGN_PARTY_ID".to_string()))?;
        let mut config = Self::new(party_id);

        config.relay_url = env::var("MPC_KEYSIGN_RELAY_URL").ok().filter(|v| !v.is_empty());
        config.relay.public_url = env::var("MPC_KEYSIGN_PUBLIC_URL").ok().filter(|v| !v.is_empty());

        if let Ok(bind) = env::var("MPC_KEYSIGN_RELAY_BIND") {
            config.relay.bind = parse_bind("MPC_KEYSIGN_RELAY_BIND", &bind)?;
        }
        if let Some(secs) = env_secs("MPC_KEYSIGN_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = secs;
        }
        if let Some(secs) = env_secs("MPC_KEYSIGN_PEER_WAIT_SECS")? {
            config.timeouts.peer_wait = secs;
        }
        if let Some(secs) = env_secs("MPC_KEYSIGN_PROTOCOL_TIMEOUT_SECS")? {
            config.timeouts.protocol = secs;
        }
        if let Ok(level) = env::var("MPC_KEYSIGN_LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(text)?;
        let mut config = Self::new(file.party_id);

        config.relay_url = file.relay_url;
        if let Some(relay) = file.relay {
            if let Some(bind) = relay.bind {
                config.relay.bind = parse_bind("relay.bind", &bind)?;
            }
            if let Some(limit) = relay.body_limit_bytes {
                config.relay.body_limit_bytes = limit;
            }
            config.relay.public_url = relay.public_url;
        }
        if let Some(secs) = file.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(t) = file.timeouts {
            let timeouts = &mut config.timeouts;
            if let Some(v) = t.peer_wait_secs {
                timeouts.peer_wait = Duration::from_secs(v);
            }
            if let Some(v) = t.protocol_secs {
                timeouts.protocol = Duration::from_secs(v);
            }
            if let Some(v) = t.setup_wait_secs {
                timeouts.setup_wait = Duration::from_secs(v);
            }
            if let Some(v) = t.poll_interval_ms {
                timeouts.poll_interval = Duration::from_millis(v);
            }
            if let Some(v) = t.retry_backoff_ms {
                timeouts.retry_backoff = Duration::from_millis(v);
            }
        }
        if let Some(level) = file.log_level {
            config.log_level = level;
        }

        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    party_id: String,
    relay_url: Option<String>,
    request_timeout_secs: Option<u64>,
    log_level: Option<String>,
    relay: Option<FileRelayConfig>,
    timeouts: Option<FileTimeouts>,
}

#[derive(Debug, Deserialize)]
struct FileRelayConfig {
    bind: Option<String>,
    body_limit_bytes: Option<usize>,
    public_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    peer_wait_secs: Option<u64>,
    protocol_secs: Option<u64>,
    setup_wait_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
}

fn parse_bind(name: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}: {}", value, e)))
}

fn env_secs(name: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), "must be a number".to_string())),
        Err(_) => Ok(None),
    }
}
