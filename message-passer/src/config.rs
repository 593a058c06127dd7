//! Configuration for the message passer and the cluster file format.

use {
    crate::{
        node::Node,
        rules::{Rule, RuleSet},
    },
    serde::{Deserialize, Serialize},
    std::{fs, path::Path, time::Duration},
};

/// Tunables for queues, dialing and framing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MessagePasserConfig {
    /// Capacity of the command queue, the inbound and delivered queues, and
    /// each delayed queue.  Per-peer outbound queues are unbounded.
    /// Default: 100.
    pub queue_capacity: usize,

    /// Pause between dial attempts while a peer is not yet listening (ms).
    /// Default: 1000.
    pub dial_retry_interval_ms: u64,

    /// Give up on a peer after this many dials.  `None` retries forever,
    /// since peers are not started in any particular order.
    pub max_dial_attempts: Option<u32>,

    /// Maximum size of a single serialized frame in bytes.
    pub max_message_size: usize,

    /// Interface the mesh listener binds to.  The port always comes from
    /// the local node's directory entry.
    pub listen_host: String,

    /// How long an accepted connection may take to send its hello (ms).
    pub handshake_timeout_ms: u64,

    /// How long writer tasks keep flushing queued copies after shutdown
    /// before giving up on them (ms).
    pub drain_timeout_ms: u64,
}

impl Default for MessagePasserConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            dial_retry_interval_ms: 1_000,
            max_dial_attempts: None,
            max_message_size: 1_048_576, // 1 MB
            listen_host: "0.0.0.0".to_string(),
            handshake_timeout_ms: 10_000,
            drain_timeout_ms: 5_000,
        }
    }
}

impl MessagePasserConfig {
    /// Create a config suitable for local testing with shorter intervals.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            queue_capacity: 100,
            dial_retry_interval_ms: 25,
            max_dial_attempts: Some(400),
            max_message_size: 1_048_576,
            listen_host: "127.0.0.1".to_string(),
            handshake_timeout_ms: 2_000,
            drain_timeout_ms: 1_000,
        }
    }

    pub fn dial_retry_interval(&self) -> Duration {
        Duration::from_millis(self.dial_retry_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }
        if self.dial_retry_interval_ms == 0 {
            return Err(ConfigError::InvalidDialInterval);
        }
        if self.max_dial_attempts == Some(0) {
            return Err(ConfigError::InvalidDialAttempts);
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidMaxMessageSize);
        }
        Ok(())
    }
}

/// Everything a node needs to join a session, as read from a TOML file.
///
/// ```toml
/// [passer]
/// dial_retry_interval_ms = 500
///
/// [[nodes]]
/// name = "armin"
/// address = "127.0.0.1"
/// port = 10011
///
/// [[receive_rules]]
/// action = "delay"
/// source = "armin"
/// kind = "MSG_PADDLE_POS"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub passer: MessagePasserConfig,
    pub nodes: Vec<Node>,
    pub send_rules: Vec<Rule>,
    pub receive_rules: Vec<Rule>,
}

impl ClusterConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.passer.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&text)
    }

    pub fn rules(&self) -> FaultRules {
        FaultRules {
            send: RuleSet::new(self.send_rules.clone()),
            receive: RuleSet::new(self.receive_rules.clone()),
        }
    }
}

/// Rule sets for both directions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultRules {
    pub send: RuleSet,
    pub receive: RuleSet,
}

/// Errors in message passer configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("queue_capacity must be > 0")]
    InvalidQueueCapacity,
    #[error("dial_retry_interval_ms must be > 0")]
    InvalidDialInterval,
    #[error("max_dial_attempts must be > 0 when set")]
    InvalidDialAttempts,
    #[error("max_message_size must be > 0")]
    InvalidMaxMessageSize,
    #[error("failed to read {0}: {1}")]
    Read(String, String),
    #[error("failed to parse cluster config: {0}")]
    Parse(String),
}
