//! Server configuration
//!
//! Configuration is layered: defaults, then an optional TOML file, then
//! environment overrides.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CONN_BIND_ADDR` | 0.0.0.0 | Listen address |
//! | `CONN_PORT` | 1523 | Listen port |
//! | `CONN_MAX_CLIENTS` | 100 | Shared admission pool size |
//! | `CONN_REGISTRY_CAPACITY` | 128 | Connection slots |
//! | `CONN_CONNECTION_WORKERS` | 100 | Connection-handler workers (one per served connection) |
//! | `CONN_REQUEST_WORKERS` | 32 | Command-handler workers |
//! | `CONN_WORKER_PARTITIONS` | 4 | Partitions per worker pool |
//! | `CONN_IDLE_POLL_MS` | 5000 | Idle check interval per connection |
//! | `CONN_SHUTDOWN_TIMEOUT_MS` | 30000 | Deadline per shutdown phase |
//! | `CONN_MAX_PAYLOAD` | 16777216 | Largest payload buffered per packet |
//! | `CONN_HA_STATE` | idle | Initial HA role |
//! | `CONN_LOG_FORMAT` | text | `text` or `json` |

use crate::admission::AdmissionRule;
use crate::error::ConfigError;
use crate::ha::HaState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1523;
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Largest payload buffered for a single Data/Error packet
    pub max_payload_size: usize,
    pub log_format: LogFormat,
    pub registry: RegistryConfig,
    pub admission: AdmissionConfig,
    pub workers: WorkerConfig,
    pub timeouts: TimeoutConfig,
    pub ha: HaConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Fixed number of connection slots
    pub capacity: usize,
    /// Recycled entries kept per connection free list
    pub entry_pool_size: usize,
    /// Read buffers kept in the shared buffer pool
    pub buffer_pool_size: usize,
    /// Initial capacity of each read buffer
    pub read_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Size of the shared pool used by classes without a rule
    pub max_clients: usize,
    /// Per-class rules, evaluated in order
    pub rules: Vec<AdmissionRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub connection_workers: usize,
    pub request_workers: usize,
    pub partitions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long a connection reader waits before running its idle checks
    #[serde(with = "duration_millis")]
    pub idle_poll: Duration,
    /// Deadline for the connect request after accept
    #[serde(with = "duration_millis")]
    pub handshake: Duration,
    /// How long a closing connection waits for in-flight commands
    #[serde(with = "duration_millis")]
    pub release_drain: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    pub initial_state: HaState,
    /// Number of replica hosts whose log appliers report state
    pub replica_hosts: usize,
    /// Grace period for disallowed transactions when entering maintenance
    #[serde(with = "duration_millis")]
    pub maintenance_grace: Duration,
    /// Pause after terminating disallowed transactions
    #[serde(with = "duration_millis")]
    pub maintenance_settle: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Deadline for each drain phase before force-termination
    #[serde(with = "duration_millis")]
    pub phase_deadline: Duration,
    /// Sleep between busy-worker polls
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Pause after blocking each connection
    #[serde(with = "duration_millis")]
    pub block_pause: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            log_format: LogFormat::Text,
            registry: RegistryConfig::default(),
            admission: AdmissionConfig::default(),
            workers: WorkerConfig::default(),
            timeouts: TimeoutConfig::default(),
            ha: HaConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            capacity: 128,
            entry_pool_size: 16,
            buffer_pool_size: 128,
            read_buffer_size: 8192,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig {
            max_clients: 100,
            rules: Vec::new(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            connection_workers: 100,
            request_workers: 32,
            partitions: 4,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            idle_poll: Duration::from_secs(5),
            handshake: Duration::from_secs(10),
            release_drain: Duration::from_secs(5),
        }
    }
}

impl Default for HaConfig {
    fn default() -> Self {
        HaConfig {
            initial_state: HaState::Idle,
            replica_hosts: 0,
            maintenance_grace: Duration::from_secs(10),
            maintenance_settle: Duration::from_secs(2),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        ShutdownConfig {
            phase_deadline: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            block_pause: Duration::from_millis(10),
        }
    }
}

impl ServerConfig {
    /// Configuration for tests (few slots, short timeouts)
    pub fn test() -> Self {
        ServerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            max_payload_size: 64 * 1024,
            log_format: LogFormat::Text,
            registry: RegistryConfig {
                capacity: 16,
                entry_pool_size: 4,
                buffer_pool_size: 8,
                read_buffer_size: 1024,
            },
            admission: AdmissionConfig {
                max_clients: 8,
                rules: Vec::new(),
            },
            workers: WorkerConfig {
                connection_workers: 8,
                request_workers: 4,
                partitions: 2,
            },
            timeouts: TimeoutConfig {
                idle_poll: Duration::from_millis(200),
                handshake: Duration::from_secs(2),
                release_drain: Duration::from_millis(500),
            },
            ha: HaConfig {
                initial_state: HaState::Idle,
                replica_hosts: 0,
                maintenance_grace: Duration::from_millis(100),
                maintenance_settle: Duration::from_millis(10),
            },
            shutdown: ShutdownConfig {
                phase_deadline: Duration::from_secs(2),
                poll_interval: Duration::from_millis(10),
                block_pause: Duration::from_millis(1),
            },
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: ServerConfig = toml::from_str(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("CONN_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(port) = env_parse("CONN_PORT") {
            self.port = port;
        }
        if let Some(max) = env_parse("CONN_MAX_CLIENTS") {
            self.admission.max_clients = max;
        }
        if let Some(capacity) = env_parse::<usize>("CONN_REGISTRY_CAPACITY") {
            self.registry.capacity = capacity.max(1);
        }
        if let Some(n) = env_parse::<usize>("CONN_CONNECTION_WORKERS") {
            self.workers.connection_workers = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("CONN_REQUEST_WORKERS") {
            self.workers.request_workers = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("CONN_WORKER_PARTITIONS") {
            self.workers.partitions = n.clamp(1, 64);
        }
        if let Some(ms) = env_parse::<u64>("CONN_IDLE_POLL_MS") {
            self.timeouts.idle_poll = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_parse::<u64>("CONN_SHUTDOWN_TIMEOUT_MS") {
            self.shutdown.phase_deadline = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("CONN_MAX_PAYLOAD") {
            self.max_payload_size = n.max(1);
        }
        if let Some(state) = env_parse::<HaState>("CONN_HA_STATE") {
            self.ha.initial_state = state;
        }
        if let Ok(format) = std::env::var("CONN_LOG_FORMAT") {
            self.log_format = if format.eq_ignore_ascii_case("json") {
                LogFormat::Json
            } else {
                LogFormat::Text
            };
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.capacity == 0 {
            return Err(ConfigError::Invalid("registry.capacity must be > 0".into()));
        }
        if self.registry.capacity > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "registry.capacity {} exceeds {}",
                self.registry.capacity,
                u16::MAX
            )));
        }
        if self.workers.partitions == 0 {
            return Err(ConfigError::Invalid("workers.partitions must be > 0".into()));
        }
        if self.workers.connection_workers < self.workers.partitions
            || self.workers.request_workers < self.workers.partitions
        {
            return Err(ConfigError::Invalid(
                "every worker partition needs at least one worker".into(),
            ));
        }
        if self.max_payload_size == 0 {
            return Err(ConfigError::Invalid("max_payload_size must be > 0".into()));
        }
        if self.timeouts.idle_poll.is_zero() {
            return Err(ConfigError::Invalid("timeouts.idle_poll must be > 0".into()));
        }
        for (i, rule) in self.admission.rules.iter().enumerate() {
            if rule.classes.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "admission rule '{}' names no client class",
                    rule.name
                )));
            }
            for other in &self.admission.rules[i + 1..] {
                if let Some(class) = rule.classes.iter().find(|c| other.classes.contains(c)) {
                    return Err(ConfigError::Invalid(format!(
                        "client class {:?} appears in rules '{}' and '{}'",
                        class, rule.name, other.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
