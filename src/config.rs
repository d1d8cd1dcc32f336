//! ShardMaster Configuration
//!
//! Configuration structures for the coordination tier. Placement rules are
//! loaded once at startup and never change for the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::consistency::ConsistencyMode;
use crate::dispatch::HashAlgorithm;

/// Main ShardMaster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Read/dispatch behaviour
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Placement rule generations, any order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Lock manager settings
    #[serde(default)]
    pub transaction: TransactionConfig,

    /// Size limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Node I/O timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Health tracking
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Worker pool
    #[serde(default)]
    pub workers: WorkerConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier of this master
    pub id: String,

    /// Address to bind for client traffic
    pub bind_address: String,
}

/// Read/dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DispatchConfig {
    /// Consistency mode for reads
    #[serde(default)]
    pub consistency: ConsistencyMode,

    /// Namespace prefix applied to every key and tag
    #[serde(default)]
    pub isolation_prefix: Option<String>,
}

/// One placement rule generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Generation id, higher is newer
    pub generation: u64,

    /// Hash assignment algorithm
    #[serde(default)]
    pub algorithm: HashAlgorithm,

    /// Replica groups; a key maps to exactly one group
    pub groups: Vec<GroupConfig>,
}

/// A replica group inside a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Primary node address (host:port)
    pub primary: String,

    /// Secondary node address
    #[serde(default)]
    pub secondary: Option<String>,

    /// Tertiary node address
    #[serde(default)]
    pub tertiary: Option<String>,
}

impl GroupConfig {
    fn role_count(&self) -> usize {
        match (&self.secondary, &self.tertiary) {
            (None, None) => 1,
            (Some(_), None) => 2,
            (_, Some(_)) => 3,
        }
    }
}

/// Lock manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Enable transaction (lock) mode cluster-wide
    #[serde(default)]
    pub enabled: bool,

    /// Transaction manager address (host:port)
    #[serde(default)]
    pub manager: Option<String>,

    /// Upper bound on the write-path wait for a foreign lock, in milliseconds
    #[serde(default = "default_lock_gate_timeout_ms")]
    pub lock_gate_timeout_ms: u64,

    /// Poll interval for the write-path lock check, in milliseconds
    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,
}

/// Size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Keys and tags must be strictly shorter than this
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,

    /// Largest accepted value in bytes
    #[serde(default = "default_max_value_length")]
    pub max_value_length: usize,
}

/// Node I/O timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection open timeout in milliseconds
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    /// Standard request timeout in milliseconds
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,

    /// Timeout for calculation and recovery operations in milliseconds
    #[serde(default = "default_long_request_ms")]
    pub long_request_ms: u64,

    /// Health probe timeout in milliseconds
    #[serde(default = "default_ping_ms")]
    pub ping_ms: u64,
}

/// Health tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Consecutive network failures before a node is marked dead
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Poll interval while draining a paused node, in milliseconds
    #[serde(default = "default_drain_poll_ms")]
    pub drain_poll_ms: u64,

    /// Health probe interval in milliseconds (0 = disabled)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Idle pooled connections kept per node
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of workers
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Capacity of the shared session queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Release a session once this many workers are waiting
    #[serde(default = "default_fairness_threshold")]
    pub fairness_threshold: usize,

    /// How long an idle session is polled before release, in milliseconds
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_lock_gate_timeout_ms() -> u64 {
    5000
}

fn default_lock_poll_interval_ms() -> u64 {
    10
}

fn default_max_key_length() -> usize {
    486
}

fn default_max_value_length() -> usize {
    1_048_576
}

fn default_connect_ms() -> u64 {
    4000
}

fn default_request_ms() -> u64 {
    8000
}

fn default_long_request_ms() -> u64 {
    16000
}

fn default_ping_ms() -> u64 {
    2500
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_drain_poll_ms() -> u64 {
    50
}

fn default_probe_interval_ms() -> u64 {
    5000
}

fn default_max_idle_connections() -> usize {
    16
}

fn default_worker_count() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_fairness_threshold() -> usize {
    2
}

fn default_idle_poll_ms() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            manager: None,
            lock_gate_timeout_ms: default_lock_gate_timeout_ms(),
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_key_length: default_max_key_length(),
            max_value_length: default_max_value_length(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            request_ms: default_request_ms(),
            long_request_ms: default_long_request_ms(),
            ping_ms: default_ping_ms(),
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            drain_poll_ms: default_drain_poll_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            max_idle_connections: default_max_idle_connections(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            fairness_threshold: default_fairness_threshold(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl MasterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: MasterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.node.id.is_empty() {
            return Err(Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.rules.is_empty() {
            return Err(Error::Config("at least one [[rules]] entry is required".into()));
        }

        let mut generations = HashSet::new();
        for rule in &self.rules {
            if !generations.insert(rule.generation) {
                return Err(Error::Config(format!(
                    "duplicate rule generation {}",
                    rule.generation
                )));
            }

            let Some(first) = rule.groups.first() else {
                return Err(Error::Config(format!(
                    "rule generation {} has no groups",
                    rule.generation
                )));
            };

            let roles = first.role_count();
            for group in &rule.groups {
                if group.role_count() != roles {
                    return Err(Error::Config(format!(
                        "rule generation {} mixes groups with different replica roles",
                        rule.generation
                    )));
                }
                if group.tertiary.is_some() && group.secondary.is_none() {
                    return Err(Error::Config(format!(
                        "rule generation {} has a tertiary without a secondary",
                        rule.generation
                    )));
                }
                for address in group.addresses() {
                    validate_address(address)?;
                }
            }
        }

        if self.transaction.enabled {
            match &self.transaction.manager {
                Some(address) => validate_address(address)?,
                None => {
                    return Err(Error::Config(
                        "transaction.manager is required when transaction mode is enabled".into(),
                    ))
                }
            }
        }

        if self.workers.count == 0 {
            return Err(Error::Config("workers.count must be at least 1".into()));
        }

        if self.workers.queue_capacity == 0 {
            return Err(Error::Config("workers.queue_capacity must be at least 1".into()));
        }

        if self.limits.max_key_length == 0 {
            return Err(Error::Config("limits.max_key_length must be positive".into()));
        }

        Ok(())
    }

    /// Connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    /// Standard request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_ms)
    }

    /// Long request timeout as Duration
    pub fn long_request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.long_request_ms)
    }

    /// Probe interval, `None` when the probe is disabled
    pub fn probe_interval(&self) -> Option<Duration> {
        match self.failover.probe_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Every distinct data node address across all rules, in first-seen order
    pub fn data_nodes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for rule in &self.rules {
            for group in &rule.groups {
                for address in group.addresses() {
                    if seen.insert(address.to_string()) {
                        nodes.push(address.to_string());
                    }
                }
            }
        }
        nodes
    }
}

impl GroupConfig {
    /// Configured addresses in role order
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str())
            .chain(self.secondary.as_deref())
            .chain(self.tertiary.as_deref())
    }
}

fn validate_address(address: &str) -> crate::Result<()> {
    let valid = match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(crate::Error::Config(format!(
            "invalid node address '{}', expected host:port",
            address
        )))
    }
}
