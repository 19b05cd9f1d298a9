use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Database endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL, passed opaquely to the driver
    pub url: String,

    /// Driver-specific connection parameters
    #[serde(default)]
    pub options: HashMap<String, String>,

    /// Hard timeout for one connect attempt, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for the liveness probe, in milliseconds (shorter than connect)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Connect attempts before a (re)connection sequence fails
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Base delay between failed connect attempts, in milliseconds
    #[serde(default = "default_connect_backoff_base_ms")]
    pub connect_backoff_base_ms: u64,

    /// Cap on the exponential connect backoff, in milliseconds
    #[serde(default = "default_connect_backoff_cap_ms")]
    pub connect_backoff_cap_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_max_connect_attempts() -> u32 {
    3
}

fn default_connect_backoff_base_ms() -> u64 {
    500
}

fn default_connect_backoff_cap_ms() -> u64 {
    8_000
}

/// Gateway resource-shaping tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Peak in-flight queries; set below the database's own connection cap
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum time a task may wait unstarted, in milliseconds
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Execution timeout per query attempt, in milliseconds
    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,

    /// Attempts per query before giving up on retryable errors
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Base retry backoff, in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Cap on the exponential retry backoff, in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Cooldown after the database reports its connection limit, in milliseconds
    #[serde(default = "default_circuit_breaker_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,

    /// Whether the background health monitor runs
    #[serde(default = "default_health_check_enabled")]
    pub health_check_enabled: bool,

    /// Interval between background health probes, in milliseconds
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Skip the background probe if a query succeeded this recently, in milliseconds
    #[serde(default = "default_health_check_grace_ms")]
    pub health_check_grace_ms: u64,

    /// Successful queries slower than this are logged, in milliseconds
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,

    /// Queue length that triggers a warning log
    #[serde(default = "default_queue_warn_threshold")]
    pub queue_warn_threshold: usize,

    /// Queue length that triggers an error log
    #[serde(default = "default_queue_critical_threshold")]
    pub queue_critical_threshold: usize,

    /// Bounded wait for in-flight tasks at shutdown, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Connect during `init()` instead of lazily on first use
    #[serde(default)]
    pub eager_connect: bool,
}

fn default_max_concurrent() -> usize {
    8
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn default_per_attempt_timeout_ms() -> u64 {
    15_000
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_cap_ms() -> u64 {
    5_000
}

fn default_circuit_breaker_cooldown_ms() -> u64 {
    60_000
}

fn default_health_check_enabled() -> bool {
    true
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_health_check_grace_ms() -> u64 {
    10_000
}

fn default_slow_query_threshold_ms() -> u64 {
    1_000
}

fn default_queue_warn_threshold() -> usize {
    50
}

fn default_queue_critical_threshold() -> usize {
    200
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_timeout_ms: default_queue_timeout_ms(),
            per_attempt_timeout_ms: default_per_attempt_timeout_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            circuit_breaker_cooldown_ms: default_circuit_breaker_cooldown_ms(),
            health_check_enabled: default_health_check_enabled(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_grace_ms: default_health_check_grace_ms(),
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
            queue_warn_threshold: default_queue_warn_threshold(),
            queue_critical_threshold: default_queue_critical_threshold(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            eager_connect: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database endpoint settings
    pub database: DatabaseConfig,

    /// Gateway tunables
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    /// Create a configuration for the given URL with default tunables
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig {
                url: url.into(),
                options: HashMap::new(),
                connect_timeout_ms: default_connect_timeout_ms(),
                probe_timeout_ms: default_probe_timeout_ms(),
                max_connect_attempts: default_max_connect_attempts(),
                connect_backoff_base_ms: default_connect_backoff_base_ms(),
                connect_backoff_cap_ms: default_connect_backoff_cap_ms(),
            },
            gateway: GatewayConfig::default(),
        }
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("database.url must not be empty");
        }
        if self.gateway.max_concurrent == 0 {
            anyhow::bail!("gateway.max_concurrent must be at least 1");
        }
        if self.gateway.max_retry_attempts == 0 {
            anyhow::bail!("gateway.max_retry_attempts must be at least 1");
        }
        if self.database.max_connect_attempts == 0 {
            anyhow::bail!("database.max_connect_attempts must be at least 1");
        }
        if self.gateway.per_attempt_timeout_ms == 0 || self.gateway.queue_timeout_ms == 0 {
            anyhow::bail!("gateway timeouts must be greater than zero");
        }
        if self.gateway.queue_critical_threshold < self.gateway.queue_warn_threshold {
            anyhow::bail!("gateway.queue_critical_threshold must be >= queue_warn_threshold");
        }
        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    config.validate()?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// Recognized variables:
/// - DBGATE_URL (required)
/// - DBGATE_MAX_CONCURRENT
/// - DBGATE_QUEUE_TIMEOUT_MS
/// - DBGATE_PER_ATTEMPT_TIMEOUT_MS
/// - DBGATE_MAX_RETRY_ATTEMPTS
/// - DBGATE_CIRCUIT_BREAKER_COOLDOWN_MS
/// - DBGATE_HEALTH_CHECK_INTERVAL_MS
/// - DBGATE_SLOW_QUERY_THRESHOLD_MS
/// - DBGATE_EAGER_CONNECT (true/false)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let url = std::env::var("DBGATE_URL").context("DBGATE_URL environment variable not set")?;

    let mut config = Config::new(url);

    if let Ok(v) = std::env::var("DBGATE_MAX_CONCURRENT") {
        if let Ok(val) = v.parse() {
            config.gateway.max_concurrent = val;
        }
    }

    if let Ok(v) = std::env::var("DBGATE_QUEUE_TIMEOUT_MS") {
        if let Ok(val) = v.parse() {
            config.gateway.queue_timeout_ms = val;
        }
    }

    if let Ok(v) = std::env::var("DBGATE_PER_ATTEMPT_TIMEOUT_MS") {
        if let Ok(val) = v.parse() {
            config.gateway.per_attempt_timeout_ms = val;
        }
    }

    if let Ok(v) = std::env::var("DBGATE_MAX_RETRY_ATTEMPTS") {
        if let Ok(val) = v.parse() {
            config.gateway.max_retry_attempts = val;
        }
    }

    if let Ok(v) = std::env::var("DBGATE_CIRCUIT_BREAKER_COOLDOWN_MS") {
        if let Ok(val) = v.parse() {
            config.gateway.circuit_breaker_cooldown_ms = val;
        }
    }

    if let Ok(v) = std::env::var("DBGATE_HEALTH_CHECK_INTERVAL_MS") {
        if let Ok(val) = v.parse() {
            config.gateway.health_check_interval_ms = val;
        }
    }

    if let Ok(v) = std::env::var("DBGATE_SLOW_QUERY_THRESHOLD_MS") {
        if let Ok(val) = v.parse() {
            config.gateway.slow_query_threshold_ms = val;
        }
    }

    if let Ok(v) = std::env::var("DBGATE_EAGER_CONNECT") {
        config.gateway.eager_connect = matches!(v.as_str(), "true" | "1" | "yes");
    }

    config.validate()?;
    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        load_from_yaml(path)
    } else {
        load_from_env()
    }
}
