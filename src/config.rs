//! Configuration for flowgate
//!
//! Declarative YAML file with environment-variable overrides. Every option
//! can be overridden by an `LB_`-prefixed variable with dots replaced by
//! underscores (`server.port` → `LB_SERVER_PORT`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{LbError, Result};

/// Default search locations when no explicit config path is given
const SEARCH_PATHS: &[&str] = &[
    "config.yaml",
    "config/config.yaml",
    "/etc/flowgate/config.yaml",
];

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Listening server options
    pub server: ServerConfig,
    /// Logging options
    pub logging: LoggingConfig,
    /// Upstream backends (at least one required)
    pub backends: Vec<BackendConfig>,
    /// Balancing algorithm selection
    pub balancer: BalancerConfig,
    /// Active health checking
    pub health_check: HealthCheckConfig,
    /// Per-client rate limiting
    pub rate_limit: RateLimitConfig,
}

/// HTTP server options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening port (1–65535)
    pub port: u16,
    /// Per-request deadline; also the upstream connect timeout
    #[serde(with = "duration")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Logging options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level: debug, info, warn, error
    pub level: String,
    /// Format: json or console
    pub format: String,
    /// Output: stdout or file
    pub output: String,
    /// Log file path (required when output = file)
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            output: "stdout".to_string(),
            file_path: "./logs/flowgate.log".to_string(),
        }
    }
}

/// A single upstream backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend base URL (scheme + host + port + optional path prefix)
    pub url: String,
}

/// Balancing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Rotate across the healthy set with a shared cursor
    #[default]
    RoundRobin,
    /// Pick the healthy backend with the fewest active connections
    LeastConnections,
    /// Pick a uniformly random healthy backend
    Random,
}

impl Algorithm {
    /// Canonical name as used in configuration and the status endpoint
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::Random => "random",
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = LbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round_robin" => Ok(Algorithm::RoundRobin),
            "least_connections" => Ok(Algorithm::LeastConnections),
            "random" => Ok(Algorithm::Random),
            other => Err(LbError::Config(format!(
                "invalid balancer algorithm: {other}"
            ))),
        }
    }
}

/// Balancer options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BalancerConfig {
    /// Selection algorithm
    pub algorithm: Algorithm,
}

/// Active health checking options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Whether the probe loop runs at all
    pub enabled: bool,
    /// Time between probe rounds
    #[serde(with = "duration")]
    pub interval: Duration,
    /// Path appended to each backend URL for the probe
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            path: "/health".to_string(),
        }
    }
}

/// Rate limiting options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether the token-bucket gate is applied to proxied requests
    pub enabled: bool,
    /// Networked store; an empty `addr` selects the in-process store
    pub redis: RedisConfig,
    /// Bucket parameters for clients without an explicit config
    pub default: TokenBucketConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis: RedisConfig::default(),
            default: TokenBucketConfig::default(),
        }
    }
}

/// Redis connection options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RedisConfig {
    /// host:port; empty means "use the in-process store"
    pub addr: String,
    /// Optional password
    pub password: String,
    /// Database index
    pub db: i64,
}

impl RedisConfig {
    /// Connection URL for the redis client
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }
}

/// Token-bucket parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBucketConfig {
    /// Maximum tokens in the bucket
    pub capacity: i64,
    /// Tokens added per second, up to the capacity ceiling
    pub refill_rate: i64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            refill_rate: 10,
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, or search the default
    /// locations. A missing file is not an error: defaults plus environment
    /// overrides still apply, and validation decides whether the result is
    /// usable.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let content = match path {
            Some(p) => Some(std::fs::read_to_string(p).map_err(|e| {
                LbError::Config(format!("failed to read config file {p}: {e}"))
            })?),
            None => SEARCH_PATHS.iter().find_map(|p| {
                Path::new(p)
                    .exists()
                    .then(|| std::fs::read_to_string(p).ok())
                    .flatten()
            }),
        };

        let mut config = match content {
            Some(text) => Self::from_yaml(&text)?,
            None => {
                eprintln!("Warning: no config file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| LbError::Config(format!("failed to parse YAML config: {e}")))
    }

    /// Apply `LB_`-prefixed environment overrides. Unparseable values are
    /// rejected rather than silently ignored during `validate`, so here a
    /// bad number or duration simply leaves the field unchanged with a
    /// warning on stderr.
    pub fn apply_env_overrides(&mut self) {
        override_parsed("LB_SERVER_PORT", &mut self.server.port);
        override_duration("LB_SERVER_TIMEOUT", &mut self.server.timeout);

        override_string("LB_LOGGING_LEVEL", &mut self.logging.level);
        override_string("LB_LOGGING_FORMAT", &mut self.logging.format);
        override_string("LB_LOGGING_OUTPUT", &mut self.logging.output);
        override_string("LB_LOGGING_FILE_PATH", &mut self.logging.file_path);

        if let Ok(v) = std::env::var("LB_BALANCER_ALGORITHM") {
            match v.parse() {
                Ok(alg) => self.balancer.algorithm = alg,
                Err(_) => eprintln!("Warning: ignoring invalid LB_BALANCER_ALGORITHM={v}"),
            }
        }

        // Comma-separated URL list, replacing the file-configured backends
        if let Ok(v) = std::env::var("LB_BACKENDS") {
            self.backends = v
                .split(',')
                .map(|u| BackendConfig {
                    url: u.trim().to_string(),
                })
                .filter(|b| !b.url.is_empty())
                .collect();
        }

        override_parsed("LB_HEALTH_CHECK_ENABLED", &mut self.health_check.enabled);
        override_duration("LB_HEALTH_CHECK_INTERVAL", &mut self.health_check.interval);
        override_string("LB_HEALTH_CHECK_PATH", &mut self.health_check.path);

        override_parsed("LB_RATE_LIMIT_ENABLED", &mut self.rate_limit.enabled);
        override_string("LB_RATE_LIMIT_REDIS_ADDR", &mut self.rate_limit.redis.addr);
        override_string(
            "LB_RATE_LIMIT_REDIS_PASSWORD",
            &mut self.rate_limit.redis.password,
        );
        override_parsed("LB_RATE_LIMIT_REDIS_DB", &mut self.rate_limit.redis.db);
        override_parsed(
            "LB_RATE_LIMIT_DEFAULT_CAPACITY",
            &mut self.rate_limit.default.capacity,
        );
        override_parsed(
            "LB_RATE_LIMIT_DEFAULT_REFILL_RATE",
            &mut self.rate_limit.default.refill_rate,
        );
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(LbError::Config(
                "server port must be between 1 and 65535".to_string(),
            ));
        }

        if self.backends.is_empty() {
            return Err(LbError::Config(
                "at least one backend must be configured".to_string(),
            ));
        }

        let level = self.logging.level.to_lowercase();
        if !matches!(level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(LbError::Config(format!(
                "invalid log level: {}",
                self.logging.level
            )));
        }

        let format = self.logging.format.to_lowercase();
        if !matches!(format.as_str(), "json" | "console") {
            return Err(LbError::Config(format!(
                "invalid log format: {}",
                self.logging.format
            )));
        }

        let output = self.logging.output.to_lowercase();
        if !matches!(output.as_str(), "stdout" | "file") {
            return Err(LbError::Config(format!(
                "invalid log output: {}",
                self.logging.output
            )));
        }

        if output == "file" && self.logging.file_path.is_empty() {
            return Err(LbError::Config(
                "file_path must be specified when output is set to file".to_string(),
            ));
        }

        if self.health_check.enabled && self.health_check.interval.is_zero() {
            return Err(LbError::Config(
                "health_check.interval must be positive".to_string(),
            ));
        }

        if self.rate_limit.enabled {
            let default = &self.rate_limit.default;
            if default.capacity <= 0 || default.refill_rate <= 0 {
                return Err(LbError::Config(
                    "rate_limit.default capacity and refill_rate must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn override_string(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *target = v;
    }
}

fn override_parsed<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = std::env::var(key) {
        match v.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => eprintln!("Warning: ignoring invalid {key}={v}"),
        }
    }
}

fn override_duration(key: &str, target: &mut Duration) {
    if let Ok(v) = std::env::var(key) {
        match parse_duration(&v) {
            Some(parsed) => *target = parsed,
            None => eprintln!("Warning: ignoring invalid {key}={v}"),
        }
    }
}

/// Parse a duration string like "10s", "500ms", "1m", or a bare number of
/// seconds. Returns None on anything else.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    s.parse().ok().map(Duration::from_secs)
}

/// Render a duration the way the config file writes it
fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration {
    use super::{format_duration, parse_duration};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        parse_duration(&raw).ok_or_else(|| D::Error::custom(format!("invalid duration: {raw}")))
    }
}
