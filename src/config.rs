//! Configuration for the relaywire server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "relaywire")]
#[command(author = "relaywire authors")]
#[command(version = "0.1.0")]
#[command(about = "A framed TCP application server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_conn: Option<usize>,

    /// Maximum message body size in bytes (0 = unlimited)
    #[arg(long)]
    pub max_package_size: Option<u32>,

    /// Worker pool core size
    #[arg(long)]
    pub core_workers: Option<usize>,

    /// Worker pool upper bound
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub worker_pool: WorkerPoolSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[server]` section
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
    #[serde(default = "default_max_package_size")]
    pub max_package_size: u32,
    #[serde(default = "default_send_queue_size")]
    pub send_queue_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: default_port(),
            max_conn: default_max_conn(),
            max_package_size: default_max_package_size(),
            send_queue_size: default_send_queue_size(),
        }
    }
}

/// `[worker_pool]` section
#[derive(Debug, Deserialize)]
pub struct WorkerPoolSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_core_workers")]
    pub core_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Idle timeout for elastic workers in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for WorkerPoolSection {
    fn default() -> Self {
        Self {
            enabled: true,
            core_workers: default_core_workers(),
            max_workers: default_max_workers(),
            queue_size: default_queue_size(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// `[heartbeat]` section
#[derive(Debug, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sweep interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Silence allowed before a connection is closed, in milliseconds
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

/// `[logging]` section
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_name() -> String {
    "relaywire".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_max_conn() -> usize {
    1000
}

fn default_max_package_size() -> u32 {
    1024
}

fn default_send_queue_size() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_core_workers() -> usize {
    4
}

fn default_max_workers() -> usize {
    16
}

fn default_queue_size() -> usize {
    1024
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Elastic worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// When false every request is dispatched on its own task.
    pub enabled: bool,
    /// Workers started eagerly and never evicted.
    pub core_workers: usize,
    /// Hard upper bound on live workers.
    pub max_workers: usize,
    /// Capacity of the shared job queue.
    pub queue_size: usize,
    /// How long an elastic worker may sit idle before it is stopped.
    pub idle_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolSection::default().into()
    }
}

impl From<WorkerPoolSection> for WorkerPoolConfig {
    fn from(section: WorkerPoolSection) -> Self {
        Self {
            enabled: section.enabled,
            core_workers: section.core_workers,
            max_workers: section.max_workers,
            queue_size: section.queue_size,
            idle_timeout: Duration::from_millis(section.idle_timeout_ms),
        }
    }
}

/// Liveness checking settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatSection::default().into()
    }
}

impl From<HeartbeatSection> for HeartbeatConfig {
    fn from(section: HeartbeatSection) -> Self {
        Self {
            enabled: section.enabled,
            interval: Duration::from_millis(section.interval_ms),
            timeout: Duration::from_millis(section.timeout_ms),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub max_conn: usize,
    pub max_package_size: u32,
    pub send_queue_size: usize,
    pub worker_pool: WorkerPoolConfig,
    pub heartbeat: HeartbeatConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed CLI args.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut config = Self::from_toml(toml_config);

        // Merge CLI args with TOML config (CLI takes precedence)
        if let Some(host) = cli.host {
            config.host = host;
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(max_conn) = cli.max_conn {
            config.max_conn = max_conn;
        }
        if let Some(max_package_size) = cli.max_package_size {
            config.max_package_size = max_package_size;
        }
        if let Some(core_workers) = cli.core_workers {
            config.worker_pool.core_workers = core_workers;
        }
        if let Some(max_workers) = cli.max_workers {
            config.worker_pool.max_workers = max_workers;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_toml(toml_config: TomlConfig) -> Self {
        Self {
            name: toml_config.server.name,
            host: toml_config.server.host,
            port: toml_config.server.port,
            max_conn: toml_config.server.max_conn,
            max_package_size: toml_config.server.max_package_size,
            send_queue_size: toml_config.server.send_queue_size,
            worker_pool: toml_config.worker_pool.into(),
            heartbeat: toml_config.heartbeat.into(),
            log_level: toml_config.logging.level,
        }
    }

    /// `host:port` string handed to the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_queue_size == 0 {
            return Err(ConfigError::Invalid("send_queue_size must be > 0".into()));
        }

        let pool = &self.worker_pool;
        if pool.enabled {
            if pool.max_workers == 0 {
                return Err(ConfigError::Invalid("max_workers must be > 0".into()));
            }
            if pool.core_workers > pool.max_workers {
                return Err(ConfigError::Invalid(format!(
                    "core_workers ({}) exceeds max_workers ({})",
                    pool.core_workers, pool.max_workers
                )));
            }
            if pool.queue_size == 0 {
                return Err(ConfigError::Invalid("queue_size must be > 0".into()));
            }
            if pool.idle_timeout.is_zero() {
                return Err(ConfigError::Invalid("idle_timeout must be > 0".into()));
            }
        }

        let heartbeat = &self.heartbeat;
        if heartbeat.enabled && (heartbeat.interval.is_zero() || heartbeat.timeout.is_zero()) {
            return Err(ConfigError::Invalid(
                "heartbeat interval and timeout must be > 0".into(),
            ));
        }

        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "127.0.0.1:8888");
        assert_eq!(config.max_conn, 1000);
        assert_eq!(config.max_package_size, 1024);
        assert_eq!(config.worker_pool.core_workers, 4);
        assert_eq!(config.worker_pool.max_workers, 16);
        assert_eq!(config.heartbeat.timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            max_conn = 2
            max_package_size = 4096

            [worker_pool]
            core_workers = 2
            max_workers = 4
            queue_size = 1
            idle_timeout_ms = 500

            [heartbeat]
            interval_ms = 100
            timeout_ms = 300

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::from_toml(toml_config);
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
        assert_eq!(config.max_conn, 2);
        assert_eq!(config.max_package_size, 4096);
        assert_eq!(config.worker_pool.queue_size, 1);
        assert_eq!(config.worker_pool.idle_timeout, Duration::from_millis(500));
        assert_eq!(config.heartbeat.interval, Duration::from_millis(100));
        assert_eq!(config.log_level, "debug");
        assert!(config.worker_pool.enabled);
    }

    #[test]
    fn test_cli_overrides_file_defaults() {
        let cli = CliArgs::parse_from([
            "relaywire",
            "--port",
            "7000",
            "--max-conn",
            "5",
            "--core-workers",
            "1",
            "--max-workers",
            "2",
            "--log-level",
            "warn",
        ]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.max_conn, 5);
        assert_eq!(config.worker_pool.core_workers, 1);
        assert_eq!(config.worker_pool.max_workers, 2);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_validate_rejects_inverted_pool_bounds() {
        let mut config = Config::default();
        config.worker_pool.core_workers = 8;
        config.worker_pool.max_workers = 2;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // A disabled pool is not checked
        config.worker_pool.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_heartbeat() {
        let mut config = Config::default();
        config.heartbeat.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        config.heartbeat.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::parse_from(["relaywire", "--config", "/nonexistent/relaywire.toml"]);
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }
}
