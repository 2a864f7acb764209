//! Configuration for the gateway core.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite path, optionally prefixed with `sqlite:`; `:memory:` for a private database.
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnginesConfig {
    #[serde(default = "default_ollama")]
    pub ollama: Option<EngineConfig>,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            ollama: default_ollama(),
        }
    }
}

/// Settings of one local model engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    /// Engine binary. Empty means "look it up on PATH".
    #[serde(default)]
    pub exec_path: String,
    /// Where the engine stores downloaded models. Engine default when unset.
    #[serde(default)]
    pub models_dir: Option<String>,
    /// Health polls after starting the engine before giving up (default: 60).
    #[serde(default = "default_startup_poll_attempts")]
    pub startup_poll_attempts: u32,
    #[serde(default = "default_startup_poll_interval_ms")]
    pub startup_poll_interval_ms: u64,
    /// Grace period for the engine process on stop (default: 10).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_ollama_url(),
            exec_path: String::new(),
            models_dir: None,
            startup_poll_attempts: default_startup_poll_attempts(),
            startup_poll_interval_ms: default_startup_poll_interval_ms(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl EngineConfig {
    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_poll_interval_ms)
    }
}

/// Provider verification probes.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    #[serde(default = "default_verify_timeout")]
    pub timeout_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_verify_timeout(),
        }
    }
}

/// Periodic re-verification of inactive providers.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between sweeps; 0 disables the monitor.
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default values
fn default_database_path() -> String {
    "./data/aigc.db".to_string()
}
fn default_ollama() -> Option<EngineConfig> {
    Some(EngineConfig::default())
}
fn default_true() -> bool {
    true
}
fn default_ollama_url() -> String {
    "http://127.0.0.1:16677".to_string()
}
fn default_startup_poll_attempts() -> u32 {
    60
}
fn default_startup_poll_interval_ms() -> u64 {
    1000
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_verify_timeout() -> u64 {
    30
}
fn default_monitor_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from `config.toml` (optional) and `AIGC__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from the named file (any format `config` understands, extension optional).
    pub fn load_from(name: &str) -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("database.path", default_database_path())?
            .set_default("verify.timeout_secs", default_verify_timeout())?
            .set_default("monitor.interval_secs", default_monitor_interval())?
            .set_default("logging.level", default_log_level())?
            .add_source(File::with_name(name).required(false))
            .add_source(
                Environment::with_prefix("AIGC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
