/*!
 * Configuration management for GreenNet.
 *
 * Settings are layered: built-in defaults, then an optional TOML file, then
 * prefixed environment variables (`GREENNET__GATEWAY__GATEWAY_ID=...`).
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Gateway addressing
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Debounce windows for the assembled streams
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Correlated query settings
    #[serde(default)]
    pub query: QueryConfig,

    /// Broker connection used by the bundled MQTT transport
    #[serde(default)]
    pub mqtt: MqttConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (e.g. "info", "greennet_devices=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Gateway addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Topic root shared by every gateway on the broker
    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    /// Gateway identifier, the second topic level
    #[serde(default)]
    pub gateway_id: String,

    /// QoS used for subscriptions and publishes (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
}

/// Debounce windows, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Minimum wait before the first snapshot finalize
    #[serde(default = "default_initial_window_ms")]
    pub initial_window_ms: u64,

    /// Silence after the last snapshot fragment
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,

    /// Silence after the last telegram fragment of a device
    #[serde(default = "default_telegram_quiet_ms")]
    pub telegram_quiet_ms: u64,

    /// Silence after the last live-delta fragment of a device
    #[serde(default = "default_delta_quiet_ms")]
    pub delta_quiet_ms: u64,
}

/// Correlated query settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// How long to wait for a getAnswer
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
}

/// MQTT broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Prefix for the generated client identifier
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Optional username
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password
    #[serde(default)]
    pub password: Option<String>,

    /// Request channel capacity of the client
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_topic: default_base_topic(),
            gateway_id: String::new(),
            qos: default_qos(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            initial_window_ms: default_initial_window_ms(),
            quiet_period_ms: default_quiet_period_ms(),
            telegram_quiet_ms: default_telegram_quiet_ms(),
            delta_quiet_ms: default_delta_quiet_ms(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive_secs(),
            username: None,
            password: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl DiscoveryConfig {
    /// Initial snapshot window
    pub fn initial_window(&self) -> Duration {
        Duration::from_millis(self.initial_window_ms)
    }

    /// Snapshot quiet period
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    /// Telegram quiet period
    pub fn telegram_quiet(&self) -> Duration {
        Duration::from_millis(self.telegram_quiet_ms)
    }

    /// Live-delta quiet period
    pub fn delta_quiet(&self) -> Duration {
        Duration::from_millis(self.delta_quiet_ms)
    }
}

impl QueryConfig {
    /// Query timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Check invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.gateway.gateway_id.trim().is_empty() {
            return Err(Error::config("gateway.gateway_id must not be empty"));
        }
        if self.gateway.base_topic.contains(['+', '#']) {
            return Err(Error::config("gateway.base_topic must not contain wildcards"));
        }
        if self.gateway.qos > 2 {
            return Err(Error::config(format!(
                "gateway.qos must be 0, 1 or 2, got {}",
                self.gateway.qos
            )));
        }
        if self.mqtt.keep_alive_secs < 5 {
            return Err(Error::config("mqtt.keep_alive_secs must be at least 5"));
        }
        if self.discovery.quiet_period_ms > self.discovery.initial_window_ms {
            return Err(Error::config(
                "discovery.quiet_period_ms must not exceed discovery.initial_window_ms",
            ));
        }
        Ok(())
    }
}

fn default_app_name() -> String {
    "greennet".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_topic() -> String {
    "EnOcean".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_initial_window_ms() -> u64 {
    5000
}

fn default_quiet_period_ms() -> u64 {
    2000
}

fn default_telegram_quiet_ms() -> u64 {
    250
}

fn default_delta_quiet_ms() -> u64 {
    50
}

fn default_query_timeout_ms() -> u64 {
    10_000
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id_prefix() -> String {
    "greennet-".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    64
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration. Validation is left to the caller since a
    /// partially filled config is still useful for tooling.
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            return Ok(config);
        }

        let mut builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&Config::default())
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!("Loading configuration from {}", config_file);
                builder = builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
