//! Configuration management for the relay forwarder.

use std::{env, path::Path, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use relay_broker::{AmqpSettings, QueueTopology};
use relay_core::{ApiTarget, SecretCipher};
use relay_delivery::{client::USER_AGENT, ClientConfig, RetryLadder, WakeSettings};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CONFIG_FILE: &str = "relay.toml";
const CONFIG_PATH_VAR: &str = "RELAY_CONFIG";
const ENV_PREFIX: &str = "RELAY_";
const CONNECTION_NAME: &str = "relay-forwarder";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed `RELAY_`, with `__` separating the
///    section from the key (`RELAY_BROKER__HOST`)
/// 2. Configuration file (`relay.toml`, or the path in `RELAY_CONFIG`)
/// 3. Built-in defaults
///
/// Secrets (`broker.password`, `codespace.codespace_name`,
/// `codespace.token`) may be given in plaintext or as output of
/// `relay encrypt`; encrypted values are decrypted with
/// `secret_passphrase` when used.
///
/// # Example
///
/// ```no_run
/// use relay_service::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Forwarding {} to {}", config.broker.queue_name, config.api_target());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection and primary queue.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Retry ladder, debounce and outbound request settings.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// REST backend selection.
    #[serde(default)]
    pub api: ApiConfig,
    /// Wake-up call for a suspended Codespace backend.
    #[serde(default)]
    pub codespace: CodespaceConfig,
    /// Passphrase for encrypted secrets.
    #[serde(default = "default_passphrase")]
    pub secret_passphrase: String,
    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_guest")]
    pub username: String,
    /// Plaintext or encrypted.
    #[serde(default = "default_guest")]
    pub password: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    /// Primary queue; the retry and failed queues derive their names from it.
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    /// Pause between a lost session and the next connection attempt.
    #[serde(default = "default_recovery_interval")]
    pub network_recovery_interval_seconds: u64,
}

/// Delivery behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Attempts before a message is parked in the failed queue.
    #[serde(default = "default_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Time a message spends in the retry queue.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    /// Coalescing window for volume change events.
    #[serde(default = "default_debounce_window")]
    pub debounce_window_ms: u64,
    /// Timeout for each forwarded request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

/// Backend base URLs and the selector picking one of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// One of `Azure`, `Local`, `Codespace`. Anything else falls back to
    /// `Azure`.
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default)]
    pub azure: String,
    #[serde(default)]
    pub local: String,
    #[serde(default)]
    pub codespace: String,
}

/// GitHub Codespace wake-up settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodespaceConfig {
    /// Start endpoint; `{codespace}` is replaced with the codespace name.
    #[serde(default)]
    pub start_url: String,
    /// Plaintext or encrypted.
    #[serde(default)]
    pub codespace_name: String,
    /// Plaintext or encrypted.
    #[serde(default)]
    pub token: String,
    /// Wake request timeout, also the cooldown before another wake.
    #[serde(default = "default_wake_timeout")]
    pub timeout_seconds: u64,
}

impl Config {
    /// Load configuration from defaults, the configuration file and the
    /// environment.
    ///
    /// The file is `relay.toml` in the working directory unless
    /// `RELAY_CONFIG` names another path. A missing file is not an error.
    pub fn load() -> Result<Self> {
        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| CONFIG_FILE.to_string());
        Self::load_from(path)
    }

    /// Load configuration using the given file instead of `relay.toml`.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the configured backend.
    ///
    /// An unknown selector logs a warning and selects `Azure`.
    pub fn api_target(&self) -> ApiTarget {
        match self.api.target.as_str() {
            "Azure" => ApiTarget::Azure { base_url: self.api.azure.clone() },
            "Local" => ApiTarget::Local { base_url: self.api.local.clone() },
            "Codespace" => ApiTarget::Codespace { base_url: self.api.codespace.clone() },
            unknown => {
                warn!(
                    target_name = unknown,
                    valid = ?ApiTarget::NAMES,
                    default = ApiTarget::DEFAULT_NAME,
                    "unknown API target, using default"
                );
                ApiTarget::Azure { base_url: self.api.azure.clone() }
            },
        }
    }

    /// Convert to broker connection settings, decrypting the password.
    pub fn to_amqp_settings(&self) -> AmqpSettings {
        let password =
            SecretCipher::new().decrypt_or_original(&self.broker.password, &self.secret_passphrase);

        AmqpSettings {
            host: self.broker.host.clone(),
            port: self.broker.port,
            username: self.broker.username.clone(),
            password,
            virtual_host: self.broker.virtual_host.clone(),
            connection_name: CONNECTION_NAME.to_string(),
        }
    }

    /// Convert to the queue topology.
    pub fn to_queue_topology(&self) -> QueueTopology {
        QueueTopology::new(
            self.broker.queue_name.clone(),
            Duration::from_secs(self.delivery.retry_delay_seconds),
        )
    }

    /// Convert to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery.request_timeout_seconds),
            user_agent: USER_AGENT.to_string(),
        }
    }

    /// Convert to the attempt ladder.
    pub fn to_retry_ladder(&self) -> RetryLadder {
        RetryLadder::new(self.delivery.max_retry_attempts)
    }

    /// Convert to wake-up settings. `None` when no start URL is configured.
    pub fn to_wake_settings(&self) -> Option<WakeSettings> {
        if self.codespace.start_url.trim().is_empty() {
            return None;
        }

        let timeout = Duration::from_secs(self.codespace.timeout_seconds);
        Some(WakeSettings {
            start_url: self.codespace.start_url.clone(),
            name: self.codespace.codespace_name.clone(),
            token: self.codespace.token.clone(),
            passphrase: self.secret_passphrase.clone(),
            cooldown: timeout,
            request_timeout: timeout,
        })
    }

    /// Coalescing window for volume change events.
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.delivery.debounce_window_ms)
    }

    /// Pause between a lost session and the next connection attempt.
    pub fn network_recovery_interval(&self) -> Duration {
        Duration::from_secs(self.broker.network_recovery_interval_seconds)
    }

    /// Get the broker endpoint with the password masked for logging.
    pub fn broker_endpoint_masked(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}{}",
            self.broker.username,
            self.broker.host,
            self.broker.port,
            if self.broker.virtual_host.starts_with('/') {
                self.broker.virtual_host.clone()
            } else {
                format!("/{}", self.broker.virtual_host)
            }
        )
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.broker.port == 0 {
            anyhow::bail!("broker port must be greater than 0");
        }

        if self.broker.queue_name.trim().is_empty() {
            anyhow::bail!("broker queue_name must not be empty");
        }

        if self.broker.network_recovery_interval_seconds == 0 {
            anyhow::bail!("network_recovery_interval_seconds must be greater than 0");
        }

        if self.delivery.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts must be greater than 0");
        }

        let retry_delay_ms = self.delivery.retry_delay_seconds.saturating_mul(1_000);
        if retry_delay_ms > i32::MAX as u64 {
            anyhow::bail!(
                "retry_delay_seconds must be at most {} to fit the queue message TTL",
                i32::MAX as u64 / 1_000
            );
        }

        let target = self.api_target();
        if target.base_url().trim().is_empty() {
            anyhow::bail!("base URL for API target {target} must not be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            delivery: DeliveryConfig::default(),
            api: ApiConfig::default(),
            codespace: CodespaceConfig::default(),
            secret_passphrase: default_passphrase(),
            rust_log: default_log_level(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_guest(),
            password: default_guest(),
            virtual_host: default_virtual_host(),
            queue_name: default_queue_name(),
            network_recovery_interval_seconds: default_recovery_interval(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_retry_attempts(),
            retry_delay_seconds: default_retry_delay(),
            debounce_window_ms: default_debounce_window(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            azure: String::new(),
            local: String::new(),
            codespace: String::new(),
        }
    }
}

impl Default for CodespaceConfig {
    fn default() -> Self {
        Self {
            start_url: String::new(),
            codespace_name: String::new(),
            token: String::new(),
            timeout_seconds: default_wake_timeout(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_guest() -> String {
    "guest".to_string()
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_queue_name() -> String {
    "sdr_queue".to_string()
}

fn default_recovery_interval() -> u64 {
    3
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    10
}

fn default_debounce_window() -> u64 {
    400
}

fn default_request_timeout() -> u64 {
    30
}

fn default_target() -> String {
    ApiTarget::DEFAULT_NAME.to_string()
}

fn default_wake_timeout() -> u64 {
    30
}

fn default_passphrase() -> String {
    "my.shortest.password".to_string()
}

fn default_log_level() -> String {
    "info,relay=debug".to_string()
}
