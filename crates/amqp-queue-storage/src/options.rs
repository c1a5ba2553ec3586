//! Connection and queue options for the AMQP queue storage.
//!
//! Options are read from the `Amqp` configuration section. Key names follow
//! the PascalCase convention of the existing deployment files (`Host`,
//! `MaxPriority`, `LinkCredit`, ...). When `CredentialsPath` points at a JSON
//! file, that file is layered on top of the other sources and the section is
//! read again, so user and password can be mounted separately from the rest of
//! the configuration.
//!
//! Validation is fail-fast: [`QueueOptions::validate`] is called by every
//! storage constructor and rejects the first missing or out-of-range field.

use crate::error::ConfigurationError;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, FileFormat};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[cfg(test)]
#[path = "options_tests.rs"]
mod tests;

/// Name of the configuration section holding the queue options
pub const SETTING_SECTION: &str = "Amqp";

/// Default number of messages the broker may push ahead of consumption
pub const DEFAULT_LINK_CREDIT: u32 = 2;

/// Default wait of a single receive attempt
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Default wait after the first failed connection attempt
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Default cap on the wait between connection attempts
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 16_000;

// ============================================================================
// Secret
// ============================================================================

/// Password holder that is wiped from memory on drop.
///
/// Never printed by `Debug`; use [`Secret::expose_secret`] at the point of use.
#[derive(Clone, Default, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get secret as string (only for immediate use)
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("length", &self.0.len())
            .field("value", &"[REDACTED]")
            .finish()
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// Scheme
// ============================================================================

/// Transport scheme used to reach the broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum AmqpScheme {
    #[default]
    #[serde(rename = "AMQP", alias = "amqp", alias = "Amqp")]
    Amqp,
    #[serde(rename = "AMQPS", alias = "amqps", alias = "Amqps")]
    Amqps,
}

impl AmqpScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amqp => "amqp",
            Self::Amqps => "amqps",
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Amqps)
    }
}

// ============================================================================
// QueueOptions
// ============================================================================

/// Options for the AMQP queue storage.
///
/// Every field has a default so partially specified sources deserialize; the
/// defaults for required fields are deliberately invalid and rejected by
/// [`QueueOptions::validate`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QueueOptions {
    #[serde(alias = "host")]
    pub host: String,

    #[serde(alias = "port")]
    pub port: u16,

    #[serde(alias = "user")]
    pub user: String,

    #[serde(alias = "password")]
    pub password: Secret,

    /// JSON file layered over the other sources, usually holding `User`/`Password`
    #[serde(alias = "credentialspath")]
    pub credentials_path: Option<PathBuf>,

    /// PEM bundle of the broker's certificate authority
    #[serde(alias = "capath")]
    pub ca_path: Option<PathBuf>,

    #[serde(alias = "scheme")]
    pub scheme: AmqpScheme,

    #[serde(alias = "allowhostmismatch")]
    pub allow_host_mismatch: bool,

    /// Connection attempts made by `init` before giving up
    #[serde(alias = "maxretries")]
    pub max_retries: u32,

    #[serde(alias = "maxpriority")]
    pub max_priority: u32,

    #[serde(alias = "linkcredit")]
    pub link_credit: u32,

    /// Partition consumed by the pull storage; push takes it per call
    #[serde(alias = "partitionid")]
    pub partition_id: String,

    /// Advisory number of idle sessions kept for push calls
    #[serde(alias = "sessionpoolsize")]
    pub session_pool_size: usize,

    #[serde(alias = "polltimeoutms")]
    pub poll_timeout_ms: u64,

    /// Wait after the first failed connection attempt, doubled after each further one
    #[serde(alias = "retrydelayms")]
    pub retry_delay_ms: u64,

    #[serde(alias = "retrymaxdelayms")]
    pub retry_max_delay_ms: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            user: String::new(),
            password: Secret::default(),
            credentials_path: None,
            ca_path: None,
            scheme: AmqpScheme::Amqp,
            allow_host_mismatch: false,
            max_retries: 0,
            max_priority: 0,
            link_credit: DEFAULT_LINK_CREDIT,
            partition_id: String::new(),
            session_pool_size: default_session_pool_size(),
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

fn default_session_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

impl QueueOptions {
    /// Load options from the `Amqp` section of the given sources.
    ///
    /// When the section names a `CredentialsPath`, the JSON file is added as
    /// the last (highest precedence) source and the section is read again.
    pub fn load(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigurationError> {
        let options = Self::from_config(&builder.clone().build()?)?;

        match options.credentials_path.as_deref() {
            Some(path) if !path.as_os_str().is_empty() => {
                let config = builder
                    .add_source(
                        config::File::from(path)
                            .format(FileFormat::Json)
                            .required(true),
                    )
                    .build()?;
                debug!(path = %path.display(), "Loaded amqp credentials from file");
                Self::from_config(&config)
            }
            _ => {
                trace!("No credential path provided");
                Ok(options)
            }
        }
    }

    /// Load options from `Amqp__*` environment variables, e.g. `Amqp__Host`.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::load(
            Config::builder().add_source(
                Environment::with_prefix(SETTING_SECTION)
                    .prefix_separator("__")
                    .separator("__")
                    .keep_prefix(true)
                    .try_parsing(true),
            ),
        )
    }

    fn from_config(config: &Config) -> Result<Self, ConfigurationError> {
        // Some sources lower-case their keys, so accept both spellings of the section
        match config.get::<Self>(SETTING_SECTION) {
            Err(ConfigError::NotFound(key)) if key == SETTING_SECTION => {
                config.get::<Self>(&SETTING_SECTION.to_lowercase())
            }
            result => result,
        }
        .map_err(ConfigurationError::from)
    }

    /// Check every option shared by the push and pull storages.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.host.is_empty() {
            return Err(ConfigurationError::missing("Host"));
        }

        if self.user.is_empty() {
            return Err(ConfigurationError::missing("User"));
        }

        if self.password.is_empty() {
            return Err(ConfigurationError::missing("Password"));
        }

        if self.port == 0 {
            return Err(ConfigurationError::missing("Port"));
        }

        if self.max_retries == 0 {
            return Err(ConfigurationError::missing("MaxRetries"));
        }

        if self.max_priority < 1 {
            return Err(ConfigurationError::below_minimum("MaxPriority", 1));
        }

        if self.link_credit < 1 {
            return Err(ConfigurationError::below_minimum("LinkCredit", 1));
        }

        if self.session_pool_size < 1 {
            return Err(ConfigurationError::below_minimum("SessionPoolSize", 1));
        }

        if self.poll_timeout_ms < 1 {
            return Err(ConfigurationError::below_minimum("PollTimeoutMs", 1));
        }

        if self.retry_delay_ms < 1 {
            return Err(ConfigurationError::below_minimum("RetryDelayMs", 1));
        }

        Ok(())
    }

    /// Additional check for consumers, which are bound to one partition.
    pub fn validate_partition(&self) -> Result<(), ConfigurationError> {
        if self.partition_id.is_empty() {
            return Err(ConfigurationError::missing("PartitionId"));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Broker address derived from these options
    pub fn address(&self) -> AmqpAddress {
        AmqpAddress {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            scheme: self.scheme,
            ca_path: self.ca_path.clone(),
            allow_host_mismatch: self.allow_host_mismatch,
        }
    }
}

// ============================================================================
// AmqpAddress
// ============================================================================

/// Everything a connector needs to reach the broker.
///
/// `Display` omits the credentials so addresses can be logged.
#[derive(Debug, Clone)]
pub struct AmqpAddress {
    host: String,
    port: u16,
    user: String,
    password: Secret,
    scheme: AmqpScheme,
    ca_path: Option<PathBuf>,
    allow_host_mismatch: bool,
}

impl AmqpAddress {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &Secret {
        &self.password
    }

    pub fn scheme(&self) -> AmqpScheme {
        self.scheme
    }

    pub fn ca_path(&self) -> Option<&PathBuf> {
        self.ca_path.as_ref()
    }

    pub fn allow_host_mismatch(&self) -> bool {
        self.allow_host_mismatch
    }

    /// URL without credentials, e.g. `amqps://broker:5671/`
    pub fn url(&self) -> String {
        format!("{}://{}:{}/", self.scheme.as_str(), self.host, self.port)
    }
}

impl fmt::Display for AmqpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}
