//! Application configuration.
//!
//! Sources, lowest priority first:
//!
//! 1. built-in defaults (the constants in [`crate::constants`])
//! 2. the optional file `config/keycreator.{toml,yaml,json}`
//! 3. environment variables such as `KEYCREATOR_READER__PORT=/dev/ttyACM1`

use crate::constants::{
    DEFAULT_BAUD_RATE, DEFAULT_MAINTENANCE_GRACE_MS, DEFAULT_MAX_REPLY_LEN,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_READ_TIMEOUT_MS, DETECTION_STABILITY_THRESHOLD,
};
use config::{Config as ConfigLib, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_PORT: &str = "/dev/ttyACM0";
const DEFAULT_ERP_URL: &str = "http://localhost:8000/api/method/keycreator.api";
const DEFAULT_ERP_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub erp: ErpConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Serial link to the reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub max_reply_len: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            max_reply_len: DEFAULT_MAX_REPLY_LEN,
        }
    }
}

impl ReaderConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// ERP backend holding configurations and transponder records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErpConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for ErpConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ERP_URL.to_string(),
            timeout_ms: DEFAULT_ERP_TIMEOUT_MS,
        }
    }
}

impl ErpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Provisioning session tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Customer whose transponder configuration is loaded.
    pub customer: Option<String>,
    /// First serial number (six digits). Defaults to the bottom of the window.
    pub start_number: Option<String>,
    /// Mark created ERP records as test keys.
    pub test_key: bool,
    pub maintenance_grace_ms: u64,
    pub stability_threshold: u8,
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            customer: None,
            start_number: None,
            test_key: false,
            maintenance_grace_ms: DEFAULT_MAINTENANCE_GRACE_MS,
            stability_threshold: DETECTION_STABILITY_THRESHOLD,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl SessionConfig {
    pub fn maintenance_grace(&self) -> Duration {
        Duration::from_millis(self.maintenance_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl AppConfig {
    /// Load from the config file and the process environment.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` when a source is malformed or a value has the
    /// wrong type.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    /// Load with an explicit override map instead of the process environment.
    ///
    /// Keys use dotted paths (`reader.port`). Passing a map keeps tests
    /// independent of the environment they run in.
    pub fn load_with_sources(env_vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let reader = ReaderConfig::default();
        let erp = ErpConfig::default();
        let session = SessionConfig::default();

        let mut builder = ConfigLib::builder()
            .set_default("reader.port", reader.port)?
            .set_default("reader.baud_rate", i64::from(reader.baud_rate))?
            .set_default("reader.read_timeout_ms", reader.read_timeout_ms)?
            .set_default("reader.max_reply_len", reader.max_reply_len as u64)?
            .set_default("erp.base_url", erp.base_url)?
            .set_default("erp.timeout_ms", erp.timeout_ms)?
            .set_default("session.test_key", session.test_key)?
            .set_default("session.maintenance_grace_ms", session.maintenance_grace_ms)?
            .set_default("session.stability_threshold", i64::from(session.stability_threshold))?
            .set_default("session.poll_interval_ms", session.poll_interval_ms)?
            .add_source(File::with_name("config/keycreator").required(false));

        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // KEYCREATOR_SESSION__CUSTOMER, KEYCREATOR_READER__BAUD_RATE, ...
            builder = builder.add_source(
                Environment::with_prefix("KEYCREATOR")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }
}
