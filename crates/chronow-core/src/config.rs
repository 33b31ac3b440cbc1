//! Broker configuration.
//!
//! Configuration can be built programmatically (struct literal plus the
//! with-style helpers) or loaded from the process environment via
//! [`ChronowConfig::from_env`]. Recognized variables, defaults in brackets:
//!
//! | Variable | Effect |
//! |---|---|
//! | `CHRONOW_PORTABLE_ONLY` | `"true"` selects the portable (document emulation) hot backend |
//! | `CHRONOW_HOT_DB` | Portable-backend database URL; required with the portable backend |
//! | `CHRONOW_WARM_DB` | Warm-store database URL; always required (`none` selects the stub) |
//! | `CHRONOW_KEY_PREFIX` [`cw:`] | Hot-key prefix |
//! | `CHRONOW_VISIBILITY_TIMEOUT_MS` [30000] | Default subscription visibility timeout |
//! | `CHRONOW_MAX_STREAM_LEN` [100000] | Default log soft-trim bound |
//! | `CHRONOW_MAX_PAYLOAD_BYTES` [262144] | Producer payload limit |
//! | `CHRONOW_RETRY_BACKOFF_MS` [`1000,5000,15000`] | Default retry backoff ladder |
//! | `CHRONOW_CONNECT_TIMEOUT_MS` [10000] | Store initialisation deadline |

use crate::error::{CoreError, Result};
use crate::keys::DEFAULT_KEY_PREFIX;

pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_STREAM_LEN: u64 = 100_000;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 262_144;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RETRY_BACKOFF_MS: [u64; 3] = [1_000, 5_000, 15_000];

/// Which hot-tier implementation backs the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotBackend {
    /// In-process streaming-log engine. Fast path; state lives with the
    /// process.
    Native,
    /// Document-database emulation over SQLite. Portable path; state
    /// survives restarts and can be shared between processes on one host.
    Portable,
}

/// Top-level broker configuration.
#[derive(Debug, Clone)]
pub struct ChronowConfig {
    pub hot_backend: HotBackend,
    /// Database URL for the portable hot backend.
    pub hot_db_url: Option<String>,
    /// Database URL for the warm store, or `"none"` for the stub adapter.
    pub warm_db_url: Option<String>,
    pub key_prefix: String,
    pub visibility_timeout_ms: u64,
    pub max_stream_len: u64,
    pub max_payload_bytes: usize,
    pub retry_backoff_ms: Vec<u64>,
    pub connect_timeout_ms: u64,
}

impl Default for ChronowConfig {
    fn default() -> Self {
        Self {
            hot_backend: HotBackend::Native,
            hot_db_url: None,
            warm_db_url: Some("none".to_string()),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            max_stream_len: DEFAULT_MAX_STREAM_LEN,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS.to_vec(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ChronowConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` when the portable backend is selected without a hot
    /// database URL, when no warm-store URL is present, or when a numeric
    /// variable fails to parse.
    pub fn from_env() -> Result<Self> {
        let portable = matches!(
            std::env::var("CHRONOW_PORTABLE_ONLY").as_deref(),
            Ok("true") | Ok("TRUE") | Ok("1")
        );

        let config = Self {
            hot_backend: if portable {
                HotBackend::Portable
            } else {
                HotBackend::Native
            },
            hot_db_url: std::env::var("CHRONOW_HOT_DB").ok(),
            warm_db_url: std::env::var("CHRONOW_WARM_DB").ok(),
            key_prefix: std::env::var("CHRONOW_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string()),
            visibility_timeout_ms: parse_var(
                "CHRONOW_VISIBILITY_TIMEOUT_MS",
                DEFAULT_VISIBILITY_TIMEOUT_MS,
            )?,
            max_stream_len: parse_var("CHRONOW_MAX_STREAM_LEN", DEFAULT_MAX_STREAM_LEN)?,
            max_payload_bytes: parse_var("CHRONOW_MAX_PAYLOAD_BYTES", DEFAULT_MAX_PAYLOAD_BYTES)?,
            retry_backoff_ms: parse_backoff_var("CHRONOW_RETRY_BACKOFF_MS")?,
            connect_timeout_ms: parse_var("CHRONOW_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field requirements. Called by `from_env`; programmatic
    /// configurations are validated again at connect time.
    pub fn validate(&self) -> Result<()> {
        if self.hot_backend == HotBackend::Portable && self.hot_db_url.is_none() {
            return Err(CoreError::ConfigInvalid(
                "portable hot backend selected but CHRONOW_HOT_DB is not set".to_string(),
            ));
        }
        if self.warm_db_url.is_none() {
            return Err(CoreError::ConfigInvalid(
                "CHRONOW_WARM_DB is required (use \"none\" to disable warm persistence)"
                    .to_string(),
            ));
        }
        if self.retry_backoff_ms.is_empty() {
            return Err(CoreError::ConfigInvalid(
                "retry backoff ladder must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_warm_db(mut self, url: impl Into<String>) -> Self {
        self.warm_db_url = Some(url.into());
        self
    }

    pub fn with_portable_backend(mut self, url: impl Into<String>) -> Self {
        self.hot_backend = HotBackend::Portable;
        self.hot_db_url = Some(url.into());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| CoreError::ConfigInvalid(format!("{name} is not a valid number: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn parse_backoff_var(name: &str) -> Result<Vec<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .split(',')
            .map(|part| {
                part.trim().parse::<u64>().map_err(|_| {
                    CoreError::ConfigInvalid(format!("{name} has a non-numeric entry: {part}"))
                })
            })
            .collect(),
        Err(_) => Ok(DEFAULT_RETRY_BACKOFF_MS.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_native_with_stub_warm() {
        let config = ChronowConfig::default();
        assert_eq!(config.hot_backend, HotBackend::Native);
        assert_eq!(config.warm_db_url.as_deref(), Some("none"));
        assert_eq!(config.visibility_timeout_ms, 30_000);
        assert_eq!(config.max_stream_len, 100_000);
        assert_eq!(config.max_payload_bytes, 262_144);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn portable_backend_requires_hot_url() {
        let config = ChronowConfig {
            hot_backend: HotBackend::Portable,
            hot_db_url: None,
            ..ChronowConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::ConfigInvalid(_))
        ));

        let config = ChronowConfig::default().with_portable_backend("sqlite::memory:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn warm_store_is_always_required() {
        let config = ChronowConfig {
            warm_db_url: None,
            ..ChronowConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::ConfigInvalid(_))
        ));
    }

    // Environment-backed loading is covered in one test to avoid concurrent
    // mutation of shared process state.
    #[test]
    fn from_env_reads_and_validates() {
        std::env::set_var("CHRONOW_WARM_DB", "none");
        std::env::set_var("CHRONOW_MAX_STREAM_LEN", "500");
        std::env::set_var("CHRONOW_RETRY_BACKOFF_MS", "100, 200,400");
        let config = ChronowConfig::from_env().unwrap();
        assert_eq!(config.max_stream_len, 500);
        assert_eq!(config.retry_backoff_ms, vec![100, 200, 400]);

        std::env::set_var("CHRONOW_MAX_STREAM_LEN", "not-a-number");
        assert!(matches!(
            ChronowConfig::from_env(),
            Err(CoreError::ConfigInvalid(_))
        ));

        std::env::remove_var("CHRONOW_MAX_STREAM_LEN");
        std::env::remove_var("CHRONOW_RETRY_BACKOFF_MS");
        std::env::remove_var("CHRONOW_WARM_DB");
    }
}
