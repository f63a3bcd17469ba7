//! Configuration file parser for `~/.config/feedsync/config.toml`.
//!
//! The config file is optional: a missing or empty file yields
//! `Config::default()`. Unknown keys are accepted and logged as warnings,
//! since they are usually typos.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// Parsed fine but a value is out of range.
    #[error("Invalid config value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Daemon configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file, or `:memory:`
    pub database_path: String,

    /// Seconds between scheduler ticks.
    pub tick_interval_secs: u64,

    /// Maximum number of feeds claimed per tick.
    pub batch_size: u32,

    /// Seconds a feed waits after a refresh before it is due again.
    pub cooldown_secs: u64,

    /// Entries older than this many days are pruned.
    pub retention_days: u32,

    /// Seconds a claim stays valid. An orphaned claim becomes claimable
    /// again once it expires.
    pub lease_secs: u64,

    /// Timeout for one feed request, body included.
    pub fetch_timeout_secs: u64,

    /// Largest accepted feed document, in bytes.
    pub max_feed_bytes: usize,

    pub user_agent: String,

    /// Permit feed URLs on localhost and private networks.
    pub allow_private_hosts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "feedsync.db".to_string(),
            tick_interval_secs: 300,
            batch_size: 5,
            cooldown_secs: 600,
            retention_days: 30,
            lease_secs: 900,
            fetch_timeout_secs: 30,
            max_feed_bytes: 10 * 1024 * 1024,
            user_agent: format!("feedsync/{}", env!("CARGO_PKG_VERSION")),
            allow_private_hosts: false,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 10] = [
        "database_path",
        "tick_interval_secs",
        "batch_size",
        "cooldown_secs",
        "retention_days",
        "lease_secs",
        "fetch_timeout_secs",
        "max_feed_bytes",
        "user_agent",
        "allow_private_hosts",
    ];

    /// Load and validate configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            database = %config.database_path,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("tick_interval_secs", self.tick_interval_secs),
            ("batch_size", u64::from(self.batch_size)),
            ("cooldown_secs", self.cooldown_secs),
            ("retention_days", u64::from(self.retention_days)),
            ("lease_secs", self.lease_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("max_feed_bytes", self.max_feed_bytes as u64),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid {
                key: *key,
                reason: "must be greater than zero".into(),
            });
        }

        // A lease that can expire mid-fetch lets a second refresh start
        if self.lease_secs <= self.fetch_timeout_secs {
            return Err(ConfigError::Invalid {
                key: "lease_secs",
                reason: format!(
                    "must exceed fetch_timeout_secs ({})",
                    self.fetch_timeout_secs
                ),
            });
        }

        if self.database_path.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "database_path",
                reason: "must not be empty".into(),
            });
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================
