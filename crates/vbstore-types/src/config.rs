//! Engine configuration.
//!
//! All sections deserialize with defaults, so an empty JSON object is a valid
//! configuration.  Call [`EngineConfig::validate`] before handing a
//! configuration to the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default value of [`TapConfig::backfill_resident_threshold`].
pub const fn default_backfill_resident_threshold() -> f64 {
    0.9
}

/// Default value of [`TapConfig::backfill_backlog_limit`].
pub const fn default_backfill_backlog_limit() -> i64 {
    5000
}

/// Default value of [`TapConfig::backfill_mem_threshold`].
pub const fn default_backfill_mem_threshold() -> f64 {
    0.95
}

/// Default size of a per-vbucket write batch, used when
/// `max_txn_size / vbucket_batch_count` rounds down to zero.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Failed to parse the configuration document.
    #[error("failed to parse engine configuration: {error}")]
    Parse { error: String },

    /// A parameter is out of range.
    #[error("invalid value {value} for '{name}': {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl ConfigError {
    fn invalid(name: &'static str, value: impl ToString, reason: &'static str) -> Self {
        Self::InvalidValue {
            name,
            value: value.to_string(),
            reason,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Replication stream (TAP) and backfill settings.
    pub tap: TapConfig,

    /// Backing store settings.
    pub store: StoreConfig,

    /// Checkpoint manager settings.
    pub checkpoint: CheckpointConfig,
}

impl EngineConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tap.validate()?;
        self.store.validate()?;
        self.checkpoint.validate()
    }
}

/// How the in-memory backfill walk treats non-resident items of vbuckets that
/// are not scheduled for a disk pass.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonResidentPolicy {
    /// Non-resident items are left out of the in-memory walk.  The consumer
    /// relies on a separate disk seeding step for them.
    #[default]
    Omit,

    /// Non-resident items are emitted as key-only records, like resident
    /// ones, so the consumer side fetches their values.
    FetchLater,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    /// A vbucket whose resident ratio is below this fraction is backfilled
    /// from disk when the backing store supports efficient vbucket dumps.
    pub backfill_resident_threshold: f64,

    /// The backfill walk pauses while a connection's outgoing queue holds more
    /// than this many items.
    pub backfill_backlog_limit: i64,

    /// Backfill work is deferred while memory usage exceeds this fraction of
    /// `StoreConfig::max_data_size`.
    pub backfill_mem_threshold: f64,

    /// Delay before a deferred disk backfill task or paused walk retries.
    pub bg_fetch_delay_secs: u64,

    /// Treatment of non-resident items on the in-memory path.
    pub backfill_non_resident: NonResidentPolicy,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            backfill_resident_threshold: default_backfill_resident_threshold(),
            backfill_backlog_limit: default_backfill_backlog_limit(),
            backfill_mem_threshold: default_backfill_mem_threshold(),
            bg_fetch_delay_secs: 1,
            backfill_non_resident: NonResidentPolicy::default(),
        }
    }
}

impl TapConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.backfill_resident_threshold) {
            return Err(ConfigError::invalid(
                "backfill_resident_threshold",
                self.backfill_resident_threshold,
                "must be between 0 and 1",
            ));
        }
        if self.backfill_mem_threshold <= 0.0 || self.backfill_mem_threshold > 1.0 {
            return Err(ConfigError::invalid(
                "backfill_mem_threshold",
                self.backfill_mem_threshold,
                "must be greater than 0 and at most 1",
            ));
        }
        if self.backfill_backlog_limit < 0 {
            return Err(ConfigError::invalid(
                "backfill_backlog_limit",
                self.backfill_backlog_limit,
                "must not be negative",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of mutations committed in one backing store
    /// transaction.
    pub max_txn_size: usize,

    /// Number of write batches each vbucket's share of a transaction is split
    /// into.
    pub vbucket_batch_count: usize,

    /// Batch size used when `max_txn_size / vbucket_batch_count` is zero.
    pub default_batch_size: usize,

    /// Memory quota for item data, in bytes.  Zero means unlimited.
    pub max_data_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_txn_size: 250_000,
            vbucket_batch_count: 4,
            default_batch_size: DEFAULT_BATCH_SIZE,
            max_data_size: 0,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vbucket_batch_count == 0 {
            return Err(ConfigError::invalid(
                "vbucket_batch_count",
                self.vbucket_batch_count,
                "must be positive",
            ));
        }
        if self.default_batch_size == 0 {
            return Err(ConfigError::invalid(
                "default_batch_size",
                self.default_batch_size,
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// The open checkpoint is closed once it holds this many items.
    pub max_items: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { max_items: 500 }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_items == 0 {
            return Err(ConfigError::invalid(
                "checkpoint.max_items",
                self.max_items,
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{ConfigError, EngineConfig, NonResidentPolicy};
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.tap.backfill_non_resident, NonResidentPolicy::Omit);
    }

    #[test]
    fn partial_document() {
        let config = EngineConfig::from_json(
            r#"{"tap": {"backfill_resident_threshold": 0.8, "backfill_non_resident": "fetch_later"},
                "store": {"max_txn_size": 10, "vbucket_batch_count": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.tap.backfill_resident_threshold, 0.8);
        assert_eq!(
            config.tap.backfill_non_resident,
            NonResidentPolicy::FetchLater
        );
        assert_eq!(config.tap.backfill_backlog_limit, 5000);
        assert_eq!(config.store.max_txn_size, 10);
        assert_eq!(config.store.vbucket_batch_count, 5);
    }

    #[test]
    fn invalid_values() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"store": {"vbucket_batch_count": 0}}"#),
            Err(ConfigError::InvalidValue {
                name: "vbucket_batch_count",
                ..
            })
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"tap": {"backfill_mem_threshold": 1.5}}"#),
            Err(ConfigError::InvalidValue {
                name: "backfill_mem_threshold",
                ..
            })
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"tap": 7}"#),
            Err(ConfigError::Parse { .. })
        ));
    }
}
