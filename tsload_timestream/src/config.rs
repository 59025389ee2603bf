//! Target settings and the retention bounds of the managed service.

use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};
use tsload_targets::backoff::BackoffConfig;

/// Longest memory store retention the service accepts: one year.
pub const MAX_MEMORY_RETENTION_HOURS: u64 = 8766;

/// Longest magnetic store retention the service accepts: 200 years.
pub const MAX_MAGNETIC_RETENTION_DAYS: u64 = 73000;

/// Errors in the target configuration, or in how it relates to an existing
/// target. None of them are retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no dimension named '{0}' found in data points")]
    UnknownHashProperty(String),

    #[error(
        "memory store retention of {0} hour(s) is out of range, must be within 1..={MAX_MEMORY_RETENTION_HOURS}"
    )]
    MemoryRetentionOutOfRange(u64),

    #[error(
        "magnetic store retention of {0} day(s) is out of range, must be within 1..={MAX_MAGNETIC_RETENTION_DAYS}"
    )]
    MagneticRetentionOutOfRange(u64),

    #[error(
        "table '{database}.{table}' already exists with retention {existing}, which differs from the requested {requested}"
    )]
    IncompatibleRetention {
        database: String,
        table: String,
        existing: RetentionProperties,
        requested: RetentionProperties,
    },
}

/// Retention windows of a table, fixed when the table is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionProperties {
    memory_store_retention_period_in_hours: u64,
    magnetic_store_retention_period_in_days: u64,
}

impl RetentionProperties {
    pub fn try_new(magnetic_days: u64, memory_hours: u64) -> Result<Self, ConfigError> {
        if !(1..=MAX_MEMORY_RETENTION_HOURS).contains(&memory_hours) {
            return Err(ConfigError::MemoryRetentionOutOfRange(memory_hours));
        }
        if !(1..=MAX_MAGNETIC_RETENTION_DAYS).contains(&magnetic_days) {
            return Err(ConfigError::MagneticRetentionOutOfRange(magnetic_days));
        }

        Ok(Self {
            memory_store_retention_period_in_hours: memory_hours,
            magnetic_store_retention_period_in_days: magnetic_days,
        })
    }

    pub fn memory_hours(&self) -> u64 {
        self.memory_store_retention_period_in_hours
    }

    pub fn magnetic_days(&self) -> u64 {
        self.magnetic_store_retention_period_in_days
    }
}

impl std::fmt::Display for RetentionProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(memory: {}h, magnetic: {}d)",
            self.memory_store_retention_period_in_hours, self.magnetic_store_retention_period_in_days
        )
    }
}

/// Settings of the Timestream target.
#[derive(Debug, Clone, clap::Parser, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct TimestreamConfig {
    /// The dimension (tag key) points are partitioned by
    #[clap(
        long = "hash-property",
        env = "TSLOAD_HASH_PROPERTY",
        default_value = "hostname"
    )]
    pub hash_property: String,

    /// Send one request per point with its dimensions as common attributes.
    ///
    /// When false every field value becomes a self-contained record.
    #[clap(
        long = "use-common-attributes",
        env = "TSLOAD_USE_COMMON_ATTRIBUTES",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub use_common_attributes: bool,

    /// Replace every point's timestamp with the time it was read
    #[clap(
        long = "use-current-time",
        env = "TSLOAD_USE_CURRENT_TIME",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub use_current_time: bool,

    /// Magnetic store retention of created tables, in days
    #[clap(
        long = "mag-store-retention-in-days",
        env = "TSLOAD_MAG_STORE_RETENTION_IN_DAYS",
        default_value_t = 180
    )]
    pub mag_store_retention_in_days: u64,

    /// Memory store retention of created tables, in hours
    #[clap(
        long = "mem-store-retention-in-hours",
        env = "TSLOAD_MEM_STORE_RETENTION_IN_HOURS",
        default_value_t = 12
    )]
    pub mem_store_retention_in_hours: u64,

    /// Attempts per write request, including the first one, for transient
    /// errors
    #[clap(
        long = "max-write-attempts",
        env = "TSLOAD_MAX_WRITE_ATTEMPTS",
        default_value = "5"
    )]
    pub max_write_attempts: NonZeroUsize,

    /// Initial backoff between write attempts
    #[clap(
        long = "write-backoff-init",
        env = "TSLOAD_WRITE_BACKOFF_INIT",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    #[serde(with = "humantime_serde")]
    pub write_backoff_init: Duration,

    /// Upper bound of the backoff between write attempts
    #[clap(
        long = "write-backoff-max",
        env = "TSLOAD_WRITE_BACKOFF_MAX",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    #[serde(with = "humantime_serde")]
    pub write_backoff_max: Duration,
}

impl Default for TimestreamConfig {
    fn default() -> Self {
        Self {
            hash_property: "hostname".to_owned(),
            use_common_attributes: true,
            use_current_time: false,
            mag_store_retention_in_days: 180,
            mem_store_retention_in_hours: 12,
            max_write_attempts: NonZeroUsize::new(5).expect("non-zero"),
            write_backoff_init: Duration::from_millis(100),
            write_backoff_max: Duration::from_secs(10),
        }
    }
}

impl TimestreamConfig {
    /// The validated retention of tables this target creates.
    pub fn retention(&self) -> Result<RetentionProperties, ConfigError> {
        RetentionProperties::try_new(
            self.mag_store_retention_in_days,
            self.mem_store_retention_in_hours,
        )
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            init_backoff: self.write_backoff_init,
            max_backoff: self.write_backoff_max,
            max_attempts: self.max_write_attempts,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_retention_bounds() {
        let r = RetentionProperties::try_new(7, 24).unwrap();
        assert_eq!(r.magnetic_days(), 7);
        assert_eq!(r.memory_hours(), 24);

        RetentionProperties::try_new(MAX_MAGNETIC_RETENTION_DAYS, MAX_MEMORY_RETENTION_HOURS)
            .unwrap();

        assert!(matches!(
            RetentionProperties::try_new(7, 0),
            Err(ConfigError::MemoryRetentionOutOfRange(0))
        ));
        assert!(matches!(
            RetentionProperties::try_new(7, 8767),
            Err(ConfigError::MemoryRetentionOutOfRange(8767))
        ));
        assert!(matches!(
            RetentionProperties::try_new(0, 12),
            Err(ConfigError::MagneticRetentionOutOfRange(0))
        ));
        assert!(matches!(
            RetentionProperties::try_new(73001, 12),
            Err(ConfigError::MagneticRetentionOutOfRange(73001))
        ));
    }

    #[test]
    fn test_cli_defaults_match_default() {
        let config = TimestreamConfig::try_parse_from(["tsload"]).unwrap();
        assert_eq!(config, TimestreamConfig::default());
    }

    #[test]
    fn test_cli_flags() {
        let config = TimestreamConfig::try_parse_from([
            "tsload",
            "--hash-property",
            "region",
            "--use-common-attributes",
            "false",
            "--mem-store-retention-in-hours",
            "24",
            "--write-backoff-max",
            "2s",
        ])
        .unwrap();

        assert_eq!(config.hash_property, "region");
        assert!(!config.use_common_attributes);
        assert_eq!(config.retention().unwrap().memory_hours(), 24);
        assert_eq!(config.backoff_config().max_backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: TimestreamConfig = serde_json::from_str(
            r#"{"hash_property": "region", "write_backoff_init": "250ms", "mag_store_retention_in_days": 7}"#,
        )
        .unwrap();

        assert_eq!(config.hash_property, "region");
        assert_eq!(config.write_backoff_init, Duration::from_millis(250));
        assert_eq!(config.mag_store_retention_in_days, 7);
        assert!(config.use_common_attributes);
    }
}
