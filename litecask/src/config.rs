//! Datastore configuration, validation and persistence.
//!
//! The configuration is optionally persisted as `<path>/config` (JSON) and
//! reloaded at open time.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::MIN_DATA_FILE_MAX_BYTES;

/// Name of the persisted configuration file inside the store directory.
pub const CONFIG_FILE_NAME: &str = "config";

/// Tunable parameters of a datastore.
///
/// Range errors are reported as [`Error::BadParameterValue`], cross-field
/// violations (a select threshold above its trigger, a dead-byte threshold
/// above the data file size) as [`Error::InconsistentParameterValues`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum byte size of a data file before switching to a new one.
    /// Bigger files raise the total capacity (up to 65535 files), smaller
    /// files shorten individual merges.
    pub data_file_max_bytes: u64,

    /// Period of the merge cycle, in milliseconds. Each cycle checks the
    /// trigger thresholds and, when met, compacts the selected data files.
    pub merge_cycle_period_ms: u32,

    /// Period of the upkeep cycle, in milliseconds: cache maintenance,
    /// KeyDir resizing, TTL reaping, write buffer age flushing.
    pub upkeep_cycle_period_ms: u32,

    /// Maximum age of unflushed write buffer content, in milliseconds.
    /// Bounds the data lost on sudden interruption; the effective period is
    /// at least `upkeep_cycle_period_ms`. `put` can also force a flush.
    pub write_buffer_flush_period_ms: u32,

    /// KeyDir slots migrated per upkeep tick while a resize is in progress.
    /// Too small a value risks a forced resize if the next one arrives
    /// before the previous finished.
    pub upkeep_keydir_batch_size: u32,

    /// Cache entries processed per upkeep tick for queue maintenance and
    /// preventive eviction.
    pub upkeep_value_cache_batch_size: u32,

    /// Target cache memory load, in percent. The margin kept free makes
    /// insertions cheap; eviction toward the target runs in the background.
    pub value_cache_target_memory_load_percentage: u32,

    /// A file whose dead/total byte ratio reaches this percentage triggers
    /// a merge.
    pub merge_trigger_data_file_fragmentation_percentage: u32,

    /// A file holding at least this many dead bytes triggers a merge.
    pub merge_trigger_data_file_dead_byte_threshold: u64,

    /// Once a merge is triggered, files at or above this (looser) dead
    /// ratio are included. Shall not exceed the trigger percentage.
    pub merge_select_data_file_fragmentation_percentage: u32,

    /// Once a merge is triggered, files with at least this many dead bytes
    /// are included. Shall not exceed the trigger threshold.
    pub merge_select_data_file_dead_byte_threshold: u64,

    /// Once a merge is triggered, files smaller than this are included, to
    /// keep the open-file count low.
    pub merge_select_data_file_small_size_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_file_max_bytes: 100_000_000,
            merge_cycle_period_ms: 60_000,
            upkeep_cycle_period_ms: 1_000,
            write_buffer_flush_period_ms: 5_000,
            upkeep_keydir_batch_size: 100_000,
            upkeep_value_cache_batch_size: 10_000,
            value_cache_target_memory_load_percentage: 90,
            merge_trigger_data_file_fragmentation_percentage: 50,
            merge_trigger_data_file_dead_byte_threshold: 50_000_000,
            merge_select_data_file_fragmentation_percentage: 30,
            merge_select_data_file_dead_byte_threshold: 10_000_000,
            merge_select_data_file_small_size_threshold: 10_000_000,
        }
    }
}

impl Config {
    /// Validates all parameters and their mutual consistency.
    pub fn validate(&self) -> Result<()> {
        if self.data_file_max_bytes < MIN_DATA_FILE_MAX_BYTES {
            tracing::warn!(
                "config: data_file_max_bytes shall be at least {MIN_DATA_FILE_MAX_BYTES}"
            );
            return Err(Error::BadParameterValue);
        }
        if self.merge_cycle_period_ms == 0 {
            tracing::warn!("config: merge_cycle_period_ms shall be a positive integer");
            return Err(Error::BadParameterValue);
        }
        if self.upkeep_cycle_period_ms == 0 {
            tracing::warn!("config: upkeep_cycle_period_ms shall be a positive integer");
            return Err(Error::BadParameterValue);
        }
        if self.upkeep_keydir_batch_size == 0 {
            tracing::warn!("config: upkeep_keydir_batch_size shall be a positive integer");
            return Err(Error::BadParameterValue);
        }
        if self.upkeep_value_cache_batch_size == 0 {
            tracing::warn!("config: upkeep_value_cache_batch_size shall be a positive integer");
            return Err(Error::BadParameterValue);
        }
        if self.value_cache_target_memory_load_percentage > 100 {
            tracing::warn!(
                "config: value_cache_target_memory_load_percentage shall be in [0; 100]"
            );
            return Err(Error::BadParameterValue);
        }
        if self.merge_trigger_data_file_fragmentation_percentage < 1
            || self.merge_trigger_data_file_fragmentation_percentage > 100
        {
            tracing::warn!(
                "config: merge_trigger_data_file_fragmentation_percentage shall be in [1; 100]"
            );
            return Err(Error::BadParameterValue);
        }
        if self.merge_select_data_file_fragmentation_percentage < 1
            || self.merge_select_data_file_fragmentation_percentage > 100
        {
            tracing::warn!(
                "config: merge_select_data_file_fragmentation_percentage shall be in [1; 100]"
            );
            return Err(Error::BadParameterValue);
        }
        if self.merge_select_data_file_small_size_threshold < MIN_DATA_FILE_MAX_BYTES {
            tracing::warn!(
                "config: merge_select_data_file_small_size_threshold shall be at least {MIN_DATA_FILE_MAX_BYTES}"
            );
            return Err(Error::BadParameterValue);
        }

        if self.merge_trigger_data_file_dead_byte_threshold > self.data_file_max_bytes {
            tracing::warn!(
                "config: merge_trigger_data_file_dead_byte_threshold shall not exceed data_file_max_bytes"
            );
            return Err(Error::InconsistentParameterValues);
        }
        if self.merge_select_data_file_fragmentation_percentage
            > self.merge_trigger_data_file_fragmentation_percentage
        {
            tracing::warn!(
                "config: merge_select_data_file_fragmentation_percentage shall not exceed the trigger percentage"
            );
            return Err(Error::InconsistentParameterValues);
        }
        if self.merge_select_data_file_dead_byte_threshold
            > self.merge_trigger_data_file_dead_byte_threshold
        {
            tracing::warn!(
                "config: merge_select_data_file_dead_byte_threshold shall not exceed the trigger threshold"
            );
            return Err(Error::InconsistentParameterValues);
        }
        if self.merge_select_data_file_small_size_threshold > self.data_file_max_bytes {
            tracing::warn!(
                "config: merge_select_data_file_small_size_threshold shall not exceed data_file_max_bytes"
            );
            return Err(Error::InconsistentParameterValues);
        }
        Ok(())
    }

    /// Loads the persisted configuration from `dir`, if present.
    ///
    /// An unreadable or invalid file is reported, not silently replaced.
    pub fn load(dir: &Path) -> Result<Option<Config>> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            tracing::warn!("config: cannot parse {}: {e}", path.display());
            Error::BadParameterValue
        })?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Persists the configuration into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE_NAME);
        let content =
            serde_json::to_string_pretty(self).expect("config serialization cannot fail");
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_range_errors() {
        let mut c = Config {
            data_file_max_bytes: 100,
            ..Config::default()
        };
        assert!(matches!(c.validate(), Err(Error::BadParameterValue)));

        c = Config {
            merge_cycle_period_ms: 0,
            ..Config::default()
        };
        assert!(matches!(c.validate(), Err(Error::BadParameterValue)));

        c = Config {
            merge_trigger_data_file_fragmentation_percentage: 0,
            ..Config::default()
        };
        assert!(matches!(c.validate(), Err(Error::BadParameterValue)));

        c = Config {
            merge_trigger_data_file_fragmentation_percentage: 101,
            ..Config::default()
        };
        assert!(matches!(c.validate(), Err(Error::BadParameterValue)));
    }

    #[test]
    fn test_inconsistency_errors() {
        let c = Config {
            merge_select_data_file_fragmentation_percentage: 80,
            merge_trigger_data_file_fragmentation_percentage: 50,
            ..Config::default()
        };
        assert!(matches!(
            c.validate(),
            Err(Error::InconsistentParameterValues)
        ));

        let c = Config {
            data_file_max_bytes: 2048,
            merge_trigger_data_file_dead_byte_threshold: 4096,
            ..Config::default()
        };
        assert!(matches!(
            c.validate(),
            Err(Error::InconsistentParameterValues)
        ));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            data_file_max_bytes: 4096,
            merge_trigger_data_file_dead_byte_threshold: 2048,
            merge_select_data_file_dead_byte_threshold: 1024,
            merge_select_data_file_small_size_threshold: 2048,
            ..Config::default()
        };
        config.save(dir.path()).expect("save");
        let loaded = Config::load(dir.path()).expect("load").expect("present");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(Config::load(dir.path()).expect("load").is_none());
    }
}
