use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::BindexError;
use crate::Result;

/// B-tree shape settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeSettings {
    /// Minimum degree `t`: non-root nodes hold between `t - 1` and
    /// `2t - 1` keys.
    pub node_min: usize,
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self { node_min: 64 }
    }
}

impl TreeSettings {
    pub fn with_node_min(mut self, node_min: usize) -> Self {
        self.node_min = node_min;
        self
    }

    pub fn max_keys(&self) -> usize {
        2 * self.node_min - 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_min < 2 {
            return Err(BindexError::InvalidRequest(format!(
                "node_min must be at least 2, got {}",
                self.node_min
            )));
        }
        Ok(())
    }
}

/// Bin packing settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackerSettings {
    /// Maximum total weight of a bin
    pub bin_capacity: usize,
}

impl Default for PackerSettings {
    fn default() -> Self {
        Self { bin_capacity: 256 }
    }
}

impl PackerSettings {
    pub fn with_bin_capacity(mut self, bin_capacity: usize) -> Self {
        self.bin_capacity = bin_capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.bin_capacity == 0 {
            return Err(BindexError::InvalidRequest(
                "bin_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Block store and worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiverConfig {
    pub data_dir: PathBuf,
    pub worker_threads: usize,
    pub join_backoff_initial_ms: u64,
    pub join_backoff_max_ms: u64,
    /// Sync block files to disk before reporting a push complete
    pub fsync: bool,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./blocks"),
            worker_threads: num_cpus::get(),
            join_backoff_initial_ms: 1,
            join_backoff_max_ms: 250,
            fsync: false,
        }
    }
}

impl ArchiverConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn with_join_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.join_backoff_initial_ms = initial_ms;
        self.join_backoff_max_ms = max_ms;
        self
    }

    /// Initial and capped wait between checks when joining a flush stage.
    pub fn join_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.join_backoff_initial_ms),
            Duration::from_millis(self.join_backoff_max_ms),
        )
    }

    pub fn with_profile(mut self, profile: StoreProfile) -> Self {
        profile.apply_to(&mut self);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(BindexError::InvalidRequest(
                "worker_threads must be positive".to_string(),
            ));
        }
        if self.join_backoff_initial_ms > self.join_backoff_max_ms {
            return Err(BindexError::InvalidRequest(format!(
                "join backoff initial {}ms exceeds cap {}ms",
                self.join_backoff_initial_ms, self.join_backoff_max_ms
            )));
        }
        Ok(())
    }
}

/// Presets for different storage workloads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreProfile {
    /// Tests and throwaway indexes
    Memory,
    /// Every block synced before a push completes
    Durable,
    /// Large merges: wide pool, no fsync
    Bulk,
}

impl StoreProfile {
    pub fn worker_threads(&self) -> usize {
        match self {
            StoreProfile::Memory => 2,
            StoreProfile::Durable => num_cpus::get().max(1),
            StoreProfile::Bulk => (num_cpus::get() * 2).max(2),
        }
    }

    pub fn fsync(&self) -> bool {
        matches!(self, StoreProfile::Durable)
    }

    /// Apply this profile to an ArchiverConfig
    pub fn apply_to(&self, config: &mut ArchiverConfig) {
        config.worker_threads = self.worker_threads();
        config.fsync = self.fsync();
    }
}

impl std::str::FromStr for StoreProfile {
    type Err = BindexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreProfile::Memory),
            "durable" => Ok(StoreProfile::Durable),
            "bulk" => Ok(StoreProfile::Bulk),
            other => Err(BindexError::InvalidRequest(format!(
                "unknown store profile '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_settings_bounds() {
        let settings = TreeSettings::default().with_node_min(3);
        assert_eq!(settings.max_keys(), 5);
        assert!(settings.validate().is_ok());
        assert!(TreeSettings::default().with_node_min(1).validate().is_err());
    }

    #[test]
    fn test_profile_applies() {
        let config = ArchiverConfig::new(PathBuf::from("/tmp/x")).with_profile(StoreProfile::Durable);
        assert!(config.fsync);
        assert!(config.worker_threads >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!("bulk".parse::<StoreProfile>().unwrap(), StoreProfile::Bulk);
        assert!("fast".parse::<StoreProfile>().is_err());
    }

    #[test]
    fn test_backoff_validation() {
        let config = ArchiverConfig::default().with_join_backoff(500, 10);
        assert!(config.validate().is_err());

        let config = ArchiverConfig::default().with_join_backoff(3, 40);
        assert_eq!(
            config.join_backoff(),
            (Duration::from_millis(3), Duration::from_millis(40))
        );
    }

    #[test]
    fn test_settings_serde() {
        let json = serde_json::to_string(&PackerSettings::default().with_bin_capacity(9)).unwrap();
        let back: PackerSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bin_capacity, 9);
    }
}
