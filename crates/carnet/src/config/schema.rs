use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::default_database_path;

pub const CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarnetConfig {
    pub version: String,
    #[serde(default = "default_database")]
    pub database_path: PathBuf,
    /// Root of `work/`, `cards/` and `archives/`.
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retention_keep")]
    pub retention_keep: usize,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// How long finished tasks stay in the queue table.
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

fn default_database() -> PathBuf {
    default_database_path().unwrap_or_else(|| PathBuf::from("carnet.db"))
}

fn default_data_directory() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".carnet").join("data"))
        .unwrap_or_else(|| PathBuf::from("carnet-data"))
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_queue() -> String {
    "carnets".to_string()
}

fn default_unit_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_retention_keep() -> usize {
    2
}

fn default_log_capacity() -> usize {
    200
}

fn default_stall_timeout_secs() -> u64 {
    3600
}

fn default_task_retention_secs() -> u64 {
    7 * 24 * 3600
}

impl Default for CarnetConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            database_path: default_database(),
            data_directory: default_data_directory(),
            worker_count: default_worker_count(),
            queue: default_queue(),
            unit_timeout_secs: default_unit_timeout_secs(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            retention_keep: default_retention_keep(),
            log_capacity: default_log_capacity(),
            stall_timeout_secs: default_stall_timeout_secs(),
            task_retention_secs: default_task_retention_secs(),
        }
    }
}

impl CarnetConfig {
    /// Configuration rooted at `data_directory`, with the database inside it.
    pub fn rooted_at(data_directory: impl Into<PathBuf>) -> Self {
        let data_directory = data_directory.into();
        Self {
            database_path: data_directory.join("carnet.db"),
            data_directory,
            ..Self::default()
        }
    }

    pub fn work_directory(&self) -> PathBuf {
        self.data_directory.join("work")
    }

    pub fn cards_directory(&self) -> PathBuf {
        self.data_directory.join("cards")
    }

    pub fn archive_directory(&self) -> PathBuf {
        self.data_directory.join("archives")
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_helpers() {
        let config = CarnetConfig::rooted_at("/srv/carnet");
        assert_eq!(config.work_directory(), PathBuf::from("/srv/carnet/work"));
        assert_eq!(config.cards_directory(), PathBuf::from("/srv/carnet/cards"));
        assert_eq!(
            config.archive_directory(),
            PathBuf::from("/srv/carnet/archives")
        );
        assert_eq!(config.database_path, PathBuf::from("/srv/carnet/carnet.db"));
    }

    #[test]
    fn test_defaults() {
        let config = CarnetConfig::default();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.queue, "carnets");
        assert_eq!(config.retention_keep, 2);
        assert_eq!(config.unit_timeout(), Duration::from_secs(300));
        assert_eq!(config.task_retention(), Duration::from_secs(604_800));
        assert!(config.worker_count > 0);
    }
}
