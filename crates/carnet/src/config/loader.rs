use std::path::Path;

use crate::config::schema::{CarnetConfig, CONFIG_VERSION};
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CarnetConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<CarnetConfig, ConfigError> {
    let config: CarnetConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &CarnetConfig) -> Result<(), ConfigError> {
    let fail = |message: String| Err(ConfigError::Validation { message });

    if config.version != CONFIG_VERSION {
        return fail(format!("Unsupported config version: {}", config.version));
    }
    if config.worker_count == 0 {
        return fail("worker_count must be at least 1".to_string());
    }
    if config.queue.trim().is_empty() {
        return fail("queue name must not be empty".to_string());
    }
    if config.max_attempts == 0 {
        return fail("max_attempts must be at least 1".to_string());
    }
    if config.unit_timeout_secs == 0 {
        return fail("unit_timeout_secs must be at least 1".to_string());
    }
    if config.retention_keep == 0 {
        return fail("retention_keep must be at least 1".to_string());
    }
    if config.log_capacity == 0 {
        return fail("log_capacity must be at least 1".to_string());
    }
    if config.task_retention_secs == 0 {
        return fail("task_retention_secs must be at least 1".to_string());
    }
    if config.stall_timeout_secs < config.unit_timeout_secs {
        return fail(format!(
            "stall_timeout_secs ({}) must not be shorter than unit_timeout_secs ({})",
            config.stall_timeout_secs, config.unit_timeout_secs
        ));
    }

    Ok(())
}
