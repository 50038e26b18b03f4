use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub last_destination: Option<String>,
    pub concurrency_limit: usize,
    pub auto_gallery: bool,
    pub request_timeout_secs: u64,
    pub max_retry_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub thumbnail_cache_capacity: usize,
    pub thumbnail_disk_cache: bool,
    pub history_retention_days: u32,
    pub plugin_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            last_destination: None,
            concurrency_limit: 3,
            auto_gallery: true,
            request_timeout_secs: 120,
            max_retry_attempts: 3,
            retry_base_delay_secs: 2,
            retry_max_delay_secs: 30,
            thumbnail_cache_capacity: 1000,
            thumbnail_disk_cache: false,
            history_retention_days: 90,
            plugin_dir: None,
            output_dir: None,
            log_level: "info".to_string(),
        }
    }
}

fn get_config_path() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?
        .join("Imagehost Uploader");

    fs::create_dir_all(&config_dir)?;
    Ok(config_dir.join("config.json"))
}

pub fn load_config() -> AppResult<Config> {
    let config_path = get_config_path()?;

    if config_path.exists() {
        let config_str = fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&config_str).unwrap_or_else(|e| {
            log::warn!("Failed to parse config file: {}. Using defaults.", e);
            Config::default()
        });

        // Validate config before returning
        validate_config(&config)?;

        Ok(config)
    } else {
        // Create default config
        let default_config = Config::default();
        save_config(&default_config)?;
        Ok(default_config)
    }
}

pub fn save_config(config: &Config) -> AppResult<()> {
    validate_config(config)?;
    let config_path = get_config_path()?;

    // Create backup of existing config
    if config_path.exists() {
        let backup_path = config_path.with_extension("json.bak");
        if let Err(e) = fs::copy(&config_path, &backup_path) {
            log::warn!("Failed to create config backup: {}", e);
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(&config_path, config_str)?;

    log::info!("Configuration saved successfully");
    Ok(())
}

pub fn get_data_directory() -> AppResult<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| AppError::Config("Could not find data directory".to_string()))?
        .join("Imagehost Uploader");

    fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}

pub fn get_history_directory() -> AppResult<PathBuf> {
    let history_dir = get_data_directory()?.join("history");
    fs::create_dir_all(&history_dir)?;
    Ok(history_dir)
}

pub fn get_thumbnail_cache_directory() -> AppResult<PathBuf> {
    let cache_dir = get_data_directory()?.join("thumbnails");
    fs::create_dir_all(&cache_dir)?;
    Ok(cache_dir)
}

/// Where generated forum/BBCode output files land. Defaults to an `Output`
/// directory next to the data directory when not set in the config.
pub fn get_output_directory(config: &Config) -> AppResult<PathBuf> {
    let output_dir = match &config.output_dir {
        Some(dir) => dir.clone(),
        None => get_data_directory()?.join("Output"),
    };
    fs::create_dir_all(&output_dir)?;
    Ok(output_dir)
}

pub fn validate_config(config: &Config) -> AppResult<()> {
    if config.concurrency_limit == 0 {
        return Err(AppError::validation("concurrency_limit", "Must be at least 1"));
    }

    if config.concurrency_limit > 16 {
        return Err(AppError::validation("concurrency_limit", "Must be 16 or fewer"));
    }

    if config.request_timeout_secs == 0 {
        return Err(AppError::validation("request_timeout_secs", "Must be greater than 0"));
    }

    if config.max_retry_attempts == 0 || config.max_retry_attempts > 10 {
        return Err(AppError::validation("max_retry_attempts", "Must be between 1 and 10"));
    }

    if config.retry_base_delay_secs > config.retry_max_delay_secs {
        return Err(AppError::validation(
            "retry_base_delay_secs",
            "Must not exceed retry_max_delay_secs",
        ));
    }

    if config.thumbnail_cache_capacity == 0 {
        return Err(AppError::validation("thumbnail_cache_capacity", "Must be greater than 0"));
    }

    if config.history_retention_days == 0 {
        return Err(AppError::validation("history_retention_days", "Must be greater than 0"));
    }

    // Validate log level
    let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
    if !valid_log_levels.contains(&config.log_level.as_str()) {
        return Err(AppError::validation("log_level", "Must be a valid log level"));
    }

    Ok(())
}
