//! Application configuration
//!
//! Central location for configuration constants and validation boundaries,
//! plus the [`AppConfig`] object that is loaded once at startup and passed
//! explicitly into every component that needs it.

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

// ===== Content Limits =====

/// Maximum length of a comment body in characters
pub const MAX_COMMENT_LENGTH: usize = 1000;

/// Maximum length of the optional text attached to a rating
pub const MAX_RATING_TEXT_LENGTH: usize = 500;

/// Lowest accepted rating score
pub const MIN_RATING_SCORE: i64 = 1;

/// Highest accepted rating score
pub const MAX_RATING_SCORE: i64 = 5;

/// Maximum length of a stored original file name
pub const MAX_FILENAME_LENGTH: usize = 255;

// ===== Accounts =====

/// Minimum length of a username
pub const MIN_USERNAME_LENGTH: usize = 3;

/// Maximum length of a username
pub const MAX_USERNAME_LENGTH: usize = 50;

/// Minimum length of a password
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Maximum length of a full name
pub const MAX_FULL_NAME_LENGTH: usize = 100;

// ===== Paging =====

/// Page size used when the caller does not ask for one
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page a caller may request
pub const MAX_PAGE_SIZE: u32 = 100;

// ===== Ledger =====

/// Minimum number of attempts for an optimistic balance update
pub const MIN_CHARGE_ATTEMPTS: u32 = 1;

/// Maximum number of attempts for an optimistic balance update
pub const MAX_CHARGE_ATTEMPTS: u32 = 20;

// ===== Activity Retention =====

/// Activity records older than this are purged (90 days)
pub const DEFAULT_ACTIVITY_RETENTION_DAYS: u32 = 90;

/// Shortest allowed retention window
pub const MIN_ACTIVITY_RETENTION_DAYS: u32 = 1;

/// Longest allowed retention window (10 years)
pub const MAX_ACTIVITY_RETENTION_DAYS: u32 = 3650;

/// Runtime configuration, deserialized from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_blob_root")]
    pub blob_root: PathBuf,
    #[serde(default = "default_activity_retention_days")]
    pub activity_retention_days: u32,
    /// Six-field cron expression for the retention purge job
    #[serde(default = "default_retention_schedule")]
    pub retention_schedule: String,
    /// Attempts made by the entitlement engine when a balance update races
    #[serde(default = "default_max_charge_attempts")]
    pub max_charge_attempts: u32,
    #[serde(default = "default_object_store_timeout_secs")]
    pub object_store_timeout_secs: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/doclib.db")
}

fn default_blob_root() -> PathBuf {
    PathBuf::from("data/blobs")
}

fn default_activity_retention_days() -> u32 {
    DEFAULT_ACTIVITY_RETENTION_DAYS
}

fn default_retention_schedule() -> String {
    "0 30 3 * * *".to_string() // Daily at 03:30
}

fn default_max_charge_attempts() -> u32 {
    5
}

fn default_object_store_timeout_secs() -> u64 {
    30
}

fn default_max_upload_bytes() -> u64 {
    50 * 1024 * 1024
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            blob_root: default_blob_root(),
            activity_retention_days: default_activity_retention_days(),
            retention_schedule: default_retention_schedule(),
            max_charge_attempts: default_max_charge_attempts(),
            object_store_timeout_secs: default_object_store_timeout_secs(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl AppConfig {
    /// Config rooted in a data directory, used by tests and first runs
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            database_path: data_dir.join("doclib.db"),
            blob_root: data_dir.join("blobs"),
            ..Self::default()
        }
    }

    /// Load config from disk, writing the defaults if the file does not exist
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file not found at {:?}, writing defaults", path);
            let config = AppConfig::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = fs::read_to_string(path).await?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        tracing::info!("Config saved to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_ACTIVITY_RETENTION_DAYS..=MAX_ACTIVITY_RETENTION_DAYS)
            .contains(&self.activity_retention_days)
        {
            return Err(AppError::Config(format!(
                "activity_retention_days must be between {} and {}",
                MIN_ACTIVITY_RETENTION_DAYS, MAX_ACTIVITY_RETENTION_DAYS
            )));
        }

        if !(MIN_CHARGE_ATTEMPTS..=MAX_CHARGE_ATTEMPTS).contains(&self.max_charge_attempts) {
            return Err(AppError::Config(format!(
                "max_charge_attempts must be between {} and {}",
                MIN_CHARGE_ATTEMPTS, MAX_CHARGE_ATTEMPTS
            )));
        }

        if self.object_store_timeout_secs == 0 {
            return Err(AppError::Config(
                "object_store_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.max_upload_bytes == 0 {
            return Err(AppError::Config(
                "max_upload_bytes must be greater than 0".to_string(),
            ));
        }

        if self.retention_schedule.split_whitespace().count() != 6 {
            return Err(AppError::Config(
                "retention_schedule must be a six-field cron expression".to_string(),
            ));
        }

        Ok(())
    }
}
