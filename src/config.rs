use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const HOME_ENV: &str = "DAYBOARD_HOME";
pub const USER_ENV: &str = "DAYBOARD_USER";
pub const EMAIL_ENV: &str = "DAYBOARD_EMAIL";
pub const LOG_ENV: &str = "DAYBOARD_LOG";

const CONFIG_FILE: &str = "config.toml";

/// Settings read from `config.toml` in the data directory. Every field has a
/// default, so a missing file or a partial file is fine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub invitation_ttl_days: i64,
    /// Full template cycles appended by one `extend`.
    pub extend_cycles: u32,
    pub utc_offset_minutes: i32,
    pub summary_command: Option<String>,
    pub default_color: String,
    pub log_filter: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            invitation_ttl_days: 7,
            extend_cycles: 1,
            utc_offset_minutes: 0,
            summary_command: None,
            default_color: "#4F46E5".to_string(),
            log_filter: None,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.invitation_ttl_days < 1 {
            return Err(AppError::InvalidInput(
                "invitation_ttl_days must be at least 1".to_string(),
            ));
        }
        if self.extend_cycles < 1 {
            return Err(AppError::InvalidInput(
                "extend_cycles must be at least 1".to_string(),
            ));
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(AppError::InvalidInput(
                "utc_offset_minutes must be within +/- 1439".to_string(),
            ));
        }
        Ok(())
    }

    /// The calendar day `now` falls on in the configured timezone.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        match FixedOffset::east_opt(self.utc_offset_minutes * 60) {
            Some(offset) => now.with_timezone(&offset).date_naive(),
            None => now.date_naive(),
        }
    }
}

pub fn resolve_home(flag: Option<PathBuf>) -> Result<PathBuf, AppError> {
    if let Some(path) = flag {
        return Ok(path);
    }
    if let Ok(value) = std::env::var(HOME_ENV) {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value));
        }
    }
    directories::ProjectDirs::from("dev", "dayboard", "dayboard")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| {
            AppError::InvalidInput(format!("unable to resolve data directory; set {HOME_ENV}"))
        })
}

pub fn config_path(home: &Path) -> PathBuf {
    home.join(CONFIG_FILE)
}

pub fn load_settings(home: &Path) -> Result<Settings, AppError> {
    let path = config_path(home);
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = fs::read_to_string(&path)?;
    let settings: Settings = toml::from_str(&content)?;
    settings.validate()?;
    Ok(settings)
}
