//! Launcher options, stored as TOML in the data directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub const DEFAULT_RELEASE_INDEX_URL: &str =
    "https://raw.githubusercontent.com/ProjectHMP/HSL/hmp-server-revisions/versions.json";

/// Load the options file, writing the defaults if it does not exist yet.
pub fn load_config(path: &Path) -> Result<LauncherConfig> {
    if !path.exists() {
        let config = LauncherConfig::default();
        save_config(path, &config)?;
        return Ok(config);
    }
    let content = fs::read_to_string(path).map_err(|e| AppError::config(e.to_string()))?;
    toml::from_str(&content).map_err(|e| AppError::config(e.to_string()))
}

pub fn save_config(path: &Path, config: &LauncherConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::config(e.to_string()))?;
    }
    let content = toml::to_string_pretty(config).map_err(|e| AppError::config(e.to_string()))?;
    fs::write(path, content).map_err(|e| AppError::config(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_roster_file")]
    pub roster_file: PathBuf,
    #[serde(default = "default_true")]
    pub check_updates: bool,
    #[serde(default = "default_release_index_url")]
    pub release_index_url: String,
    /// Answer for "kill the already running copy of this server?" in headless mode.
    #[serde(default)]
    pub kill_conflicting: bool,
    /// Answer for "drop roster entries whose installation is gone?" at startup.
    #[serde(default)]
    pub forget_invalid_instances: bool,
    #[serde(default)]
    pub timings: Timings,
}

fn default_true() -> bool {
    true
}

fn default_roster_file() -> PathBuf {
    PathBuf::from("instances.json")
}

fn default_release_index_url() -> String {
    DEFAULT_RELEASE_INDEX_URL.to_string()
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            roster_file: default_roster_file(),
            check_updates: true,
            release_index_url: default_release_index_url(),
            kill_conflicting: false,
            forget_invalid_instances: false,
            timings: Timings::default(),
        }
    }
}

/// Poll intervals and delays, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub log_poll_interval: u64,
    pub watch_cooldown: u64,
    pub crash_restart_delay: u64,
    pub scheduled_restart_delay: u64,
    pub resource_reload_delay: u64,
    pub flush_interval: u64,
    pub revision_check_interval: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            log_poll_interval: 500,
            watch_cooldown: 500,
            crash_restart_delay: 1500,
            scheduled_restart_delay: 1000,
            resource_reload_delay: 1000,
            flush_interval: 2500,
            revision_check_interval: 5 * 60 * 1000,
        }
    }
}

impl Timings {
    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval)
    }

    pub fn watch_cooldown(&self) -> Duration {
        Duration::from_millis(self.watch_cooldown)
    }

    pub fn crash_restart_delay(&self) -> Duration {
        Duration::from_millis(self.crash_restart_delay)
    }

    pub fn scheduled_restart_delay(&self) -> Duration {
        Duration::from_millis(self.scheduled_restart_delay)
    }

    pub fn resource_reload_delay(&self) -> Duration {
        Duration::from_millis(self.resource_reload_delay)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval)
    }

    pub fn revision_check_interval(&self) -> Duration {
        Duration::from_millis(self.revision_check_interval)
    }
}
