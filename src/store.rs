//! Persistent roster of managed instances (JSON).
//!
//! A corrupt roster is never deleted: it is moved aside to a `.tmp` sibling and
//! an empty roster takes its place, so the launcher keeps working and the old
//! bytes stay available for recovery.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};

pub const DEFAULT_RESTART_TIMER: Duration = Duration::from_secs(24 * 60 * 60);

/// Persisted settings of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSettings {
    pub guid: Uuid,
    pub exe_file: PathBuf,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub auto_reload_resources: bool,
    #[serde(default)]
    pub auto_delete_logs: bool,
    #[serde(default = "default_restart_timer", with = "duration_secs")]
    pub restart_timer: Duration,
    /// Content hash of the installed server build, written by the installer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_revision: Option<String>,
}

fn default_restart_timer() -> Duration {
    DEFAULT_RESTART_TIMER
}

impl InstanceSettings {
    pub fn new(exe_file: impl Into<PathBuf>) -> Self {
        Self {
            guid: Uuid::new_v4(),
            exe_file: exe_file.into(),
            auto_start: false,
            auto_restart: false,
            auto_reload_resources: false,
            auto_delete_logs: false,
            restart_timer: DEFAULT_RESTART_TIMER,
            installed_revision: None,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub servers: BTreeMap<Uuid, InstanceSettings>,
}

pub struct ConfigStore {
    path: PathBuf,
    roster: RwLock<Roster>,
    saving: AtomicBool,
}

/// Clears the in-flight marker when a save finishes, however it finishes.
struct SaveGuard<'a>(&'a AtomicBool);

impl Drop for SaveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl ConfigStore {
    /// Load the roster at `path`.
    ///
    /// A missing file is created empty. A file that does not parse is renamed
    /// to `<path>.tmp` and replaced by an empty roster.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut needs_save = !path.exists();

        let roster = if needs_save {
            Roster::default()
        } else {
            let content = fs::read(&path)?;
            match serde_json::from_slice::<Roster>(&content) {
                Ok(roster) => roster,
                Err(e) => {
                    let quarantine = Self::quarantine_path_for(&path);
                    log::warn!(
                        "Roster {:?} is corrupt ({}), moving it to {:?}",
                        path,
                        e,
                        quarantine
                    );
                    if quarantine.exists() {
                        fs::remove_file(&quarantine)?;
                    }
                    fs::rename(&path, &quarantine)?;
                    needs_save = true;
                    Roster::default()
                }
            }
        };

        let store = Self {
            path,
            roster: RwLock::new(roster),
            saving: AtomicBool::new(false),
        };
        if needs_save {
            store.save()?;
        }
        Ok(store)
    }

    pub fn quarantine_path_for(path: &Path) -> PathBuf {
        sibling_with_suffix(path, ".tmp")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize the roster and replace the file on disk.
    ///
    /// Returns `Ok(false)` without writing when another save is in flight;
    /// callers rely on the dirty flag to persist the latest state later.
    pub fn save(&self) -> Result<bool> {
        if self
            .saving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Roster save already in flight, dropping request");
            return Ok(false);
        }
        let _guard = SaveGuard(&self.saving);

        let content = {
            let roster = self.roster.read().unwrap_or_else(|e| e.into_inner());
            serde_json::to_vec_pretty(&*roster)?
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = sibling_with_suffix(&self.path, ".partial");
        fs::write(&partial, content)
            .map_err(|e| AppError::config(format!("Failed to write roster: {}", e)))?;
        fs::rename(&partial, &self.path)
            .map_err(|e| AppError::config(format!("Failed to replace roster: {}", e)))?;
        Ok(true)
    }

    pub fn snapshot(&self) -> Roster {
        self.roster
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get(&self, id: &Uuid) -> Option<InstanceSettings> {
        let roster = self.roster.read().unwrap_or_else(|e| e.into_inner());
        roster.servers.get(id).cloned()
    }

    pub fn contains_exe(&self, exe: &Path) -> bool {
        let roster = self.roster.read().unwrap_or_else(|e| e.into_inner());
        roster.servers.values().any(|s| s.exe_file == exe)
    }

    /// Insert or replace the settings of one instance.
    pub fn upsert(&self, settings: InstanceSettings) {
        let mut roster = self.roster.write().unwrap_or_else(|e| e.into_inner());
        roster.servers.insert(settings.guid, settings);
    }

    pub fn remove(&self, id: &Uuid) -> Option<InstanceSettings> {
        let mut roster = self.roster.write().unwrap_or_else(|e| e.into_inner());
        roster.servers.remove(id)
    }

    #[cfg(test)]
    fn hold_save_in_flight(&self) -> SaveGuard<'_> {
        self.saving.store(true, Ordering::Release);
        SaveGuard(&self.saving)
    }
}
