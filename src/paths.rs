//! Centralized path utilities for the launcher and its managed installations.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{AppError, Result};

const DATA_DIR_NAME: &str = ".hmp_launcher";

/// Marker file that turns a directory under `resources/` into a loadable resource.
pub const RESOURCE_MARKER: &str = "meta.xml";

/// Get the default root data directory for the launcher (~/.hmp_launcher).
pub fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| AppError::io("Cannot find home directory"))?;
    Ok(home.join(DATA_DIR_NAME))
}

/// Launcher-level paths, rooted at a data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path to the launcher options file.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("launcher.toml")
    }

    pub fn crash_report_path(&self) -> PathBuf {
        self.root.join("crash-reports.txt")
    }

    /// Resolve the roster file; relative names are taken from the data directory.
    pub fn roster_path(&self, roster_file: &Path) -> PathBuf {
        if roster_file.is_absolute() {
            roster_file.to_path_buf()
        } else {
            self.root.join(roster_file)
        }
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| AppError::io(e.to_string()))
    }
}

/// Directory layout of one server installation, derived from its executable path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    pub exe: PathBuf,
    pub root: PathBuf,
    pub resources: PathBuf,
    pub settings: PathBuf,
    pub log: PathBuf,
    pub cache: PathBuf,
}

impl InstanceLayout {
    pub fn from_exe(exe: &Path) -> Result<Self> {
        let root = exe
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| AppError::invalid_installation(exe))?
            .to_path_buf();

        Ok(Self {
            exe: exe.to_path_buf(),
            resources: root.join("resources"),
            settings: root.join("settings.xml"),
            log: root.join("server.log"),
            cache: root.join("cache"),
            root,
        })
    }

    /// Where `server.log` is archived when logs are cleared on start.
    pub fn archived_log(&self) -> PathBuf {
        self.root.join("server.log.old")
    }

    pub fn resource_marker(&self, name: &str) -> PathBuf {
        self.resources.join(name).join(RESOURCE_MARKER)
    }

    /// Check that the executable, `resources/` and `settings.xml` are all present.
    pub fn is_valid_installation(&self) -> bool {
        self.root.is_dir()
            && self.exe.is_file()
            && self.resources.is_dir()
            && self.settings.is_file()
    }

    /// Name of the resource directory `path` lives in, if it lies under `resources/`.
    ///
    /// The resources root itself yields `None`.
    pub fn resource_name_of(&self, path: &Path) -> Option<String> {
        let rest = path.strip_prefix(&self.resources).ok()?;
        match rest.components().next()? {
            Component::Normal(name) => name.to_str().map(str::to_string),
            _ => None,
        }
    }

    pub fn is_settings_file(&self, path: &Path) -> bool {
        path == self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> InstanceLayout {
        InstanceLayout::from_exe(Path::new("/srv/hmp/HappinessMP.Server")).unwrap()
    }

    #[test]
    fn layout_is_derived_from_exe_directory() {
        let layout = layout();
        assert_eq!(layout.root, PathBuf::from("/srv/hmp"));
        assert_eq!(layout.resources, PathBuf::from("/srv/hmp/resources"));
        assert_eq!(layout.settings, PathBuf::from("/srv/hmp/settings.xml"));
        assert_eq!(layout.log, PathBuf::from("/srv/hmp/server.log"));
        assert_eq!(layout.cache, PathBuf::from("/srv/hmp/cache"));
    }

    #[test]
    fn bare_file_name_is_rejected() {
        assert!(InstanceLayout::from_exe(Path::new("server")).is_err());
    }

    #[test]
    fn resource_name_uses_first_segment_under_resources() {
        let layout = layout();
        assert_eq!(
            layout.resource_name_of(Path::new("/srv/hmp/resources/freeroam/client/main.lua")),
            Some("freeroam".to_string())
        );
        assert_eq!(
            layout.resource_name_of(Path::new("/srv/hmp/resources/race")),
            Some("race".to_string())
        );
        assert_eq!(layout.resource_name_of(Path::new("/srv/hmp/resources")), None);
        assert_eq!(layout.resource_name_of(Path::new("/srv/hmp/server.log")), None);
        // sibling directory sharing the prefix as a string, not as a path
        assert_eq!(
            layout.resource_name_of(Path::new("/srv/hmp/resources-old/x/meta.xml")),
            None
        );
    }

    #[test]
    fn relative_roster_file_is_resolved_in_data_dir() {
        let data = DataDir::new("/home/u/.hmp_launcher");
        assert_eq!(
            data.roster_path(Path::new("instances.json")),
            PathBuf::from("/home/u/.hmp_launcher/instances.json")
        );
        assert_eq!(
            data.roster_path(Path::new("/etc/hmp/roster.json")),
            PathBuf::from("/etc/hmp/roster.json")
        );
    }
}
