//! In-memory catalog of the resources an installation ships.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

use serde::Serialize;
use walkdir::WalkDir;

use crate::error::Result;
use crate::paths::RESOURCE_MARKER;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceMeta {
    pub name: String,
    /// Advisory: set when a start command was delivered, cleared on stop.
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
struct Entries {
    by_name: HashMap<String, ResourceMeta>,
    order: Vec<String>,
}

impl Entries {
    fn insert(&mut self, name: &str, enabled: bool) -> bool {
        if self.by_name.contains_key(name) {
            return false;
        }
        self.by_name.insert(
            name.to_string(),
            ResourceMeta {
                name: name.to_string(),
                enabled,
            },
        );
        self.order.push(name.to_string());
        true
    }
}

/// Map plus ordered view, kept consistent under one lock.
#[derive(Default)]
pub struct ResourceCatalog {
    entries: RwLock<Entries>,
}

/// Names of the immediate subdirectories of `root` that contain a marker file.
///
/// A missing root yields an empty list.
pub fn scan_resources(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).follow_links(true) {
        let entry = entry?;
        if !entry.file_type().is_dir() || !entry.path().join(RESOURCE_MARKER).is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

impl ResourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full reconciliation of the catalog against the resources directory.
    pub fn sync(&self, root: &Path) -> Result<CatalogDiff> {
        let present = scan_resources(root)?;
        Ok(self.reconcile(&present))
    }

    /// Add names missing from the catalog as disabled, drop entries not in `present`.
    pub fn reconcile(&self, present: &[String]) -> CatalogDiff {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let keep: HashSet<&str> = present.iter().map(String::as_str).collect();

        let mut diff = CatalogDiff::default();
        entries.order.retain(|name| {
            let kept = keep.contains(name.as_str());
            if !kept {
                diff.removed.push(name.clone());
            }
            kept
        });
        for name in &diff.removed {
            entries.by_name.remove(name);
        }
        for name in present {
            if entries.insert(name, false) {
                diff.added.push(name.clone());
            }
        }
        diff
    }

    /// Seed entries the server starts on its own (listed in `settings.xml`).
    pub fn merge_enabled<I>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        names
            .into_iter()
            .filter(|name| entries.insert(name, true))
            .collect()
    }

    /// Returns whether an entry changed. Unknown names are never created.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.by_name.get_mut(name) {
            Some(meta) if meta.enabled != enabled => {
                meta.enabled = enabled;
                true
            }
            _ => false,
        }
    }

    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    pub fn get(&self, name: &str) -> Option<ResourceMeta> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.by_name.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.by_name.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.order.clone()
    }

    pub fn snapshot(&self) -> Vec<ResourceMeta> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .order
            .iter()
            .filter_map(|name| entries.by_name.get(name).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
