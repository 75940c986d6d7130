//! Filesystem watch over an installation directory.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use notify::event::EventKind;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::paths::InstanceLayout;

/// Accepts the first event of a burst and swallows the rest until the
/// cooldown passes or the window is reopened.
pub struct WatchDebouncer {
    cooldown: Duration,
    accepted_at: Mutex<Option<Instant>>,
}

impl WatchDebouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            accepted_at: Mutex::new(None),
        }
    }

    pub fn accept(&self, now: Instant) -> bool {
        let mut accepted_at = self.accepted_at.lock().unwrap_or_else(|e| e.into_inner());
        match *accepted_at {
            Some(at) if now.saturating_duration_since(at) < self.cooldown => false,
            _ => {
                *accepted_at = Some(now);
                true
            }
        }
    }

    pub fn reopen(&self) {
        *self.accepted_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    /// `settings.xml` changed on disk.
    ReloadSettings,
    /// Something under `resources/` changed; `resource` is the directory it belongs to.
    Sync { resource: Option<String> },
}

/// Maps raw notifications for one installation onto catalog and settings work.
pub struct ResourceWatch {
    layout: InstanceLayout,
    debouncer: WatchDebouncer,
}

impl ResourceWatch {
    pub fn new(layout: InstanceLayout, cooldown: Duration) -> Self {
        Self {
            layout,
            debouncer: WatchDebouncer::new(cooldown),
        }
    }

    /// Settings edits are never debounced; resource edits are, once per event.
    pub fn dispatch(&self, paths: &[PathBuf], now: Instant) -> Vec<WatchAction> {
        let mut actions = Vec::new();
        if paths.iter().any(|p| self.layout.is_settings_file(p)) {
            actions.push(WatchAction::ReloadSettings);
        }

        let mut under_resources = paths
            .iter()
            .filter(|p| p.starts_with(&self.layout.resources))
            .peekable();
        if under_resources.peek().is_some() && self.debouncer.accept(now) {
            let resource = under_resources.find_map(|p| self.layout.resource_name_of(p));
            actions.push(WatchAction::Sync { resource });
        }
        actions
    }
}

/// Access notifications carry no change and would feed back from our own log reads.
pub fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Watch `layout.root` recursively, forwarding events into a channel.
///
/// The returned watcher must be kept alive for events to keep flowing.
pub fn spawn_watcher(
    layout: &InstanceLayout,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<Event>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = layout.root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let _ = tx.send(event);
        }
        Err(e) => log::warn!("Watch error under {:?}: {}", root, e),
    })?;
    watcher.watch(&layout.root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}
