//! The set of managed instances and everything they share.

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::controller::{InstanceController, InstanceDeps};
use super::types::{InstanceEvent, InstanceEventKind, InstanceStatus};
use crate::error::{AppError, Result};
use crate::hooks::DestructiveAction;
use crate::paths::InstanceLayout;
use crate::revision::{has_update, ReleaseSource, RevisionInfo};
use crate::store::{ConfigStore, InstanceSettings};

pub struct InstanceRegistry {
    instances: RwLock<Vec<Arc<InstanceController>>>,
    store: Arc<ConfigStore>,
    deps: InstanceDeps,
}

impl InstanceRegistry {
    pub fn new(store: Arc<ConfigStore>, deps: InstanceDeps) -> Self {
        Self {
            instances: RwLock::new(Vec::new()),
            store,
            deps,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.deps.events.subscribe()
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    fn emit(&self, instance_id: Uuid, kind: InstanceEventKind) {
        let _ = self.deps.events.send(InstanceEvent { instance_id, kind });
    }

    /// Instantiate every roster entry. Entries that are no longer valid
    /// installations are dropped from the roster if the operator agrees.
    ///
    /// Returns the number of instances created.
    pub fn load_roster(&self) -> usize {
        let roster = self.store.snapshot();
        let mut loaded = 0;
        let mut forgotten = false;

        for settings in roster.servers.into_values() {
            let valid = InstanceLayout::from_exe(&settings.exe_file)
                .map(|layout| layout.is_valid_installation())
                .unwrap_or(false);
            if !valid {
                let action = DestructiveAction::ForgetInstance {
                    id: settings.guid,
                    exe: settings.exe_file.clone(),
                };
                if self.deps.confirm.confirm(&action) {
                    self.store.remove(&settings.guid);
                    forgotten = true;
                } else {
                    log::warn!(
                        "Instance {} at {:?} is not a valid installation, skipping",
                        settings.guid,
                        settings.exe_file
                    );
                }
                continue;
            }

            match self.register(settings) {
                Ok(_) => loaded += 1,
                Err(e) => log::warn!("Failed to load instance: {}", e),
            }
        }

        if forgotten {
            self.save_or_mark_dirty();
        }
        loaded
    }

    /// Add a new instance for the server executable at `exe`.
    pub fn create(&self, exe: &Path, auto_start: bool) -> Result<Arc<InstanceController>> {
        if self.store.contains_exe(exe) {
            return Err(AppError::duplicate_instance(exe));
        }
        let mut settings = InstanceSettings::new(exe);
        settings.auto_start = auto_start;

        let controller = self.register(settings.clone())?;
        self.store.upsert(settings);
        self.save_or_mark_dirty();
        Ok(controller)
    }

    fn register(&self, settings: InstanceSettings) -> Result<Arc<InstanceController>> {
        let auto_start = settings.auto_start;
        let controller = InstanceController::new(settings, self.deps.clone())?;
        if let Err(e) = controller.watch() {
            log::warn!(
                "Instance {}: file watching unavailable: {}",
                controller.id(),
                e
            );
        }

        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&controller));
        self.emit(controller.id(), InstanceEventKind::Created);
        log::info!(
            "Instance {} registered ({})",
            controller.id(),
            controller.layout().exe.display()
        );

        if auto_start {
            let starting = Arc::clone(&controller);
            tokio::spawn(async move {
                if let Err(e) = starting.start().await {
                    log::warn!("Instance {}: auto start failed: {}", starting.id(), e);
                }
            });
        }
        Ok(controller)
    }

    /// Stop, unregister and forget an instance.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let controller = {
            let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
            let index = instances
                .iter()
                .position(|c| c.id() == id)
                .ok_or_else(|| AppError::instance_not_found(&id.to_string()))?;
            instances.remove(index)
        };

        controller.dispose().await;
        self.store.remove(&id);
        self.save_or_mark_dirty();
        self.emit(id, InstanceEventKind::Deleted);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<InstanceController>> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances.iter().find(|c| c.id() == id).map(Arc::clone)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances.iter().map(|c| c.id()).collect()
    }

    pub fn list(&self) -> Vec<Arc<InstanceController>> {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn statuses(&self) -> Vec<InstanceStatus> {
        self.list().iter().map(|c| c.status()).collect()
    }

    fn save_or_mark_dirty(&self) {
        match self.store.save() {
            Ok(true) => {}
            Ok(false) => self.deps.dirty.mark(),
            Err(e) => {
                log::warn!("Failed to save roster: {}", e);
                self.deps.dirty.mark();
            }
        }
    }

    /// Copy every controller's settings into the roster and save it, if anything changed.
    ///
    /// Returns whether a write happened.
    pub fn flush(&self) -> Result<bool> {
        if !self.deps.dirty.take() {
            return Ok(false);
        }
        for controller in self.list() {
            self.store.upsert(controller.settings());
        }
        match self.store.save() {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.deps.dirty.mark();
                Ok(false)
            }
            Err(e) => {
                self.deps.dirty.mark();
                Err(e)
            }
        }
    }

    pub fn spawn_flush_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = self.deps.timings.flush_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = registry.flush() {
                    log::warn!("Roster flush failed: {}", e);
                }
            }
        })
    }

    /// Set each instance's update flag against `latest`. Returns how many changed.
    pub fn apply_revision(&self, latest: &RevisionInfo) -> usize {
        self.list()
            .iter()
            .filter(|c| {
                let installed = c.settings().installed_revision;
                c.set_update_available(has_update(installed.as_deref(), latest))
            })
            .count()
    }

    /// Poll `source` every `period` and refresh the update flags.
    pub fn spawn_revision_check<S: ReleaseSource>(
        self: &Arc<Self>,
        source: S,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let latest = tokio::select! {
                    () = token.cancelled() => break,
                    latest = source.latest_revision() => latest,
                };
                match latest {
                    Ok(Some(latest)) => {
                        let changed = registry.apply_revision(&latest);
                        log::debug!("Latest server revision {} ({} changed)", latest.hash, changed);
                    }
                    Ok(None) => log::debug!("Revision index lists no latest build"),
                    Err(e) => log::warn!("Revision check failed: {}", e),
                }
            }
        })
    }

    /// Forcibly stop every instance.
    pub async fn stop_all(&self) {
        for controller in self.list() {
            controller.dispose().await;
        }
    }
}
