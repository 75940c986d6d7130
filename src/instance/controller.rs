//! One managed installation: its process, log, resources and restart rules.
//!
//! Start, stop and exit handling are serialized by a per-instance lifecycle
//! lock. Restarts run as their own tasks so that a session is never torn down
//! by one of its own tasks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use notify::{Event, RecommendedWatcher};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cleanup::{archive_server_log, delete_cache};
use super::types::{
    DirtyFlag, InstanceEvent, InstanceEventKind, InstanceStatus, RuntimeState, StartOutcome,
};
use crate::config::Timings;
use crate::error::{AppError, Result};
use crate::hooks::{ConfirmAction, CrashSink};
use crate::paths::InstanceLayout;
use crate::process::{ExitReport, Preflight, ProcessSupervisor, SpawnedSession};
use crate::resource::{
    is_relevant, spawn_watcher, CatalogDiff, ResourceCatalog, ResourceMeta, ResourceWatch,
    ServerSettings, WatchAction,
};
use crate::restart::{restart_deadline, scheduled_restart_due, RestartPolicy, RestartTrigger};
use crate::store::InstanceSettings;
use crate::tail::{LogTailer, TailExit};
use crate::validation::is_valid_resource_name;

/// Oldest lines are dropped past this many.
const MAX_LOG_LINES: usize = 10_000;

/// Collaborators shared by every instance of a registry.
#[derive(Clone)]
pub struct InstanceDeps {
    pub events: broadcast::Sender<InstanceEvent>,
    pub dirty: Arc<DirtyFlag>,
    pub confirm: Arc<dyn ConfirmAction>,
    pub crash: Arc<dyn CrashSink>,
    pub timings: Timings,
}

pub struct InstanceController {
    id: Uuid,
    layout: InstanceLayout,
    settings: RwLock<InstanceSettings>,
    server_settings: ServerSettings,
    catalog: ResourceCatalog,
    server_log: Mutex<VecDeque<String>>,
    supervisor: ProcessSupervisor,
    policy: RestartPolicy,
    watch: ResourceWatch,
    watcher: Mutex<Option<RecommendedWatcher>>,
    state: Mutex<RuntimeState>,
    lifecycle: tokio::sync::Mutex<()>,
    update_available: AtomicBool,
    /// Cancelled by a deliberate stop so delayed starts do not fire afterwards.
    pending_restart: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    deps: InstanceDeps,
}

impl InstanceController {
    /// Build a controller for a valid installation and load its resources.
    pub fn new(settings: InstanceSettings, deps: InstanceDeps) -> Result<Arc<Self>> {
        let layout = InstanceLayout::from_exe(&settings.exe_file)?;
        if !layout.is_valid_installation() {
            return Err(AppError::invalid_installation(&layout.root));
        }

        let timings = deps.timings;
        let shutdown = CancellationToken::new();
        let controller = Self {
            id: settings.guid,
            server_settings: ServerSettings::open(&layout.settings),
            catalog: ResourceCatalog::new(),
            server_log: Mutex::new(VecDeque::new()),
            supervisor: ProcessSupervisor::new(settings.guid, &layout.exe, &layout.root),
            policy: RestartPolicy::new(
                timings.crash_restart_delay(),
                timings.scheduled_restart_delay(),
            ),
            watch: ResourceWatch::new(layout.clone(), timings.watch_cooldown()),
            watcher: Mutex::new(None),
            state: Mutex::new(RuntimeState::Stopped),
            lifecycle: tokio::sync::Mutex::new(()),
            update_available: AtomicBool::new(false),
            pending_restart: Mutex::new(shutdown.child_token()),
            shutdown,
            settings: RwLock::new(settings),
            layout,
            deps,
        };

        controller
            .catalog
            .merge_enabled(controller.server_settings.nodes("resource"));
        if let Err(e) = controller.catalog.sync(&controller.layout.resources) {
            log::warn!("Instance {}: initial resource scan failed: {}", controller.id, e);
        }
        Ok(Arc::new(controller))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn layout(&self) -> &InstanceLayout {
        &self.layout
    }

    pub fn settings(&self) -> InstanceSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn server_settings(&self) -> &ServerSettings {
        &self.server_settings
    }

    pub fn resources(&self) -> Vec<ResourceMeta> {
        self.catalog.snapshot()
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn update_available(&self) -> bool {
        self.update_available.load(Ordering::Acquire)
    }

    /// When the restart timer of the current session runs out.
    pub fn restart_at(&self) -> Option<DateTime<Local>> {
        let settings = self.settings.read().unwrap_or_else(|e| e.into_inner());
        if !settings.auto_restart || !self.supervisor.is_running() {
            return None;
        }
        restart_deadline(self.supervisor.started_at()?, settings.restart_timer)
    }

    pub fn status(&self) -> InstanceStatus {
        let settings = self.settings();
        let running = self.is_running();
        InstanceStatus {
            id: self.id,
            exe: settings.exe_file,
            state: self.state(),
            running,
            pid: self.supervisor.pid().filter(|_| running),
            started_at: self.supervisor.started_at().filter(|_| running),
            restart_at: self.restart_at(),
            auto_start: settings.auto_start,
            auto_restart: settings.auto_restart,
            update_available: self.update_available(),
            resources: self.catalog.snapshot(),
        }
    }

    fn emit(&self, kind: InstanceEventKind) {
        let _ = self.deps.events.send(InstanceEvent {
            instance_id: self.id,
            kind,
        });
    }

    fn set_state(&self, next: RuntimeState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            *state = next;
            self.emit(InstanceEventKind::StateChanged { state: next });
        }
    }

    /// Move to `to` only from `from`.
    fn transition(&self, from: RuntimeState, to: RuntimeState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
            self.emit(InstanceEventKind::StateChanged { state: to });
        }
    }

    fn update_settings(&self, apply: impl FnOnce(&mut InstanceSettings)) {
        {
            let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
            apply(&mut settings);
        }
        self.deps.dirty.mark();
    }

    pub fn set_auto_start(&self, enabled: bool) {
        self.update_settings(|s| s.auto_start = enabled);
    }

    pub fn set_auto_restart(&self, enabled: bool) {
        self.update_settings(|s| s.auto_restart = enabled);
    }

    pub fn set_auto_reload_resources(&self, enabled: bool) {
        self.update_settings(|s| s.auto_reload_resources = enabled);
    }

    pub fn set_auto_delete_logs(&self, enabled: bool) {
        self.update_settings(|s| s.auto_delete_logs = enabled);
    }

    pub fn set_restart_timer(&self, timer: Duration) {
        self.update_settings(|s| s.restart_timer = timer);
    }

    pub fn set_installed_revision(&self, revision: Option<String>) {
        self.update_settings(|s| s.installed_revision = revision);
    }

    /// Returns whether the flag changed.
    pub(crate) fn set_update_available(&self, available: bool) -> bool {
        let changed = self.update_available.swap(available, Ordering::AcqRel) != available;
        if changed {
            self.emit(InstanceEventKind::UpdateAvailable { available });
        }
        changed
    }

    pub fn server_log(&self) -> Vec<String> {
        let log = self.server_log.lock().unwrap_or_else(|e| e.into_inner());
        log.iter().cloned().collect()
    }

    pub fn clear_server_log(&self) {
        self.server_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn push_log_line(&self, line: String) {
        {
            let mut log = self.server_log.lock().unwrap_or_else(|e| e.into_inner());
            if log.len() >= MAX_LOG_LINES {
                log.pop_front();
            }
            log.push_back(line.clone());
        }
        self.emit(InstanceEventKind::LogLine { line });
    }

    /// Remove `cache/`. Refused while the server runs.
    pub fn delete_cache(&self) -> Result<bool> {
        if self.is_running() {
            return Err(AppError::instance_running());
        }
        delete_cache(&self.layout)
    }

    /// Start watching the installation directory.
    pub fn watch(self: &Arc<Self>) -> Result<()> {
        let (watcher, mut events) = spawn_watcher(&self.layout)?;
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);

        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.on_fs_event(&event);
            }
        });
        Ok(())
    }

    fn on_fs_event(self: &Arc<Self>, event: &Event) {
        if !is_relevant(&event.kind) {
            return;
        }
        for action in self.watch.dispatch(&event.paths, Instant::now()) {
            match action {
                WatchAction::ReloadSettings => self.reload_server_settings(),
                WatchAction::Sync { resource } => {
                    if let Err(e) = self.sync_resources() {
                        log::warn!("Instance {}: resource scan failed: {}", self.id, e);
                    }
                    let Some(name) = resource else {
                        continue;
                    };
                    let auto_reload = self.settings().auto_reload_resources;
                    if auto_reload
                        && self.is_running()
                        && self.layout.resource_marker(&name).is_file()
                    {
                        let this = Arc::clone(self);
                        tokio::spawn(async move {
                            this.reload_resource(&name).await;
                        });
                    }
                }
            }
        }
    }

    fn reload_server_settings(&self) {
        if self.server_settings.take_self_save() {
            log::debug!("Instance {}: ignoring own settings write", self.id);
            return;
        }
        match self.server_settings.reload() {
            Ok(()) => self.emit(InstanceEventKind::SettingsReloaded),
            Err(e) => log::warn!("Instance {}: failed to reload settings: {}", self.id, e),
        }
    }

    /// Reconcile the catalog with `resources/`.
    pub fn sync_resources(&self) -> Result<CatalogDiff> {
        let diff = self.catalog.sync(&self.layout.resources)?;
        if !diff.is_empty() {
            log::info!(
                "Instance {}: resources added {:?}, removed {:?}",
                self.id,
                diff.added,
                diff.removed
            );
            self.emit(InstanceEventKind::ResourcesChanged);
        }
        Ok(diff)
    }

    pub async fn send_line(&self, line: &str) -> bool {
        self.supervisor.send_line(line).await
    }

    async fn resource_command(&self, verb: &str, name: &str, enabled: bool) -> bool {
        if !is_valid_resource_name(name) {
            log::warn!("Instance {}: refusing resource name {:?}", self.id, name);
            return false;
        }
        if !self.supervisor.send_line(&format!("{} {}", verb, name)).await {
            return false;
        }
        if self.catalog.set_enabled(name, enabled) {
            self.emit(InstanceEventKind::ResourcesChanged);
        }
        true
    }

    pub async fn start_resource(&self, name: &str) -> bool {
        self.resource_command("start", name, true).await
    }

    pub async fn stop_resource(&self, name: &str) -> bool {
        self.resource_command("stop", name, false).await
    }

    pub async fn reload_resource(&self, name: &str) -> bool {
        if !self.stop_resource(name).await {
            return false;
        }
        tokio::time::sleep(self.deps.timings.resource_reload_delay()).await;
        self.start_resource(name).await
    }

    /// Returns how many start commands were delivered.
    pub async fn start_all_resources(&self) -> usize {
        let mut sent = 0;
        for name in self.catalog.names() {
            if self.start_resource(&name).await {
                sent += 1;
            }
        }
        sent
    }

    pub async fn stop_all_resources(&self) -> usize {
        let mut sent = 0;
        for name in self.catalog.names() {
            if self.stop_resource(&name).await {
                sent += 1;
            }
        }
        sent
    }

    pub async fn reload_all_resources(&self) -> usize {
        self.stop_all_resources().await;
        tokio::time::sleep(self.deps.timings.resource_reload_delay()).await;
        self.start_all_resources().await
    }

    /// Start the server unless it already runs.
    pub async fn start(self: &Arc<Self>) -> Result<StartOutcome> {
        self.start_unless(None).await
    }

    /// Start, unless `cancelled` fired while waiting for the lifecycle lock.
    async fn start_unless(
        self: &Arc<Self>,
        cancelled: Option<&CancellationToken>,
    ) -> Result<StartOutcome> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.shutdown.is_cancelled() || cancelled.is_some_and(CancellationToken::is_cancelled) {
            return Ok(StartOutcome::Cancelled);
        }

        match self
            .supervisor
            .prepare(Arc::clone(&self.deps.confirm))
            .await?
        {
            Preflight::Ready => {}
            Preflight::AlreadyRunning => return Ok(StartOutcome::AlreadyRunning),
            Preflight::Declined(pids) => {
                log::info!(
                    "Instance {}: not started, {:?} keep running {}",
                    self.id,
                    pids,
                    self.layout.exe.display()
                );
                self.set_state(RuntimeState::Stopped);
                return Ok(StartOutcome::Declined);
            }
        }

        match self.launch().await {
            Ok(()) => Ok(StartOutcome::Started),
            Err(e) => {
                self.set_state(RuntimeState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(self: &Arc<Self>) -> Result<()> {
        if !self.layout.exe.is_file() {
            return Err(AppError::invalid_installation(&self.layout.root));
        }
        if self.settings().auto_delete_logs {
            if let Err(e) = archive_server_log(&self.layout) {
                log::warn!("Instance {}: {}", self.id, e);
            }
        }
        self.clear_server_log();

        let tailer = LogTailer::attach(&self.layout.log).await.map_err(|e| {
            AppError::io(format!(
                "Failed to open {}: {}",
                self.layout.log.display(),
                e
            ))
        })?;
        let SpawnedSession {
            generation,
            pid,
            token,
            exit,
            ..
        } = self.supervisor.spawn().await?;

        let tail = tokio::spawn(Self::run_tail(
            Arc::downgrade(self),
            tailer,
            token,
            self.deps.timings.log_poll_interval(),
            generation,
        ));
        self.supervisor.track(generation, tail);
        self.spawn_exit_listener(exit);

        self.set_state(RuntimeState::Started);
        self.emit(InstanceEventKind::ProcessStarted { pid });
        Ok(())
    }

    async fn run_tail(
        weak: Weak<Self>,
        tailer: LogTailer,
        token: CancellationToken,
        poll: Duration,
        generation: u64,
    ) {
        let exit = tailer
            .follow(
                &token,
                poll,
                |line| {
                    if let Some(this) = weak.upgrade() {
                        this.push_log_line(line);
                    }
                },
                || weak.upgrade().is_some_and(|this| this.scheduled_restart_due()),
            )
            .await;

        let Some(this) = weak.upgrade() else {
            return;
        };
        match exit {
            TailExit::Cancelled => {}
            TailExit::RestartDue => {
                let pending = this.pending_restart_token();
                this.spawn_restart(RestartTrigger::Scheduled, generation, pending);
            }
            TailExit::Failed(e) => {
                this.deps
                    .crash
                    .report(&format!("Log tail of instance {}", this.id), &e);
                tokio::spawn(async move {
                    this.stop_generation(generation, false).await;
                });
            }
        }
    }

    fn scheduled_restart_due(&self) -> bool {
        if self.policy.is_in_flight() {
            return false;
        }
        let Some(started_at) = self.supervisor.started_at() else {
            return false;
        };
        let settings = self.settings.read().unwrap_or_else(|e| e.into_inner());
        scheduled_restart_due(
            settings.auto_restart,
            started_at,
            settings.restart_timer,
            Local::now(),
        )
    }

    fn spawn_exit_listener(self: &Arc<Self>, exit: oneshot::Receiver<ExitReport>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Ok(report) = exit.await else {
                return;
            };
            if let Some(this) = weak.upgrade() {
                this.on_process_exit(report).await;
            }
        });
    }

    /// Runs exactly once per session.
    async fn on_process_exit(self: Arc<Self>, report: ExitReport) {
        let (restart, pending) = {
            let _lifecycle = self.lifecycle.lock().await;
            self.supervisor
                .teardown_generation(report.generation)
                .await;
            let current = self.supervisor.generation() == report.generation;
            if current {
                self.transition(RuntimeState::Started, RuntimeState::Stopped);
            }
            self.emit(InstanceEventKind::ProcessStopped { code: report.code });

            let auto_restart = self.settings().auto_restart;
            let restart = self
                .policy
                .on_exit(report.generation, auto_restart)
                .is_some()
                && current
                && !self.shutdown.is_cancelled();
            // taken under the lock so a forced stop after this point cancels it
            (restart, self.pending_restart_token())
        };
        if restart {
            self.spawn_restart(RestartTrigger::Crash, report.generation, pending);
        }
    }

    fn spawn_restart(
        self: &Arc<Self>,
        trigger: RestartTrigger,
        generation: u64,
        pending: CancellationToken,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.restart_after(trigger, generation, pending).await;
        });
    }

    async fn restart_after(
        self: Arc<Self>,
        trigger: RestartTrigger,
        generation: u64,
        pending: CancellationToken,
    ) {
        let Some(_guard) = self.policy.try_begin() else {
            log::debug!("Instance {}: restart already in flight", self.id);
            return;
        };
        if pending.is_cancelled() {
            return;
        }
        let delay = self.policy.delay(trigger);
        if trigger == RestartTrigger::Scheduled {
            if !self.stop_generation(generation, true).await {
                return;
            }
            log::info!("Instance {}: restart timer elapsed", self.id);
        } else {
            log::warn!("Instance {}: process exited unexpectedly", self.id);
        }
        self.emit(InstanceEventKind::RestartScheduled {
            trigger,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });

        self.set_state(RuntimeState::Restarting);
        tokio::select! {
            () = pending.cancelled() => {
                self.transition(RuntimeState::Restarting, RuntimeState::Stopped);
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }

        match self.start_unless(Some(&pending)).await {
            Ok(StartOutcome::Started) => {}
            Ok(StartOutcome::AlreadyRunning) => {
                self.transition(RuntimeState::Restarting, RuntimeState::Started);
            }
            Ok(outcome) => {
                log::info!("Instance {}: restart ended with {:?}", self.id, outcome);
                self.transition(RuntimeState::Restarting, RuntimeState::Stopped);
            }
            Err(e) => {
                log::warn!("Instance {}: restart failed: {}", self.id, e);
                self.transition(RuntimeState::Restarting, RuntimeState::Stopped);
            }
        }
    }

    /// Kill the server. A forced stop never leads to an automatic restart.
    ///
    /// Returns whether a running process was stopped.
    pub async fn stop(&self, forced: bool) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        if forced {
            self.cancel_pending_restarts();
        }
        self.stop_locked(forced, None).await
    }

    async fn stop_generation(&self, generation: u64, forced: bool) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked(forced, Some(generation)).await
    }

    async fn stop_locked(&self, forced: bool, only: Option<u64>) -> bool {
        let generation = self.supervisor.generation();
        if only.is_some_and(|g| g != generation) {
            return false;
        }
        let running = self.supervisor.is_running();
        // also covers a process that exited but whose exit is not handled yet
        if forced && generation > 0 {
            self.policy.suppress(generation);
        }
        self.supervisor.teardown().await;
        self.set_state(RuntimeState::Stopped);
        running
    }

    fn pending_restart_token(&self) -> CancellationToken {
        self.pending_restart
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn cancel_pending_restarts(&self) {
        let mut pending = self
            .pending_restart
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        pending.cancel();
        *pending = self.shutdown.child_token();
    }

    /// Forced stop followed by a start after the scheduled-restart delay.
    pub async fn restart(self: &Arc<Self>) -> Result<StartOutcome> {
        let Some(_guard) = self.policy.try_begin() else {
            return Ok(StartOutcome::RestartPending);
        };
        self.stop(true).await;
        let pending = self.pending_restart_token();
        self.set_state(RuntimeState::Restarting);
        tokio::select! {
            () = pending.cancelled() => {}
            () = tokio::time::sleep(self.deps.timings.scheduled_restart_delay()) => {}
        }

        let outcome = self.start_unless(Some(&pending)).await;
        match outcome {
            Ok(StartOutcome::Started) => {}
            Ok(StartOutcome::AlreadyRunning) => {
                self.transition(RuntimeState::Restarting, RuntimeState::Started);
            }
            _ => self.transition(RuntimeState::Restarting, RuntimeState::Stopped),
        }
        outcome
    }

    /// Stop everything this instance runs, for deletion or shutdown.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        self.watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.stop(true).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt as _;
    use std::path::{Path, PathBuf};

    use tokio::sync::broadcast::error::RecvError;

    use super::*;
    use crate::hooks::{FileCrashReporter, FixedAnswer};

    const ECHO_SERVER: &str = r#"echo "booting" >> server.log
while IFS= read -r line; do
  echo "got $line" >> server.log
done"#;

    fn install(dir: &Path, body: &str) -> PathBuf {
        for name in ["chat", "freeroam"] {
            fs::create_dir_all(dir.join("resources").join(name)).unwrap();
            fs::write(dir.join("resources").join(name).join("meta.xml"), "<meta/>").unwrap();
        }
        fs::write(
            dir.join("settings.xml"),
            "<config>\n    <resource>chat</resource>\n</config>\n",
        )
        .unwrap();
        let exe = dir.join("server.sh");
        fs::write(&exe, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        exe
    }

    fn fast_timings() -> Timings {
        Timings {
            log_poll_interval: 20,
            watch_cooldown: 100,
            crash_restart_delay: 100,
            scheduled_restart_delay: 100,
            resource_reload_delay: 20,
            ..Timings::default()
        }
    }

    fn controller_with(
        exe: &Path,
        confirm: bool,
        tune: impl FnOnce(&mut InstanceSettings),
    ) -> (Arc<InstanceController>, broadcast::Receiver<InstanceEvent>) {
        let (events, rx) = broadcast::channel(1024);
        let crash_dir = exe.parent().unwrap().join("crash-reports.txt");
        let deps = InstanceDeps {
            events,
            dirty: Arc::new(DirtyFlag::default()),
            confirm: Arc::new(FixedAnswer(confirm)),
            crash: Arc::new(FileCrashReporter::new(crash_dir)),
            timings: fast_timings(),
        };
        let mut settings = InstanceSettings::new(exe);
        tune(&mut settings);
        (InstanceController::new(settings, deps).unwrap(), rx)
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<InstanceEvent>,
        within: Duration,
        mut wanted: impl FnMut(&InstanceEventKind) -> bool,
    ) -> Option<InstanceEventKind> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(event)) if wanted(&event.kind) => return Some(event.kind),
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
                _ => return None,
            }
        }
    }

    fn is_log(text: &str) -> impl FnMut(&InstanceEventKind) -> bool + '_ {
        move |kind| matches!(kind, InstanceEventKind::LogLine { line } if line == text)
    }

    #[test]
    fn invalid_installation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _rx) = broadcast::channel(8);
        let deps = InstanceDeps {
            events,
            dirty: Arc::new(DirtyFlag::default()),
            confirm: Arc::new(FixedAnswer(false)),
            crash: Arc::new(FileCrashReporter::new(dir.path().join("crash.txt"))),
            timings: fast_timings(),
        };
        let settings = InstanceSettings::new(dir.path().join("server.sh"));
        assert!(InstanceController::new(settings, deps).is_err());
    }

    #[test]
    fn catalog_is_seeded_from_settings_then_disk() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "exit 0");
        let (controller, _rx) = controller_with(&exe, false, |_| {});

        let resources = controller.resources();
        let names: Vec<&str> = resources.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["chat", "freeroam"]);
        assert!(resources[0].enabled);
        assert!(!resources[1].enabled);
    }

    #[test]
    fn setters_mark_the_roster_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "exit 0");
        let (controller, _rx) = controller_with(&exe, false, |_| {});

        assert!(!controller.deps.dirty.is_dirty());
        controller.set_restart_timer(Duration::from_secs(3600));
        assert!(controller.deps.dirty.take());
        assert_eq!(controller.settings().restart_timer, Duration::from_secs(3600));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_reach_stdin_and_log_lines_come_back() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), ECHO_SERVER);
        let (controller, mut rx) = controller_with(&exe, false, |_| {});

        assert_eq!(controller.start().await.unwrap(), StartOutcome::Started);
        assert_eq!(controller.state(), RuntimeState::Started);
        assert_eq!(controller.start().await.unwrap(), StartOutcome::AlreadyRunning);
        assert!(next_event(&mut rx, Duration::from_secs(5), is_log("booting"))
            .await
            .is_some());

        assert!(controller.start_resource("freeroam").await);
        assert!(next_event(&mut rx, Duration::from_secs(5), is_log("got start freeroam"))
            .await
            .is_some());
        assert!(controller.resources()[1].enabled);
        assert!(!controller.start_resource("../escape").await);
        assert_eq!(controller.server_log(), vec!["booting", "got start freeroam"]);

        assert!(controller.stop(true).await);
        assert_eq!(controller.state(), RuntimeState::Stopped);
        assert!(!controller.send_line("status").await);
        assert!(!controller.stop_resource("freeroam").await);
        assert!(controller.resources()[1].enabled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crash_with_auto_restart_starts_again() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "sleep 0.2\nexit 1");
        let (controller, mut rx) = controller_with(&exe, false, |s| s.auto_restart = true);

        controller.start().await.unwrap();
        let stopped = next_event(&mut rx, Duration::from_secs(5), |k| {
            matches!(k, InstanceEventKind::ProcessStopped { .. })
        })
        .await;
        assert_eq!(stopped, Some(InstanceEventKind::ProcessStopped { code: Some(1) }));

        let scheduled = next_event(&mut rx, Duration::from_secs(5), |k| {
            matches!(k, InstanceEventKind::RestartScheduled { .. })
        })
        .await;
        assert_eq!(
            scheduled,
            Some(InstanceEventKind::RestartScheduled {
                trigger: RestartTrigger::Crash,
                delay_ms: 100
            })
        );
        assert!(next_event(&mut rx, Duration::from_secs(5), |k| {
            matches!(k, InstanceEventKind::ProcessStarted { .. })
        })
        .await
        .is_some());

        controller.dispose().await;
        assert!(!controller.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forced_stop_does_not_restart() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "exec sleep 30");
        let (controller, mut rx) = controller_with(&exe, false, |s| s.auto_restart = true);

        controller.start().await.unwrap();
        assert!(controller.stop(true).await);
        assert!(next_event(&mut rx, Duration::from_secs(5), |k| {
            matches!(k, InstanceEventKind::ProcessStopped { .. })
        })
        .await
        .is_some());
        assert!(next_event(&mut rx, Duration::from_millis(600), |k| {
            matches!(
                k,
                InstanceEventKind::RestartScheduled { .. } | InstanceEventKind::ProcessStarted { .. }
            )
        })
        .await
        .is_none());
        assert_eq!(controller.state(), RuntimeState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_timer_triggers_a_deliberate_restart() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "exec sleep 30");
        let (controller, mut rx) = controller_with(&exe, false, |s| {
            s.auto_restart = true;
            s.restart_timer = Duration::from_secs(1);
        });

        controller.start().await.unwrap();
        assert!(controller.restart_at().is_some());

        let mut seen = Vec::new();
        let restarted = next_event(&mut rx, Duration::from_secs(5), |k| {
            seen.push(k.clone());
            matches!(k, InstanceEventKind::ProcessStarted { .. })
        })
        .await;
        assert!(restarted.is_some());
        assert!(seen.contains(&InstanceEventKind::RestartScheduled {
            trigger: RestartTrigger::Scheduled,
            delay_ms: 100
        }));
        assert!(!seen.iter().any(|k| matches!(
            k,
            InstanceEventKind::RestartScheduled {
                trigger: RestartTrigger::Crash,
                ..
            }
        )));

        controller.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn manual_restart_replaces_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "exec sleep 30");
        let (controller, _rx) = controller_with(&exe, false, |_| {});

        controller.start().await.unwrap();
        let first = controller.status().pid;
        assert_eq!(controller.restart().await.unwrap(), StartOutcome::Started);
        assert!(controller.is_running());
        assert_ne!(controller.status().pid, first);
        controller.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forced_stop_cancels_a_scheduled_crash_restart() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "sleep 0.2\nexit 1");
        let (controller, mut rx) = controller_with(&exe, false, |s| s.auto_restart = true);

        controller.start().await.unwrap();
        assert!(next_event(&mut rx, Duration::from_secs(5), |k| {
            matches!(k, InstanceEventKind::ProcessStopped { .. })
        })
        .await
        .is_some());
        assert!(!controller.stop(true).await);

        assert!(next_event(&mut rx, Duration::from_millis(600), |k| {
            matches!(k, InstanceEventKind::ProcessStarted { .. })
        })
        .await
        .is_none());
        assert!(!controller.is_running());
        assert_eq!(controller.state(), RuntimeState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn background_children_do_not_block_the_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "sleep 20 &\nexit 1");
        let (controller, mut rx) = controller_with(&exe, false, |_| {});

        controller.start().await.unwrap();
        assert!(next_event(&mut rx, Duration::from_secs(5), |k| {
            matches!(k, InstanceEventKind::ProcessStopped { .. })
        })
        .await
        .is_some());
        assert!(!controller.is_running());

        let started = tokio::time::timeout(Duration::from_secs(3), controller.start()).await;
        assert!(matches!(started, Ok(Ok(StartOutcome::Started))));
        assert!(tokio::time::timeout(Duration::from_secs(3), controller.stop(true))
            .await
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tail_failure_is_reported_and_stops_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "exec sleep 30");
        let (controller, mut rx) = controller_with(&exe, false, |_| {});

        controller.start().await.unwrap();
        let log = dir.path().join("server.log");
        fs::remove_file(&log).unwrap();
        fs::create_dir(&log).unwrap();

        assert!(next_event(&mut rx, Duration::from_secs(5), |k| {
            matches!(k, InstanceEventKind::ProcessStopped { .. })
        })
        .await
        .is_some());
        assert_eq!(controller.state(), RuntimeState::Stopped);
        assert!(!controller.is_running());

        let reports = fs::read_to_string(dir.path().join("crash-reports.txt")).unwrap();
        assert!(reports.contains("Log tail of instance"));
        assert!(reports.contains("not a regular file"));
        controller.dispose().await;
    }

    #[tokio::test]
    async fn missing_executable_leaves_instance_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "exit 0");
        let (controller, _rx) = controller_with(&exe, false, |_| {});

        fs::remove_file(&exe).unwrap();
        assert!(controller.start().await.is_err());
        assert_eq!(controller.state(), RuntimeState::Stopped);
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn old_log_is_archived_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "exit 0");
        fs::write(dir.path().join("server.log"), "previous run\n").unwrap();
        let (controller, _rx) = controller_with(&exe, false, |s| s.auto_delete_logs = true);

        controller.start().await.unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("server.log.old")).unwrap(),
            "previous run\n"
        );
        controller.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cache_is_kept_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "exec sleep 30");
        fs::create_dir_all(dir.path().join("cache")).unwrap();
        let (controller, _rx) = controller_with(&exe, false, |_| {});

        controller.start().await.unwrap();
        assert!(controller.delete_cache().is_err());
        controller.stop(true).await;
        assert!(controller.delete_cache().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_resource_directory_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let exe = install(dir.path(), "exit 0");
        let (controller, mut rx) = controller_with(&exe, false, |_| {});
        controller.watch().unwrap();

        let race = dir.path().join("resources/race");
        fs::create_dir_all(&race).unwrap();
        fs::write(race.join("meta.xml"), "<meta/>").unwrap();

        let mut found = false;
        for _ in 0..20 {
            if next_event(&mut rx, Duration::from_millis(250), |k| {
                matches!(k, InstanceEventKind::ResourcesChanged)
            })
            .await
            .is_some()
                && controller.resources().iter().any(|r| r.name == "race")
            {
                found = true;
                break;
            }
            // the marker may land after the debounced scan
            std::fs::write(race.join("touch"), b"").unwrap();
        }
        assert!(found);
        controller.dispose().await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn running_copy_is_only_killed_after_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), "exit 0");
        let exe = dir.path().join("server");
        fs::copy("/bin/sleep", &exe).unwrap();

        let mut external = std::process::Command::new(&exe).arg("30").spawn().unwrap();
        let external_pid = external.id();
        let reaper = std::thread::spawn(move || external.wait());

        let (declining, _rx) = controller_with(&exe, false, |_| {});
        assert_eq!(declining.start().await.unwrap(), StartOutcome::Declined);
        assert_eq!(declining.state(), RuntimeState::Stopped);
        assert!(crate::process::is_process_alive(external_pid));

        let (confirming, _rx) = controller_with(&exe, true, |_| {});
        assert_eq!(confirming.start().await.unwrap(), StartOutcome::Started);
        let status = reaper.join().unwrap().unwrap();
        assert!(!status.success());
        confirming.dispose().await;
    }
}
