//! Instance-related type definitions.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

use crate::resource::ResourceMeta;
use crate::restart::RestartTrigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    #[default]
    Stopped,
    Started,
    /// Between the stop and the delayed start of a restart.
    Restarting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// Another copy of the executable is running and the operator kept it.
    Declined,
    /// A restart of this instance is already under way.
    RestartPending,
    /// A deliberate stop or removal overtook the start.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstanceEventKind {
    Created,
    Deleted,
    ProcessStarted { pid: u32 },
    ProcessStopped { code: Option<i32> },
    LogLine { line: String },
    StateChanged { state: RuntimeState },
    ResourcesChanged,
    SettingsReloaded,
    RestartScheduled { trigger: RestartTrigger, delay_ms: u64 },
    UpdateAvailable { available: bool },
}

/// Everything an instance reports goes through one broadcast channel, so
/// subscribers see each instance's events in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceEvent {
    pub instance_id: Uuid,
    #[serde(flatten)]
    pub kind: InstanceEventKind,
}

/// Status information for an instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: Uuid,
    pub exe: PathBuf,
    pub state: RuntimeState,
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Local>>,
    pub restart_at: Option<DateTime<Local>>,
    pub auto_start: bool,
    pub auto_restart: bool,
    pub update_available: bool,
    pub resources: Vec<ResourceMeta>,
}

/// Set whenever in-memory settings diverge from the persisted roster.
#[derive(Debug, Default)]
pub struct DirtyFlag(AtomicBool);

impl DirtyFlag {
    pub fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_dirty(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
