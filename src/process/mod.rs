//! Process management utilities.

mod control;
mod supervisor;

#[cfg(target_os = "windows")]
pub(crate) mod win_api;

use std::time::Duration;

pub use control::{find_processes_by_exe, force_kill, is_process_alive, terminate_all};
pub use supervisor::{ExitReport, Preflight, ProcessSupervisor, SpawnedSession};

/// How long to wait for killed conflicting processes to disappear.
const KILL_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
