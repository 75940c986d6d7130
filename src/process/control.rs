//! Platform-agnostic process control functions.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use super::KILL_SETTLE_TIMEOUT;
use crate::error::{AppError, Result};

/// Check if a process is alive by PID.
#[cfg(target_os = "windows")]
pub fn is_process_alive(pid: u32) -> bool {
    super::win_api::is_process_alive(pid)
}

/// Check if a process is alive by PID.
#[cfg(not(target_os = "windows"))]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Kill `pid` and its children with `taskkill /T`, falling back to
/// TerminateProcess on the server process alone.
#[cfg(target_os = "windows")]
pub fn force_kill(pid: u32) -> Result<()> {
    let tree_killed = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .map(|output| output.status.success());

    match tree_killed {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => super::win_api::terminate_process(pid).map_err(|e| {
            AppError::process(format!("Failed to terminate process {}: {}", pid, e))
        }),
    }
}

/// Kill the whole process group led by `pid`, or just `pid` when it has none.
#[cfg(not(target_os = "windows"))]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        Ok(pgid) if pgid == target => killpg(pgid, Signal::SIGKILL).map_err(|e| {
            AppError::process(format!(
                "Failed to kill process group {} (from pid {}): {}",
                pgid.as_raw(),
                pid,
                e
            ))
        }),
        Ok(_) => kill(target, Signal::SIGKILL)
            .map_err(|e| AppError::process(format!("Failed to kill process {}: {}", pid, e))),
        Err(e) => kill(target, Signal::SIGKILL).map_err(|kill_err| {
            AppError::process(format!(
                "Failed to kill process {} (getpgid failed: {}): {}",
                pid, e, kill_err
            ))
        }),
    }
}

/// Kill whatever is left of the process group `pgid` after its leader exited.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(AppError::process(format!(
            "Failed to kill process group {}: {}",
            pgid, e
        ))),
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// PIDs of running processes whose executable image is `exe`, except `exclude`.
pub fn find_processes_by_exe(exe: &Path, exclude: Option<u32>) -> Vec<u32> {
    let target = normalize(exe);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_exe(UpdateKind::Always),
    );

    let mut pids: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(pid, _)| Some(pid.as_u32()) != exclude)
        .filter(|(_, process)| {
            process
                .exe()
                .is_some_and(|image| image == target || normalize(image) == target)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();
    pids.sort_unstable();
    pids
}

/// Force kill each PID and wait (blocking) until they are gone or the timeout passes.
pub fn terminate_all(pids: &[u32]) -> Result<()> {
    for &pid in pids {
        if is_process_alive(pid) {
            force_kill(pid)?;
        }
    }

    let deadline = Instant::now() + KILL_SETTLE_TIMEOUT;
    while Instant::now() < deadline {
        if pids.iter().all(|&pid| !is_process_alive(pid)) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let survivors: Vec<u32> = pids
        .iter()
        .copied()
        .filter(|&pid| is_process_alive(pid))
        .collect();
    if survivors.is_empty() {
        Ok(())
    } else {
        Err(AppError::process(format!(
            "Processes still alive after kill: {:?}",
            survivors
        )))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn scan_finds_nothing_for_unused_image() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("never-started");
        std::fs::write(&exe, b"").unwrap();
        assert!(find_processes_by_exe(&exe, None).is_empty());
    }

    #[test]
    fn force_kill_without_own_group_only_kills_pid() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        force_kill(pid).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
        // the test runner shares the group and must survive
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn group_kill_reaches_children_of_an_exited_leader() {
        use std::io::Read as _;
        use std::os::unix::process::CommandExt as _;

        // the background sleep inherits stdout, so EOF means it is gone
        let mut leader = std::process::Command::new("sh")
            .args(["-c", "sleep 30 &"])
            .stdout(std::process::Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let pgid = leader.id();
        let mut stdout = leader.stdout.take().unwrap();
        leader.wait().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let mut rest = Vec::new();
            let _ = tx.send(stdout.read_to_end(&mut rest).is_ok());
        });
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        kill_process_group(pgid).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        assert!(kill_process_group(pgid).is_ok());
    }

    #[test]
    fn terminate_all_ignores_dead_pids() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(terminate_all(&[pid]).is_ok());
    }
}
