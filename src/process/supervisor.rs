//! Ownership of one managed child process at a time.
//!
//! Every spawn opens a new session identified by a generation number. A session
//! bundles the cancellation token, the background tasks that belong to it and
//! the "has exited" flag; tearing a session down cancels the token and awaits
//! every task, so two sessions never overlap.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWriteExt as _, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[cfg(unix)]
use super::control::kill_process_group;
use super::control::{find_processes_by_exe, force_kill, terminate_all};
use crate::error::{AppError, Result};
use crate::hooks::{ConfirmAction, DestructiveAction};

/// Result of the checks that run before a spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    Ready,
    AlreadyRunning,
    /// Conflicting processes exist and the operator chose to keep them.
    Declined(Vec<u32>),
}

/// Sent exactly once per session, when the child is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub generation: u64,
    pub pid: u32,
    pub code: Option<i32>,
    /// The session was cancelled (stop) rather than the process exiting on its own.
    pub cancelled: bool,
}

pub struct SpawnedSession {
    pub generation: u64,
    pub pid: u32,
    pub token: CancellationToken,
    pub started_at: DateTime<Local>,
    pub exit: oneshot::Receiver<ExitReport>,
}

struct Session {
    generation: u64,
    pid: u32,
    token: CancellationToken,
    exited: Arc<AtomicBool>,
    started_at: DateTime<Local>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ProcessSupervisor {
    instance_id: Uuid,
    exe: PathBuf,
    workdir: PathBuf,
    session: Mutex<Option<Session>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    generation: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(instance_id: Uuid, exe: &Path, workdir: &Path) -> Self {
        Self {
            instance_id,
            exe: exe.to_path_buf(),
            workdir: workdir.to_path_buf(),
            session: Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// True only while a session exists, its child has not exited and its
    /// token has not fired.
    pub fn is_running(&self) -> bool {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session
            .as_ref()
            .is_some_and(|s| !s.exited.load(Ordering::Acquire) && !s.token.is_cancelled())
    }

    /// Generation of the most recently spawned session (0 before the first spawn).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn pid(&self) -> Option<u32> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.as_ref().map(|s| s.pid)
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.as_ref().map(|s| s.started_at)
    }

    /// Settle the previous session and resolve executable conflicts.
    ///
    /// Other processes running the same image are only terminated after
    /// `confirm` agrees.
    pub async fn prepare(&self, confirm: Arc<dyn ConfirmAction>) -> Result<Preflight> {
        if self.is_running() {
            return Ok(Preflight::AlreadyRunning);
        }
        self.teardown().await;

        let exe = self.exe.clone();
        let pids = tokio::task::spawn_blocking(move || find_processes_by_exe(&exe, None))
            .await
            .map_err(|e| AppError::process(format!("Process scan failed: {}", e)))?;
        if pids.is_empty() {
            return Ok(Preflight::Ready);
        }

        let action = DestructiveAction::TerminateConflicting {
            exe: self.exe.clone(),
            pids: pids.clone(),
        };
        let confirmed = tokio::task::spawn_blocking(move || confirm.confirm(&action))
            .await
            .unwrap_or(false);
        if !confirmed {
            return Ok(Preflight::Declined(pids));
        }

        log::warn!(
            "Instance {}: terminating conflicting processes {:?}",
            self.instance_id,
            pids
        );
        let to_kill = pids.clone();
        tokio::task::spawn_blocking(move || terminate_all(&to_kill))
            .await
            .map_err(|e| AppError::process(format!("Failed to terminate {:?}: {}", pids, e)))??;
        Ok(Preflight::Ready)
    }

    /// Spawn the executable with all three standard streams piped.
    pub async fn spawn(&self) -> Result<SpawnedSession> {
        let mut cmd = Command::new(&self.exe);
        cmd.current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        {
            use windows::Win32::System::Threading::CREATE_NO_WINDOW;
            cmd.creation_flags(CREATE_NO_WINDOW.0);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AppError::process(format!("Failed to start {}: {}", self.exe.display(), e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::process("Failed to get process ID"))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *self.stdin.lock().await = stdin;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let token = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));
        let started_at = Local::now();
        let (exit_tx, exit_rx) = oneshot::channel();

        let mut tasks = Vec::with_capacity(3);
        if let Some(stdout) = stdout {
            tasks.push(drain_pipe(self.instance_id, "stdout", stdout, token.clone()));
        }
        if let Some(stderr) = stderr {
            tasks.push(drain_pipe(self.instance_id, "stderr", stderr, token.clone()));
        }

        let instance_id = self.instance_id;
        let wait_token = token.clone();
        let wait_exited = Arc::clone(&exited);
        tasks.push(tokio::spawn(async move {
            let (status, cancelled) = tokio::select! {
                status = child.wait() => (status, false),
                () = wait_token.cancelled() => {
                    if let Err(e) = force_kill(pid) {
                        log::warn!("Instance {}: {}, falling back to child kill", instance_id, e);
                        let _ = child.start_kill();
                    }
                    (child.wait().await, true)
                }
            };
            // background children of the server share its group
            #[cfg(unix)]
            if !cancelled {
                if let Err(e) = kill_process_group(pid) {
                    log::debug!("Instance {}: {}", instance_id, e);
                }
            }
            wait_exited.store(true, Ordering::Release);
            wait_token.cancel();

            let code = status.as_ref().ok().and_then(|s| s.code());
            log::info!(
                "Instance {} process {} exited (code: {:?})",
                instance_id,
                pid,
                code
            );
            let _ = exit_tx.send(ExitReport {
                generation,
                pid,
                code,
                cancelled,
            });
        }));

        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(Session {
            generation,
            pid,
            token: token.clone(),
            exited,
            started_at,
            tasks,
        });

        log::info!("Instance {} started (pid: {})", self.instance_id, pid);
        Ok(SpawnedSession {
            generation,
            pid,
            token,
            started_at,
            exit: exit_rx,
        })
    }

    /// Attach a task to the session so teardown waits for it.
    pub fn track(&self, generation: u64, task: JoinHandle<()>) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        match session.as_mut() {
            Some(s) if s.generation == generation => s.tasks.push(task),
            _ => task.abort(),
        }
    }

    /// Cancel the current session, kill its process and wait for all of its tasks.
    ///
    /// Returns whether a session existed.
    pub async fn teardown(&self) -> bool {
        self.teardown_if(|_| true).await
    }

    /// Same as [`Self::teardown`], restricted to one generation.
    pub async fn teardown_generation(&self, generation: u64) -> bool {
        self.teardown_if(|g| g == generation).await
    }

    async fn teardown_if(&self, matches: impl Fn(u64) -> bool) -> bool {
        let session = {
            let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
            if guard.as_ref().is_some_and(|s| matches(s.generation)) {
                guard.take()
            } else {
                None
            }
        };
        let Some(session) = session else {
            return false;
        };

        session.token.cancel();
        self.stdin.lock().await.take();
        for task in session.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    log::warn!("Instance {} session task failed: {}", self.instance_id, e);
                }
            }
        }
        true
    }

    /// Write one line to the child's standard input.
    ///
    /// Returns `false` when the process is not running or the write fails.
    pub async fn send_line(&self, data: &str) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut stdin = self.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return false;
        };

        let mut line = String::with_capacity(data.len() + 1);
        line.push_str(data);
        line.push('\n');
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        match written {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Instance {}: stdin write failed: {}", self.instance_id, e);
                false
            }
        }
    }
}

/// Keep a pipe drained so the child never blocks on a full buffer.
///
/// Stops with the session, even if a leftover descendant still holds the pipe open.
fn drain_pipe<R>(
    instance_id: Uuid,
    label: &'static str,
    pipe: R,
    token: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            let line = tokio::select! {
                () = token.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => log::debug!("[instance {} {}] {}", instance_id, label, line),
                Ok(None) | Err(_) => break,
            }
        }
    })
}
