//! Decision points and sinks supplied by whoever embeds the launcher.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;

use crate::config::LauncherConfig;

/// An action the launcher will not take without an explicit yes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestructiveAction {
    /// Other OS processes already run this server executable.
    TerminateConflicting { exe: PathBuf, pids: Vec<u32> },
    /// A roster entry points at a directory that is no longer a valid installation.
    ForgetInstance { id: Uuid, exe: PathBuf },
}

impl fmt::Display for DestructiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TerminateConflicting { exe, pids } => write!(
                f,
                "{} is already running (pids {:?}); terminate it and start a new one?",
                exe.display(),
                pids
            ),
            Self::ForgetInstance { id, exe } => write!(
                f,
                "instance {} ({}) is no longer a valid installation; remove it?",
                id,
                exe.display()
            ),
        }
    }
}

pub trait ConfirmAction: Send + Sync {
    fn confirm(&self, action: &DestructiveAction) -> bool;
}

/// Answers prompts from the launcher options. Used by the headless binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfiguredAnswers {
    pub kill_conflicting: bool,
    pub forget_invalid_instances: bool,
}

impl ConfiguredAnswers {
    pub fn from_config(config: &LauncherConfig) -> Self {
        Self {
            kill_conflicting: config.kill_conflicting,
            forget_invalid_instances: config.forget_invalid_instances,
        }
    }
}

impl ConfirmAction for ConfiguredAnswers {
    fn confirm(&self, action: &DestructiveAction) -> bool {
        let answer = match action {
            DestructiveAction::TerminateConflicting { .. } => self.kill_conflicting,
            DestructiveAction::ForgetInstance { .. } => self.forget_invalid_instances,
        };
        log::info!("{} -> {}", action, if answer { "yes" } else { "no" });
        answer
    }
}

/// Answers every prompt the same way.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedAnswer(pub bool);

#[cfg(test)]
impl ConfirmAction for FixedAnswer {
    fn confirm(&self, _action: &DestructiveAction) -> bool {
        self.0
    }
}

/// Receives unexpected failures that tore an instance down.
pub trait CrashSink: Send + Sync {
    fn report(&self, context: &str, error: &dyn fmt::Display);
}

/// Appends timestamped entries to a crash report file.
pub struct FileCrashReporter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCrashReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CrashSink for FileCrashReporter {
    fn report(&self, context: &str, error: &dyn fmt::Display) {
        let entry = format!(
            "\n[{}] {}: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            context,
            error
        );
        log::error!("{}: {}", context, error);

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(entry.as_bytes()));
        if let Err(e) = written {
            log::warn!("Failed to append crash report {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_reports_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FileCrashReporter::new(dir.path().join("crash-reports.txt"));

        reporter.report("log tail", &"permission denied");
        reporter.report("log tail", &"disk full");

        let content = std::fs::read_to_string(reporter.path()).unwrap();
        let entries: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].ends_with("log tail: permission denied"));
        assert!(entries[1].ends_with("log tail: disk full"));
    }

    #[test]
    fn prompts_describe_the_action() {
        let action = DestructiveAction::TerminateConflicting {
            exe: PathBuf::from("/srv/hmp/server"),
            pids: vec![7],
        };
        assert!(action.to_string().contains("/srv/hmp/server"));
    }

    #[test]
    fn configured_answers_are_kept_apart() {
        let kill = DestructiveAction::TerminateConflicting {
            exe: PathBuf::from("/srv/hmp/server"),
            pids: vec![7],
        };
        let forget = DestructiveAction::ForgetInstance {
            id: Uuid::nil(),
            exe: PathBuf::from("/mnt/offline/server"),
        };

        let answers = ConfiguredAnswers::from_config(&LauncherConfig {
            kill_conflicting: true,
            ..LauncherConfig::default()
        });
        assert!(answers.confirm(&kill));
        assert!(!answers.confirm(&forget));

        let answers = ConfiguredAnswers {
            kill_conflicting: false,
            forget_invalid_instances: true,
        };
        assert!(!answers.confirm(&kill));
        assert!(answers.confirm(&forget));
    }
}
