//! When an instance should be started again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartTrigger {
    /// The process went away without a deliberate stop.
    Crash,
    /// The restart timer ran out.
    Scheduled,
}

/// Marks a restart as in flight until dropped.
pub struct RestartGuard<'a>(&'a AtomicBool);

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RestartPolicy {
    crash_delay: Duration,
    scheduled_delay: Duration,
    /// Generation whose exit must not trigger a restart; 0 means none.
    suppressed: AtomicU64,
    in_flight: AtomicBool,
}

impl RestartPolicy {
    pub fn new(crash_delay: Duration, scheduled_delay: Duration) -> Self {
        Self {
            crash_delay,
            scheduled_delay,
            suppressed: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn delay(&self, trigger: RestartTrigger) -> Duration {
        match trigger {
            RestartTrigger::Crash => self.crash_delay,
            RestartTrigger::Scheduled => self.scheduled_delay,
        }
    }

    /// The exit of session `generation` is deliberate.
    pub fn suppress(&self, generation: u64) {
        self.suppressed.store(generation, Ordering::Release);
    }

    /// Consume the suppression for `generation`, if it was set.
    pub fn take_suppressed(&self, generation: u64) -> bool {
        generation != 0
            && self
                .suppressed
                .compare_exchange(generation, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Decide what follows the exit of session `generation`.
    ///
    /// Returns the delay before the next start, or `None` when the exit was
    /// deliberate or auto-restart is off. Must be called once per exit.
    pub fn on_exit(&self, generation: u64, auto_restart: bool) -> Option<Duration> {
        if self.take_suppressed(generation) || !auto_restart {
            return None;
        }
        Some(self.crash_delay)
    }

    /// Claim the single restart slot.
    pub fn try_begin(&self) -> Option<RestartGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RestartGuard(&self.in_flight))
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

pub fn restart_deadline(started_at: DateTime<Local>, timer: Duration) -> Option<DateTime<Local>> {
    let timer = chrono::Duration::from_std(timer).ok()?;
    started_at.checked_add_signed(timer)
}

/// Whether the restart timer of a session started at `started_at` has run out.
pub fn scheduled_restart_due(
    auto_restart: bool,
    started_at: DateTime<Local>,
    timer: Duration,
    now: DateTime<Local>,
) -> bool {
    auto_restart && restart_deadline(started_at, timer).is_some_and(|deadline| now >= deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy::new(Duration::from_millis(1500), Duration::from_secs(1))
    }

    #[test]
    fn crash_restarts_only_with_auto_restart() {
        let policy = policy();
        assert_eq!(policy.on_exit(1, true), Some(Duration::from_millis(1500)));
        assert_eq!(policy.on_exit(1, false), None);
    }

    #[test]
    fn suppression_is_consumed_once_for_its_generation() {
        let policy = policy();
        policy.suppress(3);

        assert_eq!(policy.on_exit(2, true), Some(Duration::from_millis(1500)));
        assert_eq!(policy.on_exit(3, true), None);
        assert_eq!(policy.on_exit(3, true), Some(Duration::from_millis(1500)));
        assert!(!policy.take_suppressed(0));
    }

    #[test]
    fn one_restart_in_flight_at_a_time() {
        let policy = policy();
        let guard = policy.try_begin().unwrap();
        assert!(policy.is_in_flight());
        assert!(policy.try_begin().is_none());
        drop(guard);
        assert!(!policy.is_in_flight());
        assert!(policy.try_begin().is_some());
    }

    #[test]
    fn scheduled_deadline() {
        let started = Local::now();
        let timer = Duration::from_secs(1);
        let before = started + chrono::Duration::milliseconds(900);
        let after = started + chrono::Duration::milliseconds(1100);

        assert!(!scheduled_restart_due(true, started, timer, before));
        assert!(scheduled_restart_due(true, started, timer, after));
        assert!(!scheduled_restart_due(false, started, timer, after));
        assert!(!scheduled_restart_due(true, started, Duration::MAX, after));
        assert_eq!(policy().delay(RestartTrigger::Scheduled), timer);
    }
}
