//! Per-session timer bookkeeping.
//!
//! At most one task exists per `(session, kind)`. Re-arming aborts the previous task and
//! bumps the generation; a task that wakes up must present the generation it was armed
//! with, so a replaced or cancelled timer can never act.

use std::collections::HashMap;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Working → completed after no activity.
    Quiet,
    /// Completed → idle.
    Completed,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Quiet => "quiet",
            TimerKind::Completed => "completed",
        }
    }
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct SessionTimers {
    quiet: Option<Armed>,
    completed: Option<Armed>,
}

impl SessionTimers {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<Armed> {
        match kind {
            TimerKind::Quiet => &mut self.quiet,
            TimerKind::Completed => &mut self.completed,
        }
    }

    fn is_empty(&self) -> bool {
        self.quiet.is_none() && self.completed.is_none()
    }
}

#[derive(Debug, Default)]
pub struct TimerTable {
    next_generation: u64,
    sessions: HashMap<String, SessionTimers>,
}

impl TimerTable {
    /// Replaces any armed timer of this kind. `spawn` receives the new generation and
    /// returns the task that will eventually call back.
    pub fn arm(
        &mut self,
        session_id: &str,
        kind: TimerKind,
        spawn: impl FnOnce(u64) -> JoinHandle<()>,
    ) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let slot = self
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .slot(kind);
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        *slot = Some(Armed {
            generation,
            handle: spawn(generation),
        });
        generation
    }

    /// Consumes the timer if `generation` is still the armed one. Returns false for stale
    /// wakeups, which must then do nothing.
    pub fn take_if_current(&mut self, session_id: &str, kind: TimerKind, generation: u64) -> bool {
        let Some(timers) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let slot = timers.slot(kind);
        let current = matches!(slot, Some(armed) if armed.generation == generation);
        if current {
            *slot = None;
            if timers.is_empty() {
                self.sessions.remove(session_id);
            }
        }
        current
    }

    pub fn cancel(&mut self, session_id: &str, kind: TimerKind) {
        let Some(timers) = self.sessions.get_mut(session_id) else {
            return;
        };
        if let Some(armed) = timers.slot(kind).take() {
            armed.handle.abort();
        }
        if timers.is_empty() {
            self.sessions.remove(session_id);
        }
    }

    pub fn cancel_session(&mut self, session_id: &str) {
        if let Some(mut timers) = self.sessions.remove(session_id) {
            for kind in [TimerKind::Quiet, TimerKind::Completed] {
                if let Some(armed) = timers.slot(kind).take() {
                    armed.handle.abort();
                }
            }
        }
    }

    pub fn cancel_all(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.cancel_session(&id);
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, session_id: &str, kind: TimerKind) -> bool {
        self.sessions
            .get(session_id)
            .map(|timers| match kind {
                TimerKind::Quiet => timers.quiet.is_some(),
                TimerKind::Completed => timers.completed.is_some(),
            })
            .unwrap_or(false)
    }

    pub fn armed_count(&self) -> usize {
        self.sessions
            .values()
            .map(|timers| timers.quiet.is_some() as usize + timers.completed.is_some() as usize)
            .sum()
    }
}
