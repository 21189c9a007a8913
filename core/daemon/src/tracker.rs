//! Session state tracker.
//!
//! Single writer for the session map. Every mutation (events, heartbeats, timers, sweeps)
//! happens inside one critical section guarding both the sessions and their timers, so a
//! timer reset is never observed separately from the event that caused it. Broadcasting and
//! notifications run after the lock is released.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pulse_protocol::{Session, SessionState, TelemetryEvent, Tool};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broadcast::build_session_list;
use crate::config::DaemonConfig;
use crate::notifier::Notifier;
use crate::output::SnapshotSink;
use crate::reducer::{classify, reduce, Action};
use crate::timers::{TimerKind, TimerTable};
use crate::tokens::apply_token_usage;
use crate::window::{WindowContext, WindowResolver};

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub quiet_period: Duration,
    pub completed_timeout: Duration,
    pub session_timeout: Duration,
    pub notify_on_completion: bool,
}

impl TrackerSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            quiet_period: config.quiet_period(),
            completed_timeout: config.completed_timeout(),
            session_timeout: config.session_timeout(),
            notify_on_completion: config.notify_on_completion,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    timers: TimerTable,
    broadcast_seq: u64,
}

/// Follow-up work decided under the lock and carried out after it is released.
#[derive(Debug, Default)]
struct Effects {
    broadcast: bool,
    completed: Option<Session>,
}

impl Effects {
    fn broadcast() -> Self {
        Self {
            broadcast: true,
            completed: None,
        }
    }
}

pub struct SessionTracker {
    inner: Mutex<Inner>,
    settings: TrackerSettings,
    windows: Arc<dyn WindowResolver>,
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn SnapshotSink>,
    live_sessions: AtomicUsize,
    shutdown: CancellationToken,
}

impl SessionTracker {
    pub fn new(
        settings: TrackerSettings,
        windows: Arc<dyn WindowResolver>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn SnapshotSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            settings,
            windows,
            notifier,
            sink,
            live_sessions: AtomicUsize::new(0),
            shutdown,
        }
    }

    /// Lock-free; safe to call from health checks while the tracker is busy.
    pub fn live_session_count(&self) -> usize {
        self.live_sessions.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    #[cfg(test)]
    pub fn armed_timers(&self) -> usize {
        self.inner.lock().timers.armed_count()
    }

    /// Applies one decoded event. Returns the id of the session it was attributed to.
    pub async fn process_event(self: &Arc<Self>, event: TelemetryEvent) -> Option<String> {
        if event.session_id.is_none() && event.tool.is_none() {
            debug!(event = %event.event_name, "Dropping event with no session id and no tool");
            return None;
        }

        let may_create = match &event.session_id {
            Some(session_id) => !self.inner.lock().sessions.contains_key(session_id),
            None => true,
        };
        // The resolver can shell out, so it runs before the lock is taken.
        let context = if may_create {
            self.windows.focused().await
        } else {
            WindowContext::default()
        };

        let now = Utc::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (session_id, created) = self.resolve_session(inner, &event, &context, now)?;
        let mut effects = self.apply_event(inner, &session_id, &event, now);
        effects.broadcast |= created;
        drop(guard);

        self.finish(effects);
        Some(session_id)
    }

    fn resolve_session(
        &self,
        inner: &mut Inner,
        event: &TelemetryEvent,
        context: &WindowContext,
        now: DateTime<Utc>,
    ) -> Option<(String, bool)> {
        let (session_id, tool) = match &event.session_id {
            Some(session_id) => {
                if inner.sessions.contains_key(session_id) {
                    return Some((session_id.clone(), false));
                }
                let Some(tool) = event.tool else {
                    debug!(
                        session_id = %session_id,
                        event = %event.event_name,
                        "Cannot create a session without knowing its tool"
                    );
                    return None;
                };
                (session_id.clone(), tool)
            }
            None => {
                let tool = event.tool?;
                let synthetic = format!("{}-{}", tool, event.timestamp.timestamp());
                if inner.sessions.contains_key(&synthetic) {
                    return Some((synthetic, false));
                }
                if let Some(existing) = context
                    .window_id
                    .and_then(|window_id| session_for_window(&inner.sessions, window_id, tool))
                {
                    return Some((existing, false));
                }
                (synthetic, tool)
            }
        };

        let mut session = Session::new(session_id.clone(), tool, now);
        session.window_id = context.window_id;
        session.project = context.project.clone();
        info!(
            session_id = %session_id,
            tool = %tool,
            window_id = ?session.window_id,
            project = ?session.project,
            "Session created"
        );
        inner.sessions.insert(session_id.clone(), session);
        self.live_sessions
            .store(inner.sessions.len(), Ordering::Relaxed);
        Some((session_id, true))
    }

    fn apply_event(
        self: &Arc<Self>,
        inner: &mut Inner,
        session_id: &str,
        event: &TelemetryEvent,
        now: DateTime<Utc>,
    ) -> Effects {
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Effects::default();
        };
        session.touch(now);
        apply_token_usage(session, event);

        match reduce(session.state, classify(&event.event_name)) {
            Action::StartWorking => {
                let from = session.state;
                session.transition_to(SessionState::Working, now, event.event_name.clone());
                info!(
                    session_id = %session_id,
                    from = from.as_str(),
                    to = "working",
                    event = %event.event_name,
                    state_seq = session.state_seq,
                    "Session state changed"
                );
                inner.timers.cancel(session_id, TimerKind::Completed);
                self.arm_timer(&mut inner.timers, session_id, TimerKind::Quiet);
                Effects::broadcast()
            }
            Action::ResetQuietTimer => {
                trace!(session_id = %session_id, event = %event.event_name, "Quiet timer reset");
                self.arm_timer(&mut inner.timers, session_id, TimerKind::Quiet);
                Effects::default()
            }
            Action::ResetCompletedTimer => {
                self.arm_timer(&mut inner.timers, session_id, TimerKind::Completed);
                Effects::default()
            }
            Action::Touch => Effects::default(),
        }
    }

    /// Keeps every working session of `tool` alive. Never creates sessions or changes state.
    pub fn process_heartbeat_for_tool(self: &Arc<Self>, tool: Tool) -> usize {
        let now = Utc::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let refreshed: Vec<String> = inner
            .sessions
            .values_mut()
            .filter(|session| session.tool == tool && session.state == SessionState::Working)
            .map(|session| {
                session.touch(now);
                session.session_id.clone()
            })
            .collect();
        for session_id in &refreshed {
            self.arm_timer(&mut inner.timers, session_id, TimerKind::Quiet);
        }
        if !refreshed.is_empty() {
            trace!(tool = %tool, sessions = refreshed.len(), "Heartbeat");
        }
        refreshed.len()
    }

    /// Per-session form of [`Self::process_heartbeat_for_tool`]. Returns false if the session
    /// is unknown or not working.
    pub fn process_heartbeat(self: &Arc<Self>, session_id: &str) -> bool {
        let now = Utc::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return false;
        };
        if session.state != SessionState::Working {
            return false;
        }
        session.touch(now);
        self.arm_timer(&mut inner.timers, session_id, TimerKind::Quiet);
        true
    }

    /// Ensures an idle session exists. Returns true if one was created.
    pub fn create_session(&self, session_id: &str, tool: Tool) -> bool {
        let now = Utc::now();
        let created = {
            let mut inner = self.inner.lock();
            if inner.sessions.contains_key(session_id) {
                false
            } else {
                let mut session = Session::new(session_id, tool, now);
                session.status_reason = "process_detected".to_string();
                inner.sessions.insert(session_id.to_string(), session);
                self.live_sessions
                    .store(inner.sessions.len(), Ordering::Relaxed);
                true
            }
        };
        if created {
            info!(session_id = %session_id, tool = %tool, "Session created from process scan");
            self.broadcast();
        }
        created
    }

    /// Refreshes `last_event_at`; a working session also gets its quiet timer reset.
    pub fn keepalive(self: &Arc<Self>, session_id: &str) -> bool {
        let now = Utc::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return false;
        };
        session.touch(now);
        if session.state == SessionState::Working {
            self.arm_timer(&mut inner.timers, session_id, TimerKind::Quiet);
        }
        true
    }

    /// Moves a working session to completed as if its quiet period had elapsed.
    pub fn complete_session(self: &Arc<Self>, session_id: &str) -> bool {
        let now = Utc::now();
        let effects = {
            let mut guard = self.inner.lock();
            self.enter_completed(&mut guard, session_id, now, "process_exited")
        };
        let completed = effects.completed.is_some();
        self.finish(effects);
        completed
    }

    /// Removes sessions whose window no longer exists. Skipped when the window list is
    /// unavailable.
    pub async fn sweep_orphans(&self) -> usize {
        let Some(live) = self.windows.live_window_ids().await else {
            trace!("Window list unavailable; skipping orphan sweep");
            return 0;
        };

        let removed = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let orphaned: Vec<String> = inner
                .sessions
                .values()
                .filter(|session| matches!(session.window_id, Some(id) if !live.contains(&id)))
                .map(|session| session.session_id.clone())
                .collect();
            for session_id in &orphaned {
                if let Some(session) = inner.sessions.remove(session_id) {
                    inner.timers.cancel_session(session_id);
                    info!(
                        session_id = %session_id,
                        window_id = ?session.window_id,
                        state = session.state.as_str(),
                        "Session removed; window closed"
                    );
                }
            }
            self.live_sessions
                .store(inner.sessions.len(), Ordering::Relaxed);
            orphaned.len()
        };

        if removed > 0 {
            self.broadcast();
        }
        removed
    }

    /// Removes sessions idle for longer than the session timeout.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let timeout = self.settings.session_timeout;
        let removed = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let stale: Vec<String> = inner
                .sessions
                .values()
                .filter(|session| {
                    now.signed_duration_since(session.last_event_at)
                        .to_std()
                        .map(|elapsed| elapsed > timeout)
                        .unwrap_or(false)
                })
                .map(|session| session.session_id.clone())
                .collect();
            for session_id in &stale {
                if let Some(mut session) = inner.sessions.remove(session_id) {
                    inner.timers.cancel_session(session_id);
                    let from = session.state;
                    session.transition_to(SessionState::Expired, now, "session_timeout");
                    info!(
                        session_id = %session_id,
                        from = from.as_str(),
                        state = session.state.as_str(),
                        last_event_at = %session.last_event_at,
                        "Session expired"
                    );
                }
            }
            self.live_sessions
                .store(inner.sessions.len(), Ordering::Relaxed);
            stale.len()
        };

        if removed > 0 {
            self.broadcast();
        }
        removed
    }

    /// Publishes the current deduplicated list. The copy is taken under the lock; the rest
    /// runs without it.
    pub fn broadcast(&self) {
        let (seq, sessions) = {
            let mut inner = self.inner.lock();
            inner.broadcast_seq += 1;
            let sessions: Vec<Session> = inner.sessions.values().cloned().collect();
            (inner.broadcast_seq, sessions)
        };
        let list = build_session_list(&sessions, Utc::now());
        self.sink.publish(seq, &list);
    }

    /// Stops every pending timer. Loops observing the same token stop on their own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut inner = self.inner.lock();
        let armed = inner.timers.armed_count();
        inner.timers.cancel_all();
        debug!(timers = armed, "Tracker timers cancelled");
    }

    fn arm_timer(self: &Arc<Self>, timers: &mut TimerTable, session_id: &str, kind: TimerKind) {
        let delay = match kind {
            TimerKind::Quiet => self.settings.quiet_period,
            TimerKind::Completed => self.settings.completed_timeout,
        };
        let tracker: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let owned_id = session_id.to_string();

        timers.arm(session_id, kind, move |generation| {
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        if let Some(tracker) = tracker.upgrade() {
                            tracker.on_timer(&owned_id, kind, generation);
                        }
                    }
                }
            })
        });
    }

    fn on_timer(self: &Arc<Self>, session_id: &str, kind: TimerKind, generation: u64) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.fire_timer(session_id, kind, generation)
        }));
        match outcome {
            Ok(effects) => self.finish(effects),
            Err(_) => warn!(
                session_id = %session_id,
                timer = kind.as_str(),
                "Timer callback panicked"
            ),
        }
    }

    fn fire_timer(self: &Arc<Self>, session_id: &str, kind: TimerKind, generation: u64) -> Effects {
        let now = Utc::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.timers.take_if_current(session_id, kind, generation) {
            trace!(session_id = %session_id, timer = kind.as_str(), "Stale timer ignored");
            return Effects::default();
        }

        match kind {
            TimerKind::Quiet => self.enter_completed(inner, session_id, now, "quiet_period"),
            TimerKind::Completed => {
                let Some(session) = inner.sessions.get_mut(session_id) else {
                    return Effects::default();
                };
                if session.state != SessionState::Completed {
                    return Effects::default();
                }
                session.transition_to(SessionState::Idle, now, "completed_timeout");
                info!(
                    session_id = %session_id,
                    from = "completed",
                    to = "idle",
                    state_seq = session.state_seq,
                    "Session state changed"
                );
                Effects::broadcast()
            }
        }
    }

    fn enter_completed(
        self: &Arc<Self>,
        inner: &mut Inner,
        session_id: &str,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Effects {
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Effects::default();
        };
        if session.state != SessionState::Working {
            return Effects::default();
        }
        session.transition_to(SessionState::Completed, now, reason);
        info!(
            session_id = %session_id,
            from = "working",
            to = "completed",
            reason,
            state_seq = session.state_seq,
            "Session state changed"
        );
        let snapshot = session.clone();
        inner.timers.cancel(session_id, TimerKind::Quiet);
        self.arm_timer(&mut inner.timers, session_id, TimerKind::Completed);
        Effects {
            broadcast: true,
            completed: Some(snapshot),
        }
    }

    fn finish(&self, effects: Effects) {
        if effects.broadcast {
            self.broadcast();
        }
        if let Some(session) = effects.completed {
            self.notify_completion(session);
        }
    }

    fn notify_completion(&self, session: Session) {
        if !self.settings.notify_on_completion {
            return;
        }
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(err) = notifier.notify_completion(&session).await {
                warn!(session_id = %session.session_id, error = %err, "Completion notification failed");
            }
        });
    }
}

/// Most recently active session of `tool` shown in `window_id`.
fn session_for_window(
    sessions: &HashMap<String, Session>,
    window_id: i64,
    tool: Tool,
) -> Option<String> {
    sessions
        .values()
        .filter(|session| session.window_id == Some(window_id) && session.tool == tool)
        .max_by(|a, b| {
            a.last_event_at
                .cmp(&b.last_event_at)
                .then_with(|| b.session_id.cmp(&a.session_id))
        })
        .map(|session| session.session_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemorySink;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use pulse_protocol::naming::tool_from_event_name;
    use pulse_protocol::AttributeValue;
    use std::collections::HashSet;
    use tokio::time::sleep;

    #[derive(Default)]
    struct FakeWindows {
        focused: Mutex<WindowContext>,
        live: Mutex<Option<HashSet<i64>>>,
        focused_calls: AtomicUsize,
    }

    #[async_trait]
    impl WindowResolver for FakeWindows {
        async fn focused(&self) -> WindowContext {
            self.focused_calls.fetch_add(1, Ordering::SeqCst);
            self.focused.lock().clone()
        }

        async fn live_window_ids(&self) -> Option<HashSet<i64>> {
            self.live.lock().clone()
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notified: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_completion(&self, session: &Session) -> Result<(), String> {
            self.notified.lock().push(session.session_id.clone());
            if self.fail {
                Err("notification center unavailable".to_string())
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        tracker: Arc<SessionTracker>,
        sink: Arc<MemorySink>,
        windows: Arc<FakeWindows>,
        notifier: Arc<RecordingNotifier>,
    }

    fn settings(quiet_secs: u64) -> TrackerSettings {
        TrackerSettings {
            quiet_period: Duration::from_secs(quiet_secs),
            completed_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(1800),
            notify_on_completion: false,
        }
    }

    fn harness_with(settings: TrackerSettings, notifier: RecordingNotifier) -> Harness {
        let sink = Arc::new(MemorySink::default());
        let windows = Arc::new(FakeWindows::default());
        let notifier = Arc::new(notifier);
        let tracker = Arc::new(SessionTracker::new(
            settings,
            windows.clone(),
            notifier.clone(),
            sink.clone(),
            CancellationToken::new(),
        ));
        Harness {
            tracker,
            sink,
            windows,
            notifier,
        }
    }

    fn harness(quiet_secs: u64) -> Harness {
        harness_with(settings(quiet_secs), RecordingNotifier::default())
    }

    fn event(name: &str, session_id: Option<&str>) -> TelemetryEvent {
        let mut event = TelemetryEvent::new(name, Utc::now());
        event.session_id = session_id.map(str::to_string);
        event.tool = tool_from_event_name(name);
        event
    }

    #[tokio::test(start_paused = true)]
    async fn conversation_start_creates_working_session() {
        let h = harness(5);
        let id = h
            .tracker
            .process_event(event("codex.conversation_starts", Some("abc")))
            .await;
        assert_eq!(id.as_deref(), Some("abc"));

        let session = h.tracker.session("abc").expect("session");
        assert_eq!(session.state, SessionState::Working);
        assert_eq!(session.tool, Tool::Codex);
        assert_eq!(session.state_seq, 1);
        assert_eq!(h.tracker.live_session_count(), 1);
        assert!(h.sink.latest().expect("broadcast").has_working);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_completes_with_one_broadcast() {
        let h = harness(3);
        h.tracker
            .process_event(event("codex.conversation_starts", Some("abc")))
            .await;
        let before = h.sink.count();

        sleep(Duration::from_millis(2900)).await;
        assert_eq!(h.tracker.session("abc").expect("session").state, SessionState::Working);
        assert_eq!(h.sink.count(), before);

        sleep(Duration::from_millis(200)).await;
        let session = h.tracker.session("abc").expect("session");
        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(session.status_reason, "quiet_period");
        assert_eq!(h.sink.count(), before + 1);
        assert!(!h.sink.latest().expect("broadcast").has_working);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_times_out_to_idle() {
        let h = harness(3);
        h.tracker
            .process_event(event("codex.conversation_starts", Some("abc")))
            .await;
        sleep(Duration::from_secs(4)).await;
        assert_eq!(h.tracker.session("abc").expect("session").state, SessionState::Completed);

        sleep(Duration::from_secs(29)).await;
        assert_eq!(h.tracker.session("abc").expect("session").state, SessionState::Completed);

        sleep(Duration::from_secs(2)).await;
        let session = h.tracker.session("abc").expect("session");
        assert_eq!(session.state, SessionState::Idle);
        assert_eq!(session.state_seq, 3);
        assert_eq!(h.tracker.armed_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_pushes_quiet_deadline_without_new_transition() {
        let h = harness(5);
        h.tracker
            .process_event(event("claude_code.user_prompt", Some("s")))
            .await;
        for _ in 0..3 {
            sleep(Duration::from_secs(4)).await;
            h.tracker
                .process_event(event("claude_code.api_request", Some("s")))
                .await;
        }
        // A repeated trigger while working is also only a reset.
        h.tracker
            .process_event(event("claude_code.user_prompt", Some("s")))
            .await;

        let session = h.tracker.session("s").expect("session");
        assert_eq!(session.state, SessionState::Working);
        assert_eq!(session.state_seq, 1);

        sleep(Duration::from_secs(6)).await;
        assert_eq!(h.tracker.session("s").expect("session").state, SessionState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_while_completed_extends_completed_timer() {
        let h = harness(1);
        h.tracker
            .process_event(event("gemini_cli.user_prompt", Some("g")))
            .await;
        sleep(Duration::from_secs(2)).await;
        assert_eq!(h.tracker.session("g").expect("session").state, SessionState::Completed);

        sleep(Duration::from_secs(25)).await;
        h.tracker
            .process_event(event("gemini_cli.api_response", Some("g")))
            .await;
        sleep(Duration::from_secs(25)).await;
        assert_eq!(h.tracker.session("g").expect("session").state, SessionState::Completed);

        sleep(Duration::from_secs(6)).await;
        assert_eq!(h.tracker.session("g").expect("session").state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_restarts_work_from_completed() {
        let h = harness(1);
        h.tracker
            .process_event(event("codex.user_prompt", Some("c")))
            .await;
        sleep(Duration::from_secs(2)).await;
        h.tracker
            .process_event(event("codex.user_prompt", Some("c")))
            .await;

        let session = h.tracker.session("c").expect("session");
        assert_eq!(session.state, SessionState::Working);
        assert_eq!(session.state_seq, 3);

        // Only the new quiet timer remains; the completed one from the first round is gone.
        assert_eq!(h.tracker.armed_timers(), 1);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(h.tracker.session("c").expect("session").state, SessionState::Working);
    }

    #[tokio::test(start_paused = true)]
    async fn other_events_only_touch() {
        let h = harness(5);
        h.tracker
            .process_event(event("claude_code.api_request", Some("x")))
            .await;
        let mut cost = event("claude_code.cost", Some("x"));
        cost.attributes
            .insert("input_tokens".into(), AttributeValue::Int(40));
        h.tracker.process_event(cost).await;

        let session = h.tracker.session("x").expect("session");
        assert_eq!(session.state, SessionState::Idle);
        assert_eq!(session.state_seq, 0);
        assert_eq!(session.input_tokens, 40);
        assert_eq!(h.tracker.armed_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_triggers_never_create_two_sessions() {
        let h = harness(5);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let tracker = h.tracker.clone();
            tasks.push(tokio::spawn(async move {
                tracker
                    .process_event(event("codex.conversation_starts", Some("dup")))
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(h.tracker.live_session_count(), 1);
        assert_eq!(h.tracker.session("dup").expect("session").state_seq, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn events_without_id_or_tool_are_dropped() {
        let h = harness(5);
        let mut anonymous = TelemetryEvent::new("user_prompt", Utc::now());
        anonymous.tool = None;
        assert!(h.tracker.process_event(anonymous).await.is_none());

        // Known id but unknown tool cannot create either.
        let mut no_tool = TelemetryEvent::new("user_prompt", Utc::now());
        no_tool.session_id = Some("mystery".into());
        assert!(h.tracker.process_event(no_tool).await.is_none());
        assert_eq!(h.tracker.live_session_count(), 0);
        assert_eq!(h.sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_id_synthesizes_from_tool_and_second() {
        let h = harness(5);
        let mut first = event("gemini_cli.user_prompt", None);
        first.timestamp = DateTime::from_timestamp(1_767_225_600, 900_000_000).expect("ts");
        let id = h.tracker.process_event(first).await.expect("attributed");
        assert_eq!(id, "gemini_cli-1767225600");

        let mut same_second = event("gemini_cli.api_request", None);
        same_second.timestamp = DateTime::from_timestamp(1_767_225_600, 100).expect("ts");
        assert_eq!(
            h.tracker.process_event(same_second).await.as_deref(),
            Some("gemini_cli-1767225600")
        );
        assert_eq!(h.tracker.live_session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_id_reuses_session_in_focused_window() {
        let h = harness(5);
        *h.windows.focused.lock() = WindowContext {
            window_id: Some(77),
            project: Some("acme/api:9-auth".into()),
        };
        h.tracker
            .process_event(event("claude_code.user_prompt", Some("explicit")))
            .await;
        let created = h.tracker.session("explicit").expect("session");
        assert_eq!(created.window_id, Some(77));
        assert_eq!(created.project.as_deref(), Some("acme/api:9-auth"));

        let id = h
            .tracker
            .process_event(event("claude_code.api_request", None))
            .await;
        assert_eq!(id.as_deref(), Some("explicit"));
        assert_eq!(h.tracker.live_session_count(), 1);

        // A different tool in the same window does not borrow the session.
        let other = h
            .tracker
            .process_event(event("codex.user_prompt", None))
            .await
            .expect("attributed");
        assert!(other.starts_with("codex-"));
        assert_eq!(h.tracker.live_session_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn known_sessions_skip_window_lookup() {
        let h = harness(5);
        h.tracker
            .process_event(event("codex.user_prompt", Some("k")))
            .await;
        h.tracker
            .process_event(event("codex.api_request", Some("k")))
            .await;
        assert_eq!(h.windows.focused_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_working_sessions_alive_without_state_change() {
        let h = harness(5);
        h.tracker
            .process_event(event("codex.user_prompt", Some("w")))
            .await;
        h.tracker
            .process_event(event("codex.api_request", Some("idle-one")))
            .await;
        h.tracker
            .process_event(event("claude_code.user_prompt", Some("other-tool")))
            .await;
        let broadcasts = h.sink.count();

        sleep(Duration::from_secs(4)).await;
        assert_eq!(h.tracker.process_heartbeat_for_tool(Tool::Codex), 1);
        assert_eq!(h.tracker.process_heartbeat_for_tool(Tool::Codex), 1);
        assert_eq!(h.sink.count(), broadcasts);

        sleep(Duration::from_secs(4)).await;
        assert_eq!(h.tracker.session("w").expect("session").state, SessionState::Working);
        assert_eq!(h.tracker.session("w").expect("session").state_seq, 1);
        assert_eq!(
            h.tracker.session("other-tool").expect("session").state,
            SessionState::Completed
        );
        assert_eq!(
            h.tracker.session("idle-one").expect("session").state,
            SessionState::Idle
        );
        assert!(!h.tracker.process_heartbeat("idle-one"));
        assert!(h.tracker.process_heartbeat("w"));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_entry_points() {
        let h = harness(5);
        assert!(h.tracker.create_session("proc-codex-41", Tool::Codex));
        assert!(!h.tracker.create_session("proc-codex-41", Tool::Codex));
        let session = h.tracker.session("proc-codex-41").expect("session");
        assert_eq!(session.state, SessionState::Idle);

        assert!(h.tracker.keepalive("proc-codex-41"));
        assert!(!h.tracker.keepalive("unknown"));
        // Not working, so there is nothing to complete.
        assert!(!h.tracker.complete_session("proc-codex-41"));

        h.tracker
            .process_event(event("codex.user_prompt", Some("proc-codex-41")))
            .await;
        assert!(h.tracker.complete_session("proc-codex-41"));
        let session = h.tracker.session("proc-codex-41").expect("session");
        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(session.status_reason, "process_exited");

        sleep(Duration::from_secs(31)).await;
        assert_eq!(
            h.tracker.session("proc-codex-41").expect("session").state,
            SessionState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn notifier_runs_on_completion_and_failures_are_contained() {
        let mut settings = settings(1);
        settings.notify_on_completion = true;
        let h = harness_with(
            settings,
            RecordingNotifier {
                fail: true,
                ..RecordingNotifier::default()
            },
        );
        h.tracker
            .process_event(event("claude_code.user_prompt", Some("n")))
            .await;
        sleep(Duration::from_secs(2)).await;

        assert_eq!(*h.notifier.notified.lock(), vec!["n".to_string()]);
        assert_eq!(h.tracker.session("n").expect("session").state, SessionState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn notifier_disabled_by_default() {
        let h = harness(1);
        h.tracker
            .process_event(event("claude_code.user_prompt", Some("n")))
            .await;
        sleep(Duration::from_secs(2)).await;
        assert!(h.notifier.notified.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_removes_stale_sessions_and_their_timers() {
        let h = harness(5);
        h.tracker
            .process_event(event("codex.user_prompt", Some("old")))
            .await;
        h.tracker
            .process_event(event("codex.api_request", Some("fresh")))
            .await;
        assert_eq!(h.tracker.armed_timers(), 1);

        let now = Utc::now();
        assert_eq!(h.tracker.expire_stale(now), 0);

        let later = now + ChronoDuration::seconds(1801);
        assert_eq!(h.tracker.expire_stale(later), 2);
        assert_eq!(h.tracker.live_session_count(), 0);
        assert_eq!(h.tracker.armed_timers(), 0);
        assert!(h.sink.latest().expect("broadcast").sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn orphan_sweep_needs_window_information() {
        let h = harness(5);
        *h.windows.focused.lock() = WindowContext {
            window_id: Some(1),
            project: None,
        };
        h.tracker
            .process_event(event("codex.user_prompt", Some("in-1")))
            .await;
        *h.windows.focused.lock() = WindowContext {
            window_id: Some(2),
            project: None,
        };
        h.tracker
            .process_event(event("codex.user_prompt", Some("in-2")))
            .await;
        *h.windows.focused.lock() = WindowContext::default();
        h.tracker
            .process_event(event("codex.user_prompt", Some("windowless")))
            .await;

        // Resolver unavailable: nothing is removed.
        assert_eq!(h.tracker.sweep_orphans().await, 0);

        *h.windows.live.lock() = Some(HashSet::from([2]));
        assert_eq!(h.tracker.sweep_orphans().await, 1);
        assert!(h.tracker.session("in-1").is_none());
        assert!(h.tracker.session("in-2").is_some());
        assert!(h.tracker.session("windowless").is_some());
        assert_eq!(h.tracker.armed_timers(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_feature_collapses_in_broadcast() {
        let h = harness(1);
        *h.windows.focused.lock() = WindowContext {
            window_id: None,
            project: Some("owner/repo:42-feat".into()),
        };
        h.tracker
            .process_event(event("codex.user_prompt", Some("y")))
            .await;
        sleep(Duration::from_secs(2)).await;
        h.tracker
            .process_event(event("claude_code.user_prompt", Some("x")))
            .await;

        let list = h.sink.latest().expect("broadcast");
        assert_eq!(list.sessions.len(), 1);
        assert_eq!(list.sessions[0].session_id, "x");
        assert_eq!(list.sessions[0].state, SessionState::Working);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_sequence_increases() {
        let h = harness(5);
        h.tracker.broadcast();
        h.tracker.broadcast();
        let seqs: Vec<u64> = h.sink.snapshots().into_iter().map(|(seq, _)| seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers() {
        let h = harness(1);
        h.tracker
            .process_event(event("codex.user_prompt", Some("s")))
            .await;
        h.tracker.shutdown();
        assert_eq!(h.tracker.armed_timers(), 0);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.tracker.session("s").expect("session").state, SessionState::Working);
    }
}
