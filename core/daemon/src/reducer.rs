//! Pure transition rules: given a session's current state and an event name, decide what
//! the tracker should do. Timers and locking live in the tracker.

use pulse_protocol::SessionState;

/// Events that start (or restart) a unit of work.
pub const WORKING_TRIGGERS: [&str; 4] = [
    "claude_code.user_prompt",
    "codex.conversation_starts",
    "codex.user_prompt",
    "gemini_cli.user_prompt",
];

/// Events that show an assistant is still busy without starting new work.
pub const ACTIVITY_EVENTS: [&str; 12] = [
    "claude_code.api_request",
    "claude_code.api_error",
    "claude_code.tool_result",
    "claude_code.tool_decision",
    "codex.api_request",
    "codex.sse_event",
    "codex.tool_decision",
    "codex.tool_result",
    "gemini_cli.api_request",
    "gemini_cli.api_response",
    "gemini_cli.api_error",
    "gemini_cli.tool_call",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    WorkingTrigger,
    Activity,
    Other,
}

pub fn classify(event_name: &str) -> EventClass {
    if WORKING_TRIGGERS.iter().any(|name| *name == event_name) {
        EventClass::WorkingTrigger
    } else if ACTIVITY_EVENTS.iter().any(|name| *name == event_name) {
        EventClass::Activity
    } else {
        EventClass::Other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Move to working and arm the quiet timer.
    StartWorking,
    /// Stay working; push the quiet deadline out.
    ResetQuietTimer,
    /// Stay completed; push the completed deadline out.
    ResetCompletedTimer,
    /// Only `last_event_at` and token counters change.
    Touch,
}

pub fn reduce(state: SessionState, class: EventClass) -> Action {
    match (state, class) {
        (SessionState::Working, EventClass::WorkingTrigger | EventClass::Activity) => {
            Action::ResetQuietTimer
        }
        (_, EventClass::WorkingTrigger) => Action::StartWorking,
        (SessionState::Completed, EventClass::Activity) => Action::ResetCompletedTimer,
        (_, EventClass::Activity | EventClass::Other) => Action::Touch,
    }
}
