//! Name tables: which tool emitted an event, which attribute carries the session id, and
//! which spans stand in for which events.

use crate::model::{AttributeValue, Tool};
use std::collections::BTreeMap;

/// Attribute keys that carry a session correlation id, highest priority first.
pub const SESSION_ID_KEYS: [&str; 4] = ["session.id", "thread_id", "conversation_id", "conversation.id"];

/// Attribute keys consulted when a log record has no body.
pub const EVENT_NAME_KEYS: [&str; 2] = ["event.name", "name"];

pub const SERVICE_NAME_KEY: &str = "service.name";

const EVENT_PREFIXES: [(&str, Tool); 3] = [
    ("claude_code.", Tool::ClaudeCode),
    ("codex.", Tool::Codex),
    ("gemini_cli.", Tool::GeminiCli),
];

const NAME_FRAGMENTS: [(&str, Tool); 3] = [
    ("claude", Tool::ClaudeCode),
    ("codex", Tool::Codex),
    ("gemini", Tool::GeminiCli),
];

/// Span name → synthetic event name, matched exactly.
const SPAN_EXACT: [(&str, &str); 8] = [
    ("claude_code.interaction", "claude_code.user_prompt"),
    ("claude_code.llm_request", "claude_code.api_request"),
    ("claude_code.tool", "claude_code.tool_result"),
    ("session_task.turn", "codex.user_prompt"),
    ("run_turn", "codex.user_prompt"),
    ("stream_request", "codex.api_request"),
    ("handle_tool_call", "codex.tool_result"),
    ("gemini_cli.user_prompt", "gemini_cli.user_prompt"),
];

/// Span name prefix → synthetic event name, matched case-insensitively after exact lookup.
const SPAN_PREFIX: [(&str, &str); 6] = [
    ("claude_code.tool", "claude_code.tool_result"),
    ("claude_code.", "claude_code.api_request"),
    ("codex.turn", "codex.user_prompt"),
    ("codex.", "codex.api_request"),
    ("gemini_cli.tool", "gemini_cli.tool_call"),
    ("gemini_cli.", "gemini_cli.api_request"),
];

/// First correlation id found on the record, then on the resource.
pub fn find_session_id(
    record: &BTreeMap<String, AttributeValue>,
    resource: &BTreeMap<String, AttributeValue>,
) -> Option<String> {
    for attributes in [record, resource] {
        for key in SESSION_ID_KEYS {
            if let Some(value) = attributes.get(key) {
                let value = value.to_plain_string();
                if !value.trim().is_empty() {
                    return Some(value);
                }
            }
        }
    }
    None
}

pub fn tool_from_event_name(event_name: &str) -> Option<Tool> {
    EVENT_PREFIXES
        .iter()
        .find(|(prefix, _)| event_name.starts_with(prefix))
        .map(|(_, tool)| *tool)
}

pub fn tool_from_service_name(service_name: &str) -> Option<Tool> {
    let lowered = service_name.to_ascii_lowercase();
    NAME_FRAGMENTS
        .iter()
        .find(|(fragment, _)| lowered.contains(fragment))
        .map(|(_, tool)| *tool)
}

/// Best-effort only: an event name that merely mentions a tool is assumed to belong to it.
/// Nothing in the senders guarantees this, so it runs after the prefix and service checks.
pub fn tool_from_name_fragment(event_name: &str) -> Option<Tool> {
    tool_from_service_name(event_name)
}

pub fn infer_tool(event_name: &str, service_name: Option<&str>) -> Option<Tool> {
    tool_from_event_name(event_name)
        .or_else(|| service_name.and_then(tool_from_service_name))
        .or_else(|| tool_from_name_fragment(event_name))
}

pub fn span_event_name(span_name: &str) -> Option<&'static str> {
    if let Some((_, event)) = SPAN_EXACT.iter().find(|(name, _)| *name == span_name) {
        return Some(event);
    }
    let lowered = span_name.to_ascii_lowercase();
    SPAN_PREFIX
        .iter()
        .find(|(prefix, _)| lowered.starts_with(prefix))
        .map(|(_, event)| *event)
}
