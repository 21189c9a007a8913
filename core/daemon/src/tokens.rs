//! Token counters carried on API events.
//!
//! Claude Code and Gemini CLI report usage per request, so values are summed. Codex reports
//! running totals for the conversation, so the latest value replaces the stored one.

use pulse_protocol::{Session, TelemetryEvent, Tool};

enum Mode {
    Sum,
    Replace,
}

struct Counters {
    mode: Mode,
    input: &'static [&'static str],
    output: &'static [&'static str],
    cache: &'static [&'static str],
}

const CLAUDE_CODE: Counters = Counters {
    mode: Mode::Sum,
    input: &["input_tokens"],
    output: &["output_tokens"],
    cache: &["cache_read_tokens", "cache_creation_tokens"],
};

const GEMINI_CLI: Counters = Counters {
    mode: Mode::Sum,
    input: &["input_token_count"],
    output: &["output_token_count"],
    cache: &["cached_content_token_count"],
};

const CODEX: Counters = Counters {
    mode: Mode::Replace,
    input: &["input_token_count"],
    output: &["output_token_count"],
    cache: &["cached_token_count"],
};

fn counters_for(tool: Tool) -> &'static Counters {
    match tool {
        Tool::ClaudeCode => &CLAUDE_CODE,
        Tool::GeminiCli => &GEMINI_CLI,
        Tool::Codex => &CODEX,
    }
}

/// Sum of the listed attributes that are present, or `None` when none are.
fn read(event: &TelemetryEvent, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .filter_map(|key| event.attribute(key).and_then(|value| value.as_u64()))
        .fold(None, |total, value| Some(total.unwrap_or(0).saturating_add(value)))
}

fn apply(mode: &Mode, slot: &mut u64, value: Option<u64>) -> bool {
    let Some(value) = value else {
        return false;
    };
    let next = match mode {
        Mode::Sum => slot.saturating_add(value),
        Mode::Replace => value,
    };
    let changed = next != *slot;
    *slot = next;
    changed
}

/// Updates the session's counters from whatever usage the event carries. Counters the event
/// does not mention are left alone. Returns true if any counter moved.
pub fn apply_token_usage(session: &mut Session, event: &TelemetryEvent) -> bool {
    let counters = counters_for(event.tool.unwrap_or(session.tool));
    let input = apply(&counters.mode, &mut session.input_tokens, read(event, counters.input));
    let output = apply(&counters.mode, &mut session.output_tokens, read(event, counters.output));
    let cache = apply(&counters.mode, &mut session.cache_tokens, read(event, counters.cache));
    input || output || cache
}
