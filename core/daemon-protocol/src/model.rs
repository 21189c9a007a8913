//! Typed telemetry events, sessions, and the snapshot handed to consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Assistant CLIs whose telemetry we understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    ClaudeCode,
    Codex,
    GeminiCli,
}

impl Tool {
    pub const ALL: [Tool; 3] = [Tool::ClaudeCode, Tool::Codex, Tool::GeminiCli];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::ClaudeCode => "claude_code",
            Tool::Codex => "codex",
            Tool::GeminiCli => "gemini_cli",
        }
    }
}

impl FromStr for Tool {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Tool::ALL
            .into_iter()
            .find(|tool| tool.as_str() == value)
            .ok_or_else(|| format!("unknown tool: {}", value))
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Working,
    Completed,
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Working => "working",
            SessionState::Completed => "completed",
            SessionState::Expired => "expired",
        }
    }

    /// Ranking used when several sessions collapse into one displayed entry.
    pub fn priority(&self) -> u8 {
        match self {
            SessionState::Working => 3,
            SessionState::Completed => 2,
            SessionState::Idle => 1,
            SessionState::Expired => 0,
        }
    }
}

/// Scalar attribute value carried by a telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Bool(bool),
    Double(f64),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Lenient numeric read; senders are inconsistent about ints vs strings.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttributeValue::Int(value) => u64::try_from(*value).ok(),
            AttributeValue::Double(value) if value.is_finite() && *value >= 0.0 => {
                Some(value.trunc() as u64)
            }
            AttributeValue::String(value) => value.trim().parse().ok(),
            AttributeValue::Bool(_) | AttributeValue::Double(_) => None,
        }
    }

    pub fn to_plain_string(&self) -> String {
        match self {
            AttributeValue::String(value) => value.clone(),
            AttributeValue::Int(value) => value.to_string(),
            AttributeValue::Bool(value) => value.to_string(),
            AttributeValue::Double(value) => value.to_string(),
        }
    }
}

/// One normalized unit of input, produced by the decoder and consumed once by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub tool: Option<Tool>,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl TelemetryEvent {
    pub fn new(event_name: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_name: event_name.into(),
            timestamp,
            session_id: None,
            tool: None,
            attributes: BTreeMap::new(),
            trace_id: None,
            span_id: None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub tool: Tool,
    pub state: SessionState,
    pub project: Option<String>,
    pub window_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_tokens: u64,
    pub state_seq: u64,
    pub status_reason: String,
}

impl Session {
    pub fn new(session_id: impl Into<String>, tool: Tool, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            tool,
            state: SessionState::Idle,
            project: None,
            window_id: None,
            created_at: now,
            last_event_at: now,
            state_changed_at: now,
            input_tokens: 0,
            output_tokens: 0,
            cache_tokens: 0,
            state_seq: 0,
            status_reason: "created".to_string(),
        }
    }

    /// Timestamps never move backwards, even when events arrive out of order.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_event_at {
            self.last_event_at = now;
        }
    }

    /// Returns false when the session is already in `next`.
    pub fn transition_to(
        &mut self,
        next: SessionState,
        now: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> bool {
        if self.state == next {
            return false;
        }
        self.state = next;
        if now > self.state_changed_at {
            self.state_changed_at = now;
        }
        self.state_seq += 1;
        self.status_reason = reason.into();
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionListItem {
    pub session_id: String,
    pub tool: Tool,
    pub state: SessionState,
    pub project: Option<String>,
    pub window_id: Option<i64>,
}

impl From<&Session> for SessionListItem {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            tool: session.tool,
            state: session.state,
            project: session.project.clone(),
            window_id: session.window_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionListItem>,
    pub has_working: bool,
    pub updated_at: DateTime<Utc>,
}
