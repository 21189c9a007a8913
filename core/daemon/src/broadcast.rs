//! Collapses live sessions into the list consumers display.
//!
//! Sessions that belong to the same unit of work (same feature number, same project, or
//! failing both, the same session) share a key, and only the most relevant one is shown.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use pulse_protocol::{Session, SessionList, SessionListItem, SessionState};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;

static FEATURE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":(\d+)").expect("feature number pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Feature(u64),
    Project(String),
    Session(String),
}

/// `owner/repo:42-feat` keys on feature 42. A project without a feature number keys on the
/// whole project string; a session without a project stands alone.
pub fn dedup_key(session: &Session) -> DedupKey {
    let project = session
        .project
        .as_deref()
        .map(str::trim)
        .filter(|project| !project.is_empty());

    match project {
        Some(project) => FEATURE_NUMBER
            .captures(project)
            .and_then(|captures| captures.get(1))
            .and_then(|digits| digits.as_str().parse::<u64>().ok())
            .map(DedupKey::Feature)
            .unwrap_or_else(|| DedupKey::Project(project.to_string())),
        None => DedupKey::Session(session.session_id.clone()),
    }
}

/// Most relevant first: higher state priority, then most recent state change, then id.
pub fn rank(a: &Session, b: &Session) -> Ordering {
    b.state
        .priority()
        .cmp(&a.state.priority())
        .then_with(|| b.state_changed_at.cmp(&a.state_changed_at))
        .then_with(|| a.session_id.cmp(&b.session_id))
}

/// One representative per key, ordered by [`rank`].
pub fn deduplicate(sessions: &[Session]) -> Vec<&Session> {
    let mut best: HashMap<DedupKey, &Session> = HashMap::new();
    for session in sessions {
        if session.state == SessionState::Expired {
            continue;
        }
        best.entry(dedup_key(session))
            .and_modify(|current| {
                if rank(session, *current) == Ordering::Less {
                    *current = session;
                }
            })
            .or_insert(session);
    }

    let mut selected: Vec<&Session> = best.into_values().collect();
    selected.sort_by(|a, b| rank(a, b));
    selected
}

pub fn build_session_list(sessions: &[Session], now: DateTime<Utc>) -> SessionList {
    let selected = deduplicate(sessions);
    let has_working = selected
        .iter()
        .any(|session| session.state == SessionState::Working);
    SessionList {
        sessions: selected.into_iter().map(SessionListItem::from).collect(),
        has_working,
        updated_at: now,
    }
}
