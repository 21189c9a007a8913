//! Process-table fallback for assistants that are running without telemetry enabled.
//!
//! Successive scans are diffed: a newly seen process creates an idle session, a process
//! that is still there keeps its session alive, and one that disappeared completes it.

use parking_lot::Mutex;
use pulse_protocol::Tool;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, warn};

use crate::tracker::SessionTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

pub trait ProcessSource: Send {
    fn list(&mut self) -> Vec<ProcessEntry>;
}

/// Reads the live process table. The `System` is kept between scans so sysinfo can reuse
/// its buffers.
pub struct SysinfoSource {
    system: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SysinfoSource {
    fn list(&mut self) -> Vec<ProcessEntry> {
        self.system.refresh_processes();
        self.system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string(),
            })
            .collect()
    }
}

/// `claude`, `codex`, and `gemini`, either exactly or followed by a `-suffix`.
pub fn tool_for_process_name(name: &str) -> Option<Tool> {
    let name = name.strip_suffix(".exe").unwrap_or(name);
    let name = name.to_ascii_lowercase();
    [
        ("claude", Tool::ClaudeCode),
        ("codex", Tool::Codex),
        ("gemini", Tool::GeminiCli),
    ]
    .into_iter()
    .find(|(base, _)| {
        name == *base
            || name
                .strip_prefix(base)
                .is_some_and(|rest| rest.starts_with('-'))
    })
    .map(|(_, tool)| tool)
}

pub fn session_id_for(tool: Tool, pid: u32) -> String {
    format!("proc-{}-{}", tool, pid)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub appeared: usize,
    pub persisting: usize,
    pub vanished: usize,
}

pub struct ProcessMonitor {
    source: Arc<Mutex<Box<dyn ProcessSource>>>,
    tracker: Arc<SessionTracker>,
    seen: Mutex<HashSet<String>>,
}

impl ProcessMonitor {
    pub fn new(source: Box<dyn ProcessSource>, tracker: Arc<SessionTracker>) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            tracker,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Reads the process table off the async workers, then applies the diff.
    pub async fn scan(&self) -> ScanSummary {
        let source = Arc::clone(&self.source);
        match tokio::task::spawn_blocking(move || source.lock().list()).await {
            Ok(entries) => self.apply(entries),
            Err(err) => {
                warn!(error = %err, "Process scan task failed");
                ScanSummary::default()
            }
        }
    }

    pub fn apply(&self, entries: Vec<ProcessEntry>) -> ScanSummary {
        let current: BTreeMap<String, Tool> = entries
            .iter()
            .filter_map(|entry| {
                tool_for_process_name(&entry.name)
                    .map(|tool| (session_id_for(tool, entry.pid), tool))
            })
            .collect();

        let mut seen = self.seen.lock();
        let mut summary = ScanSummary::default();

        for (session_id, tool) in &current {
            if seen.contains(session_id) {
                self.tracker.keepalive(session_id);
                summary.persisting += 1;
            } else {
                // The session may already exist from an earlier run of the same pid.
                if !self.tracker.create_session(session_id, *tool) {
                    self.tracker.keepalive(session_id);
                }
                summary.appeared += 1;
            }
        }

        let vanished: Vec<String> = seen
            .iter()
            .filter(|session_id| !current.contains_key(*session_id))
            .cloned()
            .collect();
        for session_id in &vanished {
            let completed = self.tracker.complete_session(session_id);
            debug!(session_id = %session_id, completed, "Assistant process exited");
        }
        summary.vanished = vanished.len();

        *seen = current.into_keys().collect();
        if summary != ScanSummary::default() {
            debug!(
                appeared = summary.appeared,
                persisting = summary.persisting,
                vanished = summary.vanished,
                "Process scan"
            );
        }
        summary
    }
}
