//! Where snapshots go.
//!
//! The file sink rewrites the session list atomically and only when the content changes;
//! `updated_at` alone never causes a write.

use fs_err as fs;
use parking_lot::Mutex;
use pulse_protocol::{SessionList, SessionListItem};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub trait SnapshotSink: Send + Sync {
    /// `seq` increases with every broadcast. Implementations drop anything older than what
    /// they have already published.
    fn publish(&self, seq: u64, snapshot: &SessionList);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Written,
    Unchanged,
    Stale,
}

#[derive(Debug, Default)]
struct SinkState {
    last_seq: Option<u64>,
    last_hash: Option<md5::Digest>,
}

#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    state: Mutex<SinkState>,
}

#[derive(Serialize)]
struct HashedContent<'a> {
    sessions: &'a [SessionListItem],
    has_working: bool,
}

pub fn content_hash(snapshot: &SessionList) -> Result<md5::Digest, String> {
    let content = HashedContent {
        sessions: &snapshot.sessions,
        has_working: snapshot.has_working,
    };
    let bytes = serde_json::to_vec(&content)
        .map_err(|err| format!("Failed to serialize snapshot content: {}", err))?;
    Ok(md5::compute(bytes))
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(SinkState::default()),
        }
    }

    pub fn publish_snapshot(
        &self,
        seq: u64,
        snapshot: &SessionList,
    ) -> Result<PublishOutcome, String> {
        let mut state = self.state.lock();
        if state.last_seq.is_some_and(|last| seq <= last) {
            return Ok(PublishOutcome::Stale);
        }
        state.last_seq = Some(seq);

        let hash = content_hash(snapshot)?;
        if state.last_hash == Some(hash) {
            return Ok(PublishOutcome::Unchanged);
        }

        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|err| format!("Failed to serialize snapshot: {}", err))?;
        write_atomic(&self.path, &bytes)?;
        state.last_hash = Some(hash);
        Ok(PublishOutcome::Written)
    }
}

impl SnapshotSink for FileSink {
    fn publish(&self, seq: u64, snapshot: &SessionList) {
        match self.publish_snapshot(seq, snapshot) {
            Ok(PublishOutcome::Written) => debug!(
                seq,
                sessions = snapshot.sessions.len(),
                has_working = snapshot.has_working,
                path = %self.path.display(),
                "Session snapshot written"
            ),
            Ok(PublishOutcome::Unchanged) => {}
            Ok(PublishOutcome::Stale) => debug!(seq, "Dropping stale snapshot"),
            Err(err) => warn!(error = %err, path = %self.path.display(), "Failed to write snapshot"),
        }
    }
}

/// Write to a sibling temp file, then rename over the target so readers never observe a
/// partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| "Output path has no parent".to_string())?;
    fs::create_dir_all(parent)
        .map_err(|err| format!("Failed to create output directory: {}", err))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| "Output path has no file name".to_string())?;
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    fs::write(&temp_path, bytes).map_err(|err| format!("Failed to write temp file: {}", err))?;
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(format!("Failed to replace output file: {}", err));
    }
    Ok(())
}

/// Keeps every published snapshot in memory. Used by tests to observe broadcasts.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    published: Mutex<Vec<(u64, SessionList)>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn snapshots(&self) -> Vec<(u64, SessionList)> {
        self.published.lock().clone()
    }

    pub fn latest(&self) -> Option<SessionList> {
        self.published.lock().last().map(|(_, list)| list.clone())
    }

    pub fn count(&self) -> usize {
        self.published.lock().len()
    }
}

#[cfg(test)]
impl SnapshotSink for MemorySink {
    fn publish(&self, seq: u64, snapshot: &SessionList) {
        self.published.lock().push((seq, snapshot.clone()));
    }
}
