use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{atomic_write, Paths};
use crate::error::WreckitError;

const STALE_AFTER: chrono::Duration = chrono::Duration::hours(24);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchProgress {
    pub schema_version: u32,
    pub session_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parallel: u32,
    pub queued_items: Vec<String>,
    pub current_item: Option<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl BatchProgress {
    pub fn new(session_id: String, parallel: u32, queued_items: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: 1,
            session_id,
            pid: std::process::id(),
            started_at: now,
            updated_at: now,
            parallel,
            queued_items,
            current_item: None,
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Whether `id` appears in exactly zero of the mutually-exclusive buckets.
    fn is_untracked(&self, id: &str) -> bool {
        !self.queued_items.iter().any(|q| q == id)
            && self.current_item.as_deref() != Some(id)
            && !self.completed.iter().any(|c| c == id)
            && !self.failed.iter().any(|f| f == id)
            && !self.skipped.iter().any(|s| s == id)
    }

    /// Move `id` out of `queued_items` and into `current_item`. No-op if `id`
    /// is not queued (callers should check first; kept a no-op rather than a
    /// panic so a stale resume never crashes the orchestrator).
    pub fn start_item(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(pos) = self.queued_items.iter().position(|q| q == id) {
            self.queued_items.remove(pos);
            self.current_item = Some(id.to_string());
            self.updated_at = now.max(self.updated_at);
        }
    }

    fn finish_current(&mut self, now: DateTime<Utc>, bucket: impl FnOnce(&mut Self, String)) {
        if let Some(id) = self.current_item.take() {
            bucket(self, id);
            self.updated_at = now.max(self.updated_at);
        }
    }

    pub fn complete_current(&mut self, now: DateTime<Utc>) {
        self.finish_current(now, |s, id| s.completed.push(id));
    }

    pub fn fail_current(&mut self, now: DateTime<Utc>) {
        self.finish_current(now, |s, id| s.failed.push(id));
    }

    pub fn skip_current(&mut self, now: DateTime<Utc>) {
        self.finish_current(now, |s, id| s.skipped.push(id));
    }

    /// Whether this record is stale per §3: older than 24h, or its owning pid
    /// is no longer a live process on this host.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.updated_at) > STALE_AFTER || !is_pid_alive(self.pid)
    }
}

fn is_pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Returns the parsed record, or `None` if the file is absent, unreadable, or
/// schema-invalid — per the spec's `readBatchProgress` contract, a corrupt
/// progress file is treated the same as a missing one, never an error.
pub fn read_batch_progress(paths: &Paths) -> Option<BatchProgress> {
    let contents = std::fs::read_to_string(paths.batch_progress_json()).ok()?;
    serde_json::from_str(&contents).ok()
}

pub fn write_batch_progress(paths: &Paths, progress: &mut BatchProgress) -> Result<(), WreckitError> {
    progress.updated_at = Utc::now().max(progress.updated_at);
    let json = serde_json::to_vec_pretty(progress).map_err(|e| WreckitError::InvalidJson {
        path: paths.batch_progress_json(),
        source: e,
    })?;
    atomic_write(&paths.batch_progress_json(), &json)
}

/// Remove the progress file and its lock sidecar. Idempotent: a missing file
/// is not an error.
pub fn clear_batch_progress(paths: &Paths) -> Result<(), WreckitError> {
    for path in [paths.batch_progress_json(), paths.root.join("wreckit.lock"), paths.root.join("wreckit.pid")] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(WreckitError::Io(e)),
        }
    }
    Ok(())
}
