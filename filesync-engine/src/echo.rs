//! Echo suppression.
//!
//! When the engine applies a peer's change to the local tree, the watcher
//! reports that change back a moment later. A [`Suppression`] recorded
//! *before* the mutation lets the outgoing path recognise and swallow it.
//! Entries expire after [`SUPPRESSION_TTL`] so a lost watcher event cannot
//! mute a genuine edit forever.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use filesync_core::SyncAction;

pub const SUPPRESSION_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suppression {
    pub action: SyncAction,
    /// Cleared when the mutation the entry was recorded for did not happen;
    /// a disarmed entry is dropped without swallowing anything.
    pub ignore: bool,
    pub recorded_at: Instant,
}

#[derive(Debug, Default)]
pub struct EchoBuffer {
    entries: Mutex<HashMap<PathBuf, Vec<Suppression>>>,
}

impl EchoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect one watcher event of `action` on `path`.
    pub fn push(&self, path: &Path, action: SyncAction) {
        self.push_at(path, action, Instant::now());
    }

    /// Disarm the newest pending entry for `path` and `action`.
    pub fn disarm(&self, path: &Path, action: SyncAction) {
        let mut entries = self.lock();
        if let Some(pending) = entries.get_mut(path) {
            if let Some(entry) = pending.iter_mut().rev().find(|e| e.action == action) {
                entry.ignore = false;
            }
        }
    }

    /// Consume the oldest live entry matching a watcher event. Returns true
    /// when the event must not be emitted.
    pub fn consume(&self, path: &Path, action: SyncAction) -> bool {
        self.consume_at(path, action, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_at(&self, path: &Path, action: SyncAction, now: Instant) {
        let mut entries = self.lock();
        prune(&mut entries, now);
        entries
            .entry(path.to_path_buf())
            .or_default()
            .push(Suppression {
                action,
                ignore: true,
                recorded_at: now,
            });
    }

    fn consume_at(&self, path: &Path, action: SyncAction, now: Instant) -> bool {
        let mut entries = self.lock();
        prune(&mut entries, now);
        let Some(pending) = entries.get_mut(path) else {
            return false;
        };
        let Some(idx) = pending
            .iter()
            .position(|e| e.action == action || e.action == SyncAction::Any)
        else {
            return false;
        };
        let entry = pending.remove(idx);
        if pending.is_empty() {
            entries.remove(path);
        }
        entry.ignore
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Vec<Suppression>>> {
        // A panic while holding this lock leaves the map consistent.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn prune(entries: &mut HashMap<PathBuf, Vec<Suppression>>, now: Instant) {
    entries.retain(|_, pending| {
        pending.retain(|e| now.duration_since(e.recorded_at) <= SUPPRESSION_TTL);
        !pending.is_empty()
    });
}
