//! Persistence seams for the storage engine.
//!
//! The engine talks to its journal and snapshot store through narrow
//! traits so a disabled subsystem is a no-op object rather than a flag
//! checked at every call site. The concrete implementations live in
//! `cinder-persistence`; the bridge impls here add the engine's error
//! policy: a failed append or snapshot is logged and the mutation (or
//! the serving loop) carries on.

use cinder_persistence::aof::{self, AofCommand, AofLog};
use cinder_persistence::snapshot::{RdbSnapshot, SnapshotEntry};
use tracing::{error, warn};

/// Write-ahead journal for mutations.
///
/// Called from inside the storage engine's exclusive section, so record
/// order on disk matches apply order.
pub trait Journal: Send + Sync {
    fn record_set(&self, key: &str, value: &str);
    fn record_delete(&self, key: &str);
    fn record_expire(&self, key: &str, seconds: i64);

    /// Reads back every recorded command, in order, for startup replay.
    fn replay(&self) -> Vec<AofCommand>;
}

/// Journal used when the append-only log is disabled.
pub struct NoopJournal;

impl Journal for NoopJournal {
    fn record_set(&self, _key: &str, _value: &str) {}
    fn record_delete(&self, _key: &str) {}
    fn record_expire(&self, _key: &str, _seconds: i64) {}

    fn replay(&self) -> Vec<AofCommand> {
        Vec::new()
    }
}

impl Journal for AofLog {
    fn record_set(&self, key: &str, value: &str) {
        if let Err(e) = self.append_set(key, value) {
            warn!(%key, "journal append failed for SET: {e}");
        }
    }

    fn record_delete(&self, key: &str) {
        if let Err(e) = self.append_delete(key) {
            warn!(%key, "journal append failed for DELETE: {e}");
        }
    }

    fn record_expire(&self, key: &str, seconds: i64) {
        if let Err(e) = self.append_expire(key, seconds) {
            warn!(%key, "journal append failed for EXPIRE: {e}");
        }
    }

    fn replay(&self) -> Vec<AofCommand> {
        match aof::replay(self.path()) {
            Ok(commands) => commands,
            Err(e) => {
                error!(path = %self.path().display(), "journal replay failed: {e}");
                Vec::new()
            }
        }
    }
}

/// Point-in-time snapshot store.
pub trait SnapshotStore: Send + Sync {
    /// Persists the given live entries. Returns whether the snapshot
    /// was written.
    fn save_snapshot(&self, entries: &[SnapshotEntry]) -> bool;

    /// Loads whatever snapshot exists. Corrupt or absent snapshots
    /// yield an empty result.
    fn load_snapshot(&self) -> Vec<SnapshotEntry>;
}

/// Snapshot store used when snapshots are disabled.
pub struct NoopSnapshots;

impl SnapshotStore for NoopSnapshots {
    fn save_snapshot(&self, _entries: &[SnapshotEntry]) -> bool {
        false
    }

    fn load_snapshot(&self) -> Vec<SnapshotEntry> {
        Vec::new()
    }
}

impl SnapshotStore for RdbSnapshot {
    fn save_snapshot(&self, entries: &[SnapshotEntry]) -> bool {
        match self.save(entries) {
            Ok(()) => true,
            Err(e) => {
                // the previous snapshot file is still intact
                error!(path = %self.path().display(), "snapshot save failed: {e}");
                false
            }
        }
    }

    fn load_snapshot(&self) -> Vec<SnapshotEntry> {
        match self.load() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path().display(), "snapshot load failed, starting empty: {e}");
                Vec::new()
            }
        }
    }
}
