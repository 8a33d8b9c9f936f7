//! Thread-safe keyspace with lazy TTL expiration.
//!
//! One reader-writer lock guards the value map and the expiration index
//! together. Reads take shared access; mutations take exclusive access
//! and, still inside the critical section, record to the journal and
//! hand the mutation to the replicator — so journal order and
//! replication order always match apply order.
//!
//! A key logically exists iff it is in the value map and either has no
//! deadline or its deadline is in the future. Read paths treat expired
//! keys as absent and reap them opportunistically.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use cinder_persistence::aof::AofCommand;
use cinder_persistence::snapshot::SnapshotEntry;
use tracing::info;

use crate::persist::{Journal, NoopJournal, NoopSnapshots, SnapshotStore};
use crate::replication::{NoopReplicator, Replicator};

/// The value map and expiration index, guarded as a unit.
///
/// Invariant: every key in `expires` is also in `data`.
#[derive(Default)]
struct Maps {
    data: HashMap<String, String>,
    expires: HashMap<String, Instant>,
}

impl Maps {
    fn apply_replayed(&mut self, command: AofCommand) {
        match command {
            AofCommand::Set { key, value } => {
                self.expires.remove(&key);
                self.data.insert(key, value);
            }
            AofCommand::Delete { key } => {
                self.expires.remove(&key);
                self.data.remove(&key);
            }
            AofCommand::Expire { key, seconds } => {
                if seconds > 0 && self.data.contains_key(&key) {
                    self.expires
                        .insert(key, Instant::now() + Duration::from_secs(seconds as u64));
                }
            }
        }
    }
}

/// Per-shard storage engine.
pub struct Storage {
    maps: RwLock<Maps>,
    journal: Box<dyn Journal>,
    snapshots: Box<dyn SnapshotStore>,
    replicator: Box<dyn Replicator>,
}

impl Storage {
    /// A memory-only engine: no journal, no snapshots, no replication.
    pub fn in_memory() -> Self {
        Self::builder().recover()
    }

    pub fn builder() -> StorageBuilder {
        StorageBuilder::default()
    }

    /// Upserts `key`, clearing any prior TTL.
    pub fn set(&self, key: &str, value: &str) {
        let mut maps = self.write_maps();
        maps.data.insert(key.to_owned(), value.to_owned());
        maps.expires.remove(key);
        self.journal.record_set(key, value);
        self.replicator.replicate_set(key, value);
    }

    /// Returns the value for `key`, or `None` if the key is absent or
    /// expired. An expired key is reaped on the way out.
    pub fn get(&self, key: &str) -> Option<String> {
        {
            let maps = self.read_maps();
            if !maps.data.contains_key(key) {
                return None;
            }
            match maps.expires.get(key) {
                Some(deadline) if *deadline <= Instant::now() => {}
                _ => return maps.data.get(key).cloned(),
            }
        }
        self.reap_expired(key);
        None
    }

    /// Whether `key` logically exists. Reaps expired keys.
    pub fn contains(&self, key: &str) -> bool {
        {
            let maps = self.read_maps();
            if !maps.data.contains_key(key) {
                return false;
            }
            match maps.expires.get(key) {
                Some(deadline) if *deadline <= Instant::now() => {}
                _ => return true,
            }
        }
        self.reap_expired(key);
        false
    }

    /// Removes `key` from both maps. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut maps = self.write_maps();
        maps.expires.remove(key);
        let existed = maps.data.remove(key).is_some();
        if existed {
            self.journal.record_delete(key);
            self.replicator.replicate_delete(key);
        }
        existed
    }

    /// Sets a TTL on an existing key, replacing any prior TTL.
    /// Fails for non-positive seconds and for missing keys.
    pub fn expire(&self, key: &str, seconds: i64) -> bool {
        if seconds <= 0 {
            return false;
        }
        let mut maps = self.write_maps();
        if !maps.data.contains_key(key) {
            return false;
        }
        maps.expires
            .insert(key.to_owned(), Instant::now() + Duration::from_secs(seconds as u64));
        self.journal.record_expire(key, seconds);
        self.replicator.replicate_expire(key, seconds);
        true
    }

    /// Remaining TTL in whole seconds: `-2` if the key is missing,
    /// `-1` if it has no TTL, `0` if expired but not yet reaped.
    pub fn ttl(&self, key: &str) -> i64 {
        let maps = self.read_maps();
        if !maps.data.contains_key(key) {
            return -2;
        }
        match maps.expires.get(key) {
            None => -1,
            Some(deadline) => {
                let now = Instant::now();
                if *deadline <= now {
                    0
                } else {
                    (*deadline - now).as_secs() as i64
                }
            }
        }
    }

    /// Number of entries in the value map, including expired entries
    /// that have not been reaped yet.
    pub fn len(&self) -> usize {
        self.read_maps().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies an inbound replicated SET: no journal, no re-fanout.
    pub fn set_from_replication(&self, key: &str, value: &str) {
        let mut maps = self.write_maps();
        maps.data.insert(key.to_owned(), value.to_owned());
        maps.expires.remove(key);
    }

    /// Applies an inbound replicated DELETE.
    pub fn delete_from_replication(&self, key: &str) -> bool {
        let mut maps = self.write_maps();
        maps.expires.remove(key);
        maps.data.remove(key).is_some()
    }

    /// Applies an inbound replicated EXPIRE.
    pub fn expire_from_replication(&self, key: &str, seconds: i64) -> bool {
        if seconds <= 0 {
            return false;
        }
        let mut maps = self.write_maps();
        if !maps.data.contains_key(key) {
            return false;
        }
        maps.expires
            .insert(key.to_owned(), Instant::now() + Duration::from_secs(seconds as u64));
        true
    }

    /// Captures all live entries under shared access and serializes
    /// them outside the lock. Entries that already expired are skipped.
    pub fn save_snapshot(&self) -> bool {
        let entries = self.live_entries();
        self.snapshots.save_snapshot(&entries)
    }

    fn live_entries(&self) -> Vec<SnapshotEntry> {
        let maps = self.read_maps();
        let now = Instant::now();
        let mut entries = Vec::with_capacity(maps.data.len());
        for (key, value) in &maps.data {
            let remaining = match maps.expires.get(key) {
                Some(deadline) if *deadline <= now => continue,
                Some(deadline) => Some(*deadline - now),
                None => None,
            };
            entries.push(SnapshotEntry {
                key: key.clone(),
                value: value.clone(),
                remaining,
            });
        }
        entries
    }

    /// Re-checks `key` under the exclusive lock and erases it only if
    /// it is still expired. The deadline is read again rather than
    /// trusting the shared-mode check: a writer may have stored a fresh
    /// value or TTL between the two lock acquisitions.
    fn reap_expired(&self, key: &str) {
        let mut maps = self.write_maps();
        let still_expired = maps
            .expires
            .get(key)
            .is_some_and(|deadline| *deadline <= Instant::now());
        if still_expired {
            maps.expires.remove(key);
            maps.data.remove(key);
        }
    }

    fn read_maps(&self) -> RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_maps(&self) -> RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wires the persistence and replication seams, then recovers state.
pub struct StorageBuilder {
    journal: Box<dyn Journal>,
    snapshots: Box<dyn SnapshotStore>,
    replicator: Box<dyn Replicator>,
}

impl Default for StorageBuilder {
    fn default() -> Self {
        Self {
            journal: Box::new(NoopJournal),
            snapshots: Box::new(NoopSnapshots),
            replicator: Box::new(NoopReplicator),
        }
    }
}

impl StorageBuilder {
    pub fn journal(mut self, journal: Box<dyn Journal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn snapshots(mut self, snapshots: Box<dyn SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn replicator(mut self, replicator: Box<dyn Replicator>) -> Self {
        self.replicator = replicator;
        self
    }

    /// Seeds state from the snapshot, replays the journal on top of it
    /// (without re-journaling or fanning out), and returns the engine
    /// ready to serve.
    pub fn recover(self) -> Storage {
        let mut maps = Maps::default();
        let now = Instant::now();

        let snapshot_entries = self.snapshots.load_snapshot();
        let from_snapshot = snapshot_entries.len();
        for entry in snapshot_entries {
            match entry.remaining {
                // expired while the shard was down
                Some(remaining) if remaining.is_zero() => continue,
                Some(remaining) => {
                    maps.expires.insert(entry.key.clone(), now + remaining);
                    maps.data.insert(entry.key, entry.value);
                }
                None => {
                    maps.data.insert(entry.key, entry.value);
                }
            }
        }

        let commands = self.journal.replay();
        let replayed = commands.len();
        for command in commands {
            maps.apply_replayed(command);
        }

        if from_snapshot > 0 || replayed > 0 {
            info!(
                from_snapshot,
                replayed,
                keys = maps.data.len(),
                "storage recovered"
            );
        }

        Storage {
            maps: RwLock::new(maps),
            journal: self.journal,
            snapshots: self.snapshots,
            replicator: self.replicator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use cinder_persistence::aof::AofLog;
    use cinder_persistence::snapshot::RdbSnapshot;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().expect("create temp dir")
    }

    fn persistent_storage(dir: &std::path::Path) -> Storage {
        Storage::builder()
            .journal(Box::new(AofLog::open(dir.join("kvstore.aof")).unwrap()))
            .snapshots(Box::new(RdbSnapshot::new(dir.join("kvstore.rdb"))))
            .recover()
    }

    #[test]
    fn get_after_set() {
        let storage = Storage::in_memory();
        storage.set("name", "Alice");
        assert_eq!(storage.get("name").as_deref(), Some("Alice"));
        assert!(storage.contains("name"));
        assert!(!storage.contains("missing"));
    }

    #[test]
    fn delete_reports_prior_existence() {
        let storage = Storage::in_memory();
        storage.set("k", "v");
        assert!(storage.delete("k"));
        assert_eq!(storage.get("k"), None);
        assert!(!storage.delete("k"));
    }

    #[test]
    fn overwrite_replaces_value() {
        let storage = Storage::in_memory();
        storage.set("k", "first");
        storage.set("k", "second");
        assert_eq!(storage.get("k").as_deref(), Some("second"));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn empty_value_is_storable() {
        let storage = Storage::in_memory();
        storage.set("k", "");
        assert_eq!(storage.get("k").as_deref(), Some(""));
        assert!(storage.contains("k"));
    }

    #[test]
    fn ttl_markers() {
        let storage = Storage::in_memory();
        assert_eq!(storage.ttl("absent"), -2);

        storage.set("forever", "v");
        assert_eq!(storage.ttl("forever"), -1);

        assert!(storage.expire("forever", 100));
        let ttl = storage.ttl("forever");
        assert!((99..=100).contains(&ttl), "ttl was {ttl}");
    }

    #[test]
    fn expire_on_missing_key_fails() {
        let storage = Storage::in_memory();
        assert!(!storage.expire("nope", 10));
        assert!(!storage.expire("nope", 0));
        assert!(!storage.expire("nope", -5));
    }

    #[test]
    fn expire_requires_positive_seconds() {
        let storage = Storage::in_memory();
        storage.set("k", "v");
        assert!(!storage.expire("k", 0));
        assert!(!storage.expire("k", -1));
        assert_eq!(storage.ttl("k"), -1);
    }

    #[test]
    fn set_clears_ttl() {
        let storage = Storage::in_memory();
        storage.set("k", "v");
        assert!(storage.expire("k", 10));
        storage.set("k", "v2");
        assert_eq!(storage.ttl("k"), -1);
    }

    #[test]
    fn expired_key_is_absent_and_reaped() {
        let storage = Storage::in_memory();
        storage.set("tmp", "v");
        assert!(storage.expire("tmp", 1));

        thread::sleep(Duration::from_millis(1200));

        assert_eq!(storage.get("tmp"), None);
        assert!(!storage.contains("tmp"));
        // the reap removed the entry entirely
        assert_eq!(storage.ttl("tmp"), -2);
        assert_eq!(storage.len(), 0);
    }

    #[test]
    fn ttl_reports_zero_for_expired_unreaped_key() {
        let storage = Storage::in_memory();
        storage.set("tmp", "v");
        assert!(storage.expire("tmp", 1));

        thread::sleep(Duration::from_millis(1200));

        // ttl alone does not reap
        assert_eq!(storage.ttl("tmp"), 0);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn delete_removes_expiration_too() {
        let storage = Storage::in_memory();
        storage.set("k", "v");
        assert!(storage.expire("k", 100));
        assert!(storage.delete("k"));

        storage.set("k", "fresh");
        assert_eq!(storage.ttl("k"), -1);
    }

    #[test]
    fn replication_apply_bypasses_journal() {
        let dir = temp_dir();
        let storage = persistent_storage(dir.path());

        storage.set_from_replication("a", "1");
        storage.set_from_replication("b", "2");
        assert!(storage.expire_from_replication("b", 60));
        assert!(storage.delete_from_replication("a"));

        assert_eq!(storage.get("b").as_deref(), Some("2"));
        assert_eq!(storage.get("a"), None);

        // nothing was journalled
        let raw = std::fs::read_to_string(dir.path().join("kvstore.aof")).unwrap();
        assert!(raw.is_empty(), "aof should be empty, had: {raw:?}");
    }

    #[test]
    fn recovery_from_journal_only() {
        let dir = temp_dir();
        {
            let storage = persistent_storage(dir.path());
            storage.set("a", "1");
            storage.set("b", "2");
            storage.delete("a");
            assert!(storage.expire("b", 60));
            // dropped without a snapshot, like a crash after the last append
        }

        let recovered = persistent_storage(dir.path());
        assert_eq!(recovered.get("a"), None);
        assert_eq!(recovered.get("b").as_deref(), Some("2"));
        let ttl = recovered.ttl("b");
        assert!((55..=60).contains(&ttl), "ttl was {ttl}");
    }

    #[test]
    fn recovery_from_snapshot_plus_journal_tail() {
        let dir = temp_dir();
        {
            let storage = persistent_storage(dir.path());
            storage.set("a", "1");
            storage.set("b", "2");
            assert!(storage.save_snapshot());
            storage.set("c", "3");
            storage.delete("b");
            storage.delete("a");
        }

        let recovered = persistent_storage(dir.path());
        assert_eq!(recovered.get("a"), None);
        assert_eq!(recovered.get("b"), None);
        assert_eq!(recovered.get("c").as_deref(), Some("3"));
        assert_eq!(recovered.len(), 1);
    }

    #[test]
    fn recovery_preserves_embedded_newlines() {
        let dir = temp_dir();
        {
            let storage = persistent_storage(dir.path());
            storage.set("k", "line1\nline2");
        }

        let recovered = persistent_storage(dir.path());
        assert_eq!(recovered.get("k").as_deref(), Some("line1\nline2"));
    }

    #[test]
    fn recovery_seeds_from_snapshot_file() {
        let dir = temp_dir();
        std::fs::write(
            dir.path().join("kvstore.rdb"),
            "REDIS0011\nSET user:1:name Alice\nSET cfg:v 1.0.0\nEOF\n",
        )
        .unwrap();

        let storage = persistent_storage(dir.path());
        assert_eq!(storage.get("user:1:name").as_deref(), Some("Alice"));
        assert_eq!(storage.get("cfg:v").as_deref(), Some("1.0.0"));
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn recovery_drops_entries_expired_during_downtime() {
        let dir = temp_dir();
        std::fs::write(
            dir.path().join("kvstore.rdb"),
            "REDIS0011\nEXPIRE dead 0\nSET dead gone\nSET alive here\nEOF\n",
        )
        .unwrap();

        let storage = persistent_storage(dir.path());
        assert_eq!(storage.get("dead"), None);
        assert_eq!(storage.get("alive").as_deref(), Some("here"));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn snapshot_skips_expired_entries() {
        let dir = temp_dir();
        let storage = persistent_storage(dir.path());
        storage.set("keep", "v");
        storage.set("drop", "v");
        assert!(storage.expire("drop", 1));

        thread::sleep(Duration::from_millis(1200));
        assert!(storage.save_snapshot());

        let raw = std::fs::read_to_string(dir.path().join("kvstore.rdb")).unwrap();
        assert!(raw.contains("SET keep v"));
        assert!(!raw.contains("drop"));
    }

    #[test]
    fn snapshot_stores_remaining_seconds() {
        let dir = temp_dir();
        let storage = persistent_storage(dir.path());
        storage.set("session", "tok");
        assert!(storage.expire("session", 300));
        assert!(storage.save_snapshot());

        let raw = std::fs::read_to_string(dir.path().join("kvstore.rdb")).unwrap();
        let expire_line = raw
            .lines()
            .find(|line| line.starts_with("EXPIRE session "))
            .expect("expire line present");
        let seconds: u64 = expire_line.rsplit(' ').next().unwrap().parse().unwrap();
        assert!((295..=300).contains(&seconds), "remaining was {seconds}");
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let storage = Arc::new(Storage::in_memory());
        let mut handles = Vec::new();

        for t in 0..4 {
            let storage = Arc::clone(&storage);
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    let key = format!("key_{t}_{i}");
                    storage.set(&key, "v");
                    assert_eq!(storage.get(&key).as_deref(), Some("v"));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(storage.len(), 1000);
    }
}
