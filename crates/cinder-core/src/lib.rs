//! cinder-core: the per-shard storage engine.
//!
//! Owns the in-memory keyspace (value map + expiration index behind one
//! reader-writer lock), lazy TTL expiration, crash recovery, and the
//! background snapshotter. Persistence and replication are pluggable
//! seams with no-op defaults, so the same engine serves masters,
//! replicas, and memory-only test instances.

pub mod persist;
pub mod replication;
pub mod snapshotter;
pub mod storage;

pub use persist::{Journal, NoopJournal, NoopSnapshots, SnapshotStore};
pub use replication::{
    NoopReplicator, ReplicationCommand, ReplicationSender, Replicator, SequencedCommand,
};
pub use snapshotter::Snapshotter;
pub use storage::{Storage, StorageBuilder};
