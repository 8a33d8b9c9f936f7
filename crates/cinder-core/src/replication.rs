//! Master-side replication seam.
//!
//! The storage engine publishes each mutation through a [`Replicator`]
//! from inside its exclusive section. The real implementation,
//! [`ReplicationSender`], stamps a sequence id and pushes onto an
//! unbounded ordered queue; a single consumer (the server's fanout
//! task) drains the queue and issues one RPC per replica, so wire order
//! always matches apply order without holding the storage lock across
//! network calls.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

/// One mutation to mirror onto replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationCommand {
    Set { key: String, value: String },
    Delete { key: String },
    Expire { key: String, seconds: i64 },
}

/// A replication command stamped with its master-assigned sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedCommand {
    pub sequence_id: i64,
    pub command: ReplicationCommand,
}

/// Mutation fanout hook called by the storage engine.
pub trait Replicator: Send + Sync {
    fn replicate_set(&self, key: &str, value: &str);
    fn replicate_delete(&self, key: &str);
    fn replicate_expire(&self, key: &str, seconds: i64);
}

/// Replicator for replicas and standalone nodes: drops everything.
pub struct NoopReplicator;

impl Replicator for NoopReplicator {
    fn replicate_set(&self, _key: &str, _value: &str) {}
    fn replicate_delete(&self, _key: &str) {}
    fn replicate_expire(&self, _key: &str, _seconds: i64) {}
}

/// Stamps mutations with strictly increasing sequence ids (starting at
/// 0) and enqueues them for the fanout task.
///
/// Both the stamp and the enqueue happen while the caller holds the
/// storage engine's exclusive lock, so queue order, sequence order, and
/// apply order are all the same order.
pub struct ReplicationSender {
    tx: UnboundedSender<SequencedCommand>,
    next_sequence: AtomicI64,
}

impl ReplicationSender {
    /// Creates the sender and the receiving end for the fanout task.
    pub fn channel() -> (Self, UnboundedReceiver<SequencedCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Self {
            tx,
            next_sequence: AtomicI64::new(0),
        };
        (sender, rx)
    }

    fn push(&self, command: ReplicationCommand) {
        let sequence_id = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let sequenced = SequencedCommand {
            sequence_id,
            command,
        };
        if self.tx.send(sequenced).is_err() {
            warn!(sequence_id, "replication queue closed; command dropped");
        }
    }
}

impl Replicator for ReplicationSender {
    fn replicate_set(&self, key: &str, value: &str) {
        self.push(ReplicationCommand::Set {
            key: key.to_owned(),
            value: value.to_owned(),
        });
    }

    fn replicate_delete(&self, key: &str) {
        self.push(ReplicationCommand::Delete {
            key: key.to_owned(),
        });
    }

    fn replicate_expire(&self, key: &str, seconds: i64) {
        self.push(ReplicationCommand::Expire {
            key: key.to_owned(),
            seconds,
        });
    }
}
