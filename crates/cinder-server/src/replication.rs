//! Replica bookkeeping and the master-side fanout task.
//!
//! The storage engine enqueues sequenced commands (see
//! [`cinder_core::ReplicationSender`]); the fanout task drains that
//! queue and issues one `ReplicateCommand` RPC per replica, in sequence
//! order. Delivery is best-effort: a failed RPC is logged and skipped,
//! with no retry and no acknowledgement tracking — the sequence ids let
//! a replica notice gaps, nothing more.

use std::sync::{Arc, Mutex, PoisonError};

use cinder_core::{ReplicationCommand, SequencedCommand};
use cinder_proto::key_value_store_client::KeyValueStoreClient;
use cinder_proto::replication_command::CommandType;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

/// Which side of the replication relationship this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Replica,
}

struct Replica {
    address: String,
    client: KeyValueStoreClient<Channel>,
}

/// Tracks replica endpoints (master) or the master address (replica).
pub struct ReplicationManager {
    role: NodeRole,
    master_address: Mutex<Option<String>>,
    replicas: Mutex<Vec<Replica>>,
}

impl ReplicationManager {
    pub fn new(role: NodeRole) -> Self {
        info!(?role, "replication manager initialized");
        Self {
            role,
            master_address: Mutex::new(None),
            replicas: Mutex::new(Vec::new()),
        }
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }

    /// Registers a replica endpoint. Masters only.
    pub fn add_replica(&self, address: &str) -> bool {
        if !self.is_master() {
            warn!(%address, "only master nodes fan out to replicas");
            return false;
        }
        let Some(client) = connect(address) else {
            return false;
        };
        self.lock_replicas().push(Replica {
            address: address.to_owned(),
            client,
        });
        info!(%address, "replica added");
        true
    }

    /// Unregisters a replica endpoint.
    pub fn remove_replica(&self, address: &str) {
        self.lock_replicas().retain(|r| r.address != address);
        info!(%address, "replica removed");
    }

    pub fn replica_count(&self) -> usize {
        self.lock_replicas().len()
    }

    /// Records where this replica's master lives. Informational — no
    /// connection is opened toward the master.
    pub fn set_master_address(&self, address: &str) {
        *self
            .master_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(address.to_owned());
        info!(master = %address, "master address set");
    }

    pub fn master_address(&self) -> Option<String> {
        self.master_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spawns the fanout task over the storage engine's command queue.
    ///
    /// Commands are forwarded in queue order, one synchronous RPC per
    /// replica; the replica list is snapshotted per command so the
    /// mutex is never held across a network call.
    pub fn spawn_fanout(
        self: Arc<Self>,
        mut rx: UnboundedReceiver<SequencedCommand>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let request = to_proto(&cmd);
                let targets: Vec<(String, KeyValueStoreClient<Channel>)> = self
                    .lock_replicas()
                    .iter()
                    .map(|r| (r.address.clone(), r.client.clone()))
                    .collect();
                for (address, mut client) in targets {
                    if let Err(status) = client.replicate_command(request.clone()).await {
                        warn!(
                            %address,
                            sequence_id = cmd.sequence_id,
                            "replication to replica failed: {status}"
                        );
                    }
                }
            }
            info!("replication queue closed; fanout task exiting");
        })
    }

    fn lock_replicas(&self) -> std::sync::MutexGuard<'_, Vec<Replica>> {
        self.replicas.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_proto(cmd: &SequencedCommand) -> cinder_proto::ReplicationCommand {
    let (command_type, key, value, seconds) = match &cmd.command {
        ReplicationCommand::Set { key, value } => {
            (CommandType::Set, key.clone(), value.clone(), 0)
        }
        ReplicationCommand::Delete { key } => {
            (CommandType::Delete, key.clone(), String::new(), 0)
        }
        ReplicationCommand::Expire { key, seconds } => {
            (CommandType::Expire, key.clone(), String::new(), *seconds)
        }
    };
    cinder_proto::ReplicationCommand {
        r#type: command_type as i32,
        key,
        value,
        seconds,
        sequence_id: cmd.sequence_id,
    }
}

fn connect(address: &str) -> Option<KeyValueStoreClient<Channel>> {
    let endpoint = match Endpoint::from_shared(format!("http://{address}")) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(%address, "invalid replica address: {e}");
            return None;
        }
    };
    Some(KeyValueStoreClient::new(endpoint.connect_lazy()))
}
