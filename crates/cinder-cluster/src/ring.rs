//! Consistent hash ring with virtual nodes.
//!
//! Each shard contributes `V` virtual-node entries to an ordered ring
//! of 32-bit hashes; a key belongs to the first entry clockwise from
//! its own hash, wrapping at the top. With enough virtual nodes the
//! keyspace spreads evenly and adding or removing a shard only remaps
//! roughly `1/N` of the keys.
//!
//! The hash is FNV-1a (32-bit) for deterministic, endian-independent
//! placement; two virtual nodes colliding on the same hash resolve
//! last-writer-wins in insertion order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

/// Virtual-node entries per shard when none is specified.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Metadata for one shard in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub shard_id: String,
    /// Primary address, `host:port`.
    pub address: String,
    pub replica_addresses: Vec<String>,
    pub available: bool,
    /// Approximate key count; informational.
    pub key_count: u64,
}

impl ShardInfo {
    pub fn new(shard_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            address: address.into(),
            replica_addresses: Vec::new(),
            available: true,
            key_count: 0,
        }
    }
}

#[derive(Default)]
struct RingState {
    /// hash -> shard id, ordered for clockwise lookups.
    ring: BTreeMap<u32, String>,
    /// shard id -> metadata.
    shards: HashMap<String, ShardInfo>,
}

/// Thread-safe consistent hash ring.
pub struct HashRing {
    virtual_nodes: usize,
    state: Mutex<RingState>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::with_virtual_nodes(DEFAULT_VIRTUAL_NODES)
    }

    pub fn with_virtual_nodes(virtual_nodes: usize) -> Self {
        let virtual_nodes = if virtual_nodes == 0 {
            DEFAULT_VIRTUAL_NODES
        } else {
            virtual_nodes
        };
        Self {
            virtual_nodes,
            state: Mutex::new(RingState::default()),
        }
    }

    /// Adds a shard and its virtual nodes. Returns false if the shard
    /// id is already present.
    pub fn add_shard(&self, shard_id: &str, address: &str) -> bool {
        let mut state = self.lock_state();
        if state.shards.contains_key(shard_id) {
            warn!(%shard_id, "shard already in ring");
            return false;
        }
        state
            .shards
            .insert(shard_id.to_owned(), ShardInfo::new(shard_id, address));
        for i in 0..self.virtual_nodes {
            let hash = fnv1a_32(virtual_node_key(shard_id, i).as_bytes());
            state.ring.insert(hash, shard_id.to_owned());
        }
        debug!(%shard_id, %address, virtual_nodes = self.virtual_nodes, "shard added to ring");
        true
    }

    /// Removes a shard and its virtual nodes. Returns false if the
    /// shard id is unknown.
    pub fn remove_shard(&self, shard_id: &str) -> bool {
        let mut state = self.lock_state();
        if state.shards.remove(shard_id).is_none() {
            warn!(%shard_id, "shard not in ring");
            return false;
        }
        for i in 0..self.virtual_nodes {
            let hash = fnv1a_32(virtual_node_key(shard_id, i).as_bytes());
            state.ring.remove(&hash);
        }
        debug!(%shard_id, "shard removed from ring");
        true
    }

    /// The shard owning `key`: the first ring entry at or clockwise
    /// from the key's hash, wrapping to the smallest entry. `None` on
    /// an empty ring.
    pub fn shard_for_key(&self, key: &str) -> Option<String> {
        let state = self.lock_state();
        if state.ring.is_empty() {
            return None;
        }
        let hash = fnv1a_32(key.as_bytes());
        state
            .ring
            .range(hash..)
            .next()
            .or_else(|| state.ring.iter().next())
            .map(|(_, shard_id)| shard_id.clone())
    }

    pub fn shard(&self, shard_id: &str) -> Option<ShardInfo> {
        self.lock_state().shards.get(shard_id).cloned()
    }

    pub fn all_shards(&self) -> Vec<ShardInfo> {
        self.lock_state().shards.values().cloned().collect()
    }

    pub fn shard_count(&self) -> usize {
        self.lock_state().shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().shards.is_empty()
    }

    /// Number of virtual-node entries currently on the ring.
    pub fn ring_len(&self) -> usize {
        self.lock_state().ring.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

fn virtual_node_key(shard_id: &str, index: usize) -> String {
    format!("{shard_id}:{index}")
}

/// FNV-1a, 32-bit: offset basis `0x811C9DC5`, prime `0x01000193`,
/// wrapping multiplication. Chosen for bit-exact reproducibility of
/// on-ring placement across implementations.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811C_9DC5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
