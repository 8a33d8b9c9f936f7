//! Client-side shard router.
//!
//! For every operation: resolve the owning shard on the ring, fetch or
//! lazily create the pooled gRPC client for that shard, dispatch the
//! RPC, and account the outcome in the routing stats. Connections are
//! multiplexed HTTP/2 channels and live for the router's lifetime
//! unless explicitly removed.
//!
//! Routing is deterministic: for a fixed ring the same key always
//! reaches the same shard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use cinder_proto::key_value_store_client::KeyValueStoreClient;
use cinder_proto::{
    ContainsRequest, DeleteRequest, ExpireRequest, GetRequest, SetRequest, TtlRequest,
};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use crate::ring::HashRing;

/// Counters kept by the router.
///
/// `total == successful + failed` and the per-shard counts sum to the
/// number of requests that reached a shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub per_shard: HashMap<String, u64>,
}

/// Routes operations to the shard that owns each key.
pub struct ShardRouter {
    ring: Arc<HashRing>,
    connections: Mutex<HashMap<String, KeyValueStoreClient<Channel>>>,
    stats: Mutex<RoutingStats>,
}

impl ShardRouter {
    /// Creates a router over the given ring, opening a connection for
    /// every shard already present.
    pub fn new(ring: Arc<HashRing>) -> Self {
        let router = Self {
            ring,
            connections: Mutex::new(HashMap::new()),
            stats: Mutex::new(RoutingStats::default()),
        };
        for shard in router.ring.all_shards() {
            if let Some(client) = connect(&shard.address) {
                router
                    .lock_connections()
                    .insert(shard.shard_id.clone(), client);
                debug!(shard_id = %shard.shard_id, address = %shard.address, "shard connection created");
            }
        }
        router
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    /// Stores `value` under `key` on the owning shard.
    pub async fn set(&self, key: &str, value: &str) -> bool {
        let Some((shard_id, mut client)) = self.route(key) else {
            return false;
        };
        let request = SetRequest {
            key: key.to_owned(),
            value: value.to_owned(),
        };
        match client.set(request).await {
            Ok(response) => {
                let success = response.into_inner().success;
                self.record_outcome(&shard_id, success);
                success
            }
            Err(status) => {
                warn!(%key, %shard_id, "SET rpc failed: {status}");
                self.record_outcome(&shard_id, false);
                false
            }
        }
    }

    /// Fetches the value for `key`, or `None` if absent.
    pub async fn get(&self, key: &str) -> Option<String> {
        let (shard_id, mut client) = self.route(key)?;
        let request = GetRequest {
            key: key.to_owned(),
        };
        match client.get(request).await {
            Ok(response) => {
                self.record_outcome(&shard_id, true);
                let response = response.into_inner();
                response.found.then_some(response.value)
            }
            Err(status) => {
                warn!(%key, %shard_id, "GET rpc failed: {status}");
                self.record_outcome(&shard_id, false);
                None
            }
        }
    }

    /// Removes `key`. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> bool {
        let Some((shard_id, mut client)) = self.route(key) else {
            return false;
        };
        let request = DeleteRequest {
            key: key.to_owned(),
        };
        match client.delete(request).await {
            Ok(response) => {
                self.record_outcome(&shard_id, true);
                response.into_inner().found
            }
            Err(status) => {
                warn!(%key, %shard_id, "DELETE rpc failed: {status}");
                self.record_outcome(&shard_id, false);
                false
            }
        }
    }

    /// Whether `key` exists on its shard.
    pub async fn contains(&self, key: &str) -> bool {
        let Some((shard_id, mut client)) = self.route(key) else {
            return false;
        };
        let request = ContainsRequest {
            key: key.to_owned(),
        };
        match client.contains(request).await {
            Ok(response) => {
                self.record_outcome(&shard_id, true);
                response.into_inner().exists
            }
            Err(status) => {
                warn!(%key, %shard_id, "CONTAINS rpc failed: {status}");
                self.record_outcome(&shard_id, false);
                false
            }
        }
    }

    /// Sets a TTL on `key`. Returns whether the TTL was applied.
    pub async fn expire(&self, key: &str, seconds: i64) -> bool {
        let Some((shard_id, mut client)) = self.route(key) else {
            return false;
        };
        let request = ExpireRequest {
            key: key.to_owned(),
            seconds,
        };
        match client.expire(request).await {
            Ok(response) => {
                self.record_outcome(&shard_id, true);
                response.into_inner().success
            }
            Err(status) => {
                warn!(%key, %shard_id, "EXPIRE rpc failed: {status}");
                self.record_outcome(&shard_id, false);
                false
            }
        }
    }

    /// Remaining TTL for `key` (`-2` missing, `-1` no TTL). Transport
    /// failures also report `-2`.
    pub async fn ttl(&self, key: &str) -> i64 {
        let Some((shard_id, mut client)) = self.route(key) else {
            return -2;
        };
        let request = TtlRequest {
            key: key.to_owned(),
        };
        match client.ttl(request).await {
            Ok(response) => {
                self.record_outcome(&shard_id, true);
                response.into_inner().seconds
            }
            Err(status) => {
                warn!(%key, %shard_id, "TTL rpc failed: {status}");
                self.record_outcome(&shard_id, false);
                -2
            }
        }
    }

    /// A copy of the current routing counters.
    pub fn stats(&self) -> RoutingStats {
        self.lock_stats().clone()
    }

    pub fn reset_stats(&self) {
        *self.lock_stats() = RoutingStats::default();
    }

    /// Drops the pooled connection for a shard. A later operation
    /// routed there will reconnect lazily.
    pub fn remove_shard_connection(&self, shard_id: &str) {
        self.lock_connections().remove(shard_id);
        debug!(%shard_id, "shard connection removed");
    }

    /// Resolves the owning shard and its client, accounting a failure
    /// when no shard can serve the key.
    fn route(&self, key: &str) -> Option<(String, KeyValueStoreClient<Channel>)> {
        let Some(shard_id) = self.ring.shard_for_key(key) else {
            warn!(%key, "no shard available for key");
            self.record_unrouted();
            return None;
        };
        let Some(client) = self.client_for(&shard_id) else {
            self.record_unrouted();
            return None;
        };
        Some((shard_id, client))
    }

    fn client_for(&self, shard_id: &str) -> Option<KeyValueStoreClient<Channel>> {
        let mut connections = self.lock_connections();
        if let Some(client) = connections.get(shard_id) {
            return Some(client.clone());
        }
        let info = self.ring.shard(shard_id)?;
        let client = connect(&info.address)?;
        connections.insert(shard_id.to_owned(), client.clone());
        debug!(%shard_id, address = %info.address, "shard connection created");
        Some(client)
    }

    /// The request never reached a shard: count it against the totals
    /// only.
    fn record_unrouted(&self) {
        let mut stats = self.lock_stats();
        stats.total += 1;
        stats.failed += 1;
    }

    fn record_outcome(&self, shard_id: &str, success: bool) {
        let mut stats = self.lock_stats();
        stats.total += 1;
        *stats.per_shard.entry(shard_id.to_owned()).or_default() += 1;
        if success {
            stats.successful += 1;
        } else {
            stats.failed += 1;
        }
    }

    fn lock_connections(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, KeyValueStoreClient<Channel>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, RoutingStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builds a lazily-connecting client for `host:port`. The channel is
/// established on first use, so construction is cheap and infallible
/// for well-formed addresses.
fn connect(address: &str) -> Option<KeyValueStoreClient<Channel>> {
    let endpoint = match Endpoint::from_shared(format!("http://{address}")) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(%address, "invalid shard address: {e}");
            return None;
        }
    };
    Some(KeyValueStoreClient::new(endpoint.connect_lazy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_ring_yields_no_shard_outcomes() {
        let router = ShardRouter::new(Arc::new(HashRing::new()));

        assert!(!router.set("k", "v").await);
        assert_eq!(router.get("k").await, None);
        assert!(!router.delete("k").await);
        assert!(!router.contains("k").await);
        assert!(!router.expire("k", 5).await);
        assert_eq!(router.ttl("k").await, -2);

        let stats = router.stats();
        assert_eq!(stats.total, 6);
        assert_eq!(stats.failed, 6);
        assert_eq!(stats.successful, 0);
        assert!(stats.per_shard.is_empty());
    }

    #[tokio::test]
    async fn unreachable_shard_counts_as_failed() {
        let ring = Arc::new(HashRing::new());
        // nothing listens on this port
        ring.add_shard("shard-1", "127.0.0.1:1");
        let router = ShardRouter::new(Arc::clone(&ring));

        assert!(!router.set("k", "v").await);

        let stats = router.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.per_shard.get("shard-1"), Some(&1));
    }

    #[tokio::test]
    async fn stats_reset_clears_counters() {
        let router = ShardRouter::new(Arc::new(HashRing::new()));
        let _ = router.get("k").await;
        assert_eq!(router.stats().total, 1);

        router.reset_stats();
        assert_eq!(router.stats(), RoutingStats::default());
    }

    #[tokio::test]
    async fn stats_always_balance() {
        let ring = Arc::new(HashRing::new());
        ring.add_shard("shard-1", "127.0.0.1:1");
        let router = ShardRouter::new(Arc::clone(&ring));

        for i in 0..10 {
            let _ = router.set(&format!("key_{i}"), "v").await;
        }
        let _ = router.ttl("missing-ring-key").await;

        let stats = router.stats();
        assert_eq!(stats.total, stats.successful + stats.failed);
        let per_shard_total: u64 = stats.per_shard.values().sum();
        assert_eq!(per_shard_total, stats.total);
    }

    #[test]
    fn invalid_address_yields_no_client() {
        assert!(connect("not a valid address").is_none());
    }
}
