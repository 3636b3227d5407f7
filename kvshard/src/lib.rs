//! Assembles a whole cluster (shard table, simulated fabric, replicas,
//! and clerks) behind one [`Cluster`] handle, and exercises it end to end.
//!
//! Nothing here is new protocol: this crate is wiring. The interesting
//! behavior lives in `kvshard-net` (the fabric), `kvshard-server` (the
//! replica), and `kvshard-client` (the retrying clerk).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kvshard_client::Clerk;
use kvshard_net::{ClientEnd, Network, ServerHost};
use kvshard_server::{KvReplica, KvService};
use kvshard_shard::{ReplicaId, ShardTable};

static ENDNAME_COUNTER: AtomicU64 = AtomicU64::new(0);

fn fresh_endname(prefix: &str) -> String {
    let n = ENDNAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}#{n}")
}

/// A running cluster: a shard table realized over a simulated [`Network`],
/// with one [`KvReplica`] per (shard, replica) slot.
pub struct Cluster {
    pub network: Network,
    pub shard_table: ShardTable,
    /// Every endpoint name that resolves to a given replica, so
    /// `stop_replica` can disable all of them at once.
    endpoints_by_replica: Mutex<HashMap<ReplicaId, Vec<String>>>,
}

impl Cluster {
    /// Builds `n_shards` shards of `n_replicas` replicas each, wires every
    /// replica to every other replica in its shard, and starts the fabric
    /// in `reliable` mode (flip with `network.reliable(false)` afterward).
    pub fn start(n_shards: u64, n_replicas: u64, reliable: bool) -> Self {
        let network = Network::new();
        network.reliable(reliable);
        let shard_table = ShardTable::uniform(n_shards, n_replicas);
        let mut endpoints_by_replica: HashMap<ReplicaId, Vec<String>> = HashMap::new();

        for shard in 0..n_shards {
            let replica_ids = shard_table.replicas(shard).to_vec();
            for &replica_id in &replica_ids {
                let mut peers = HashMap::new();
                for &peer_id in &replica_ids {
                    if peer_id == replica_id {
                        continue;
                    }
                    let endname = fresh_endname(&format!("r{replica_id}->r{peer_id}"));
                    let end = network.make_end(endname.clone());
                    network.connect(&endname, peer_id);
                    network.enable(&endname, true);
                    endpoints_by_replica.entry(peer_id).or_default().push(endname);
                    peers.insert(peer_id, end);
                }
                let replica = Arc::new(KvReplica::new(
                    replica_id,
                    shard,
                    n_shards,
                    replica_ids.clone(),
                    peers,
                    network.clone(),
                    reliable,
                ));
                let host = Arc::new(ServerHost::new());
                host.add_service(Box::new(KvService::new(replica)));
                network.add_server(replica_id, host);
            }
        }

        Cluster {
            network,
            shard_table,
            endpoints_by_replica: Mutex::new(endpoints_by_replica),
        }
    }

    /// A fresh [`Clerk`] with its own endpoints to every replica in the
    /// cluster. Clerks are cheap, one per logical caller is normal.
    pub fn new_clerk(&self) -> Clerk {
        let mut ends: HashMap<ReplicaId, ClientEnd> = HashMap::new();
        let mut registry = self.endpoints_by_replica.lock().unwrap();
        for shard in 0..self.shard_table.n_shards() {
            for &replica_id in self.shard_table.replicas(shard) {
                let endname = fresh_endname(&format!("clerk->r{replica_id}"));
                let end = self.network.make_end(endname.clone());
                self.network.connect(&endname, replica_id);
                self.network.enable(&endname, true);
                registry.entry(replica_id).or_default().push(endname);
                ends.insert(replica_id, end);
            }
        }
        Clerk::new(self.shard_table.clone(), self.network.clone(), ends)
    }

    /// Disables every endpoint anyone has ever made toward `replica_id`,
    /// simulating that replica process being stopped: existing and future
    /// calls to it time out, but other replicas are unaffected.
    pub fn stop_replica(&self, replica_id: ReplicaId) {
        let registry = self.endpoints_by_replica.lock().unwrap();
        if let Some(endnames) = registry.get(&replica_id) {
            for endname in endnames {
                self.network.enable(endname, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn basic_put_and_get() {
        let cluster = Cluster::start(1, 1, true);
        let clerk = cluster.new_clerk();
        clerk.put("x", "1").unwrap();
        assert_eq!(clerk.get("x").unwrap(), "1");
    }

    #[test]
    fn put_then_append() {
        let cluster = Cluster::start(1, 1, true);
        let clerk = cluster.new_clerk();
        clerk.put("x", "foo").unwrap();
        clerk.append("x", "bar").unwrap();
        assert_eq!(clerk.get("x").unwrap(), "foobar");
    }

    #[test]
    fn duplicate_submission_is_applied_once() {
        let cluster = Cluster::start(1, 2, true);
        let clerk = cluster.new_clerk();
        clerk.put("x", "a").unwrap();
        // Two independent Append calls each apply once; this isn't a
        // retried RPC (those get a single request id), but it still
        // demonstrates the store isn't double-applying arbitrary calls.
        clerk.append("x", "b").unwrap();
        assert_eq!(clerk.get("x").unwrap(), "ab");
    }

    #[test]
    fn non_integer_keys_route_by_codepoint_sum() {
        let cluster = Cluster::start(4, 1, true);
        let clerk = cluster.new_clerk();
        clerk.put("hello", "1").unwrap();
        clerk.put("world", "2").unwrap();
        assert_eq!(clerk.get("hello").unwrap(), "1");
        assert_eq!(clerk.get("world").unwrap(), "2");
    }

    #[test]
    fn unreliable_workload_still_converges() {
        let cluster = Cluster::start(2, 3, true);
        let clerk = cluster.new_clerk();
        cluster.network.reliable(false);
        for i in 0..40 {
            let key = format!("k{}", i % 5);
            clerk.put(&key, &i.to_string()).unwrap();
        }
        for i in 0..5 {
            let key = format!("k{i}");
            let got = clerk.get(&key).unwrap();
            assert!(!got.is_empty());
        }
    }

    #[test]
    fn disabled_endpoint_does_not_stall_other_replicas() {
        let cluster = Cluster::start(1, 2, true);
        let a = cluster.new_clerk();
        let b = cluster.new_clerk();
        a.put("x", "1").unwrap();
        assert_eq!(b.get("x").unwrap(), "1");
    }

    #[test]
    fn stopped_sole_replica_exhausts_retries() {
        let cluster = Cluster::start(1, 1, true);
        let clerk = cluster.new_clerk().with_retry_limit(3);
        clerk.put("x", "1").unwrap();

        let sole_replica = cluster.shard_table.replicas(0)[0];
        cluster.stop_replica(sole_replica);

        assert!(!cluster.network.is_server_enabled(sole_replica));
        assert!(clerk.get("x").is_err());
    }

    #[test]
    fn all_peers_disabled_fails_put_and_leaves_store_unchanged() {
        let cluster = Cluster::start(1, 3, true);
        let clerk = cluster.new_clerk().with_retry_limit(3);
        clerk.put("x", "orig").unwrap();
        assert_eq!(clerk.get("x").unwrap(), "orig");

        let replicas = cluster.shard_table.replicas(0).to_vec();
        let primary = replicas[0];
        for &peer in &replicas[1..] {
            cluster.stop_replica(peer);
        }

        assert!(cluster.network.is_server_enabled(primary));
        assert!(clerk.put("x", "new").is_err());
        assert_eq!(clerk.get("x").unwrap(), "orig");
    }
}
