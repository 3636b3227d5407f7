//! The retrying client (`Clerk`) that talks to a sharded, replicated
//! `KVServer` cluster over the simulated fabric.
//!
//! A `Clerk` never gives up silently: every `Get`/`Put`/`Append` either
//! returns a value or, after exhausting its retry budget, an error. Mutating
//! calls carry a client-assigned request id generated once, before the
//! retry loop starts, so a retried call is recognized as a duplicate by
//! whichever replica eventually applies it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use kvshard_base::{err, Result};
use kvshard_net::{ClientEnd, Network};
use kvshard_server::{call_append, call_get, call_put, GetArgs, Op, PutAppendArgs, FAIL_SENTINEL};
use kvshard_shard::{shard_of, ReplicaId, ShardTable};

const DEFAULT_RETRY_LIMIT: u32 = 50;
const BACKOFF_BASE_SECS: f64 = 0.05;
const MAX_BACKOFF_SECS: f64 = 1.0;

fn backoff(attempt: u32) -> Duration {
    let secs = (BACKOFF_BASE_SECS * 2f64.powi(attempt as i32)).min(MAX_BACKOFF_SECS);
    Duration::from_secs_f64(secs)
}

pub struct Clerk {
    shard_table: ShardTable,
    network: Network,
    ends: HashMap<ReplicaId, ClientEnd>,
    client_id: Uuid,
    next_seq: Mutex<u64>,
    retry_limit: u32,
}

impl Clerk {
    pub fn new(shard_table: ShardTable, network: Network, ends: HashMap<ReplicaId, ClientEnd>) -> Self {
        Clerk {
            shard_table,
            network,
            ends,
            client_id: Uuid::new_v4(),
            next_seq: Mutex::new(0),
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Fresh per-call, assigned once before any retry of that call.
    fn next_request_id(&self) -> String {
        let mut seq = self.next_seq.lock().unwrap();
        *seq += 1;
        format!("{}-{}", self.client_id, *seq)
    }

    fn replicas_for(&self, key: &str) -> &[ReplicaId] {
        let shard = shard_of(key, self.shard_table.n_shards());
        self.shard_table.replicas(shard)
    }

    pub fn get(&self, key: &str) -> Result<String> {
        let replicas = self.replicas_for(key);
        let args = GetArgs { key: key.to_string() };
        self.retry(replicas, |end| call_get(end, &args).ok().map(|r| r.value))
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.put_append(key, value, Op::Put)
    }

    pub fn append(&self, key: &str, value: &str) -> Result<()> {
        self.put_append(key, value, Op::Append)
    }

    fn put_append(&self, key: &str, value: &str, op: Op) -> Result<()> {
        let replicas = self.replicas_for(key);
        let args = PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            op,
            request_id: self.next_request_id(),
        };
        let call = match op {
            Op::Put => call_put,
            Op::Append => call_append,
        };
        self.retry(replicas, |end| {
            call(end, &args).ok().and_then(|r| {
                if r.value == FAIL_SENTINEL {
                    None
                } else {
                    Some(())
                }
            })
        })
    }

    /// Round-robins across `replicas` in shard-table order, skipping
    /// disabled endpoints, backing off between full rounds. Gives up after
    /// `retry_limit` rounds.
    fn retry<T>(&self, replicas: &[ReplicaId], mut attempt_once: impl FnMut(&ClientEnd) -> Option<T>) -> Result<T> {
        if replicas.is_empty() {
            return Err(err("no replicas for key's shard"));
        }
        for attempt in 0..self.retry_limit {
            for &replica_id in replicas {
                let Some(end) = self.ends.get(&replica_id) else {
                    continue;
                };
                if !self.network.is_server_enabled(replica_id) {
                    continue;
                }
                if let Some(value) = attempt_once(end) {
                    return Ok(value);
                }
            }
            thread::sleep(backoff(attempt));
        }
        Err(err("exhausted retry budget against all replicas"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvshard_net::ServerHost;
    use kvshard_server::{KvReplica, KvService};
    use kvshard_shard::ShardTable;
    use std::sync::Arc;
    use test_log::test;

    fn single_shard_cluster(n_replicas: u64) -> (Network, Clerk) {
        let net = Network::new();
        net.reliable(true);
        let table = ShardTable::uniform(1, n_replicas);
        let mut ends = HashMap::new();
        for &replica_id in table.replicas(0) {
            let mut peers = HashMap::new();
            for &peer_id in table.replicas(0) {
                if peer_id == replica_id {
                    continue;
                }
                let end_name = format!("r{replica_id}->r{peer_id}");
                let end = net.make_end(end_name.clone());
                net.connect(&end_name, peer_id);
                net.enable(&end_name, true);
                peers.insert(peer_id, end);
            }
            let replica = Arc::new(KvReplica::new(
                replica_id,
                0,
                1,
                table.replicas(0).to_vec(),
                peers,
                net.clone(),
                true,
            ));
            let host = Arc::new(ServerHost::new());
            host.add_service(Box::new(KvService::new(replica)));
            net.add_server(replica_id, host);

            let client_end_name = format!("clerk->r{replica_id}");
            let client_end = net.make_end(client_end_name.clone());
            net.connect(&client_end_name, replica_id);
            net.enable(&client_end_name, true);
            ends.insert(replica_id, client_end);
        }
        let clerk = Clerk::new(table, net.clone(), ends);
        (net, clerk)
    }

    #[test]
    fn put_get_round_trips_through_clerk() {
        let (_net, clerk) = single_shard_cluster(1);
        clerk.put("a", "1").unwrap();
        assert_eq!(clerk.get("a").unwrap(), "1");
    }

    #[test]
    fn append_accumulates() {
        let (_net, clerk) = single_shard_cluster(1);
        clerk.put("a", "x").unwrap();
        clerk.append("a", "y").unwrap();
        assert_eq!(clerk.get("a").unwrap(), "xy");
    }

    #[test]
    fn replicates_across_three_replicas() {
        let (net, clerk) = single_shard_cluster(3);
        clerk.put("a", "1").unwrap();
        assert_eq!(clerk.get("a").unwrap(), "1");
        net.enable("clerk->r0", false);
        assert_eq!(clerk.get("a").unwrap(), "1");
    }

    #[test]
    fn unknown_key_returns_empty_string() {
        let (_net, clerk) = single_shard_cluster(1);
        assert_eq!(clerk.get("missing").unwrap(), "");
    }
}
