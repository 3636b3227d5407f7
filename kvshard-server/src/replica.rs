//! The replicated shard server: owns one shard, applies writes in a
//! primary-replicated manner with at-most-once semantics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use kvshard_net::{CallError, ClientEnd, Network};
use kvshard_shard::{shard_of, ReplicaId, ShardId};

use crate::messages::{is_fail, GetArgs, GetReply, Op, PutAppendArgs, PutAppendReply, FAIL_SENTINEL};

const MAX_REPLICATE_ATTEMPTS: u32 = 5;
const MAX_BACKOFF_SECS: f64 = 1.0;
const BACKOFF_BASE_SECS: f64 = 0.05;

fn backoff(attempt: u32) -> Duration {
    let secs = (BACKOFF_BASE_SECS * 2f64.powi(attempt as i32)).min(MAX_BACKOFF_SECS);
    Duration::from_secs_f64(secs)
}

struct Store {
    values: HashMap<String, String>,
    dedup: HashMap<String, PutAppendReply>,
}

/// One replica of one shard.
///
/// A single mutex guards `store`+`dedup`. The replication fan-out in
/// [`KvReplica::handle_mutation`] deliberately runs *without* that mutex
/// held: holding it across the network would serialize shard writes and
/// deadlock cross-replica `Replicate` calls that loop back through the
/// same fabric.
pub struct KvReplica {
    my_id: ReplicaId,
    shard_id: ShardId,
    n_shards: u64,
    replica_ids: Vec<ReplicaId>,
    peers: HashMap<ReplicaId, ClientEnd>,
    network: Network,
    reliable: bool,
    store: Mutex<Store>,
}

impl KvReplica {
    /// `peers` must contain a [`ClientEnd`] for every id in `replica_ids`
    /// other than `my_id`; `network` is used only for the
    /// `is_server_enabled` admission check.
    pub fn new(
        my_id: ReplicaId,
        shard_id: ShardId,
        n_shards: u64,
        replica_ids: Vec<ReplicaId>,
        peers: HashMap<ReplicaId, ClientEnd>,
        network: Network,
        reliable: bool,
    ) -> Self {
        KvReplica {
            my_id,
            shard_id,
            n_shards,
            replica_ids,
            peers,
            network,
            reliable,
            store: Mutex::new(Store {
                values: HashMap::new(),
                dedup: HashMap::new(),
            }),
        }
    }

    pub fn my_id(&self) -> ReplicaId {
        self.my_id
    }

    /// True iff this replica is network-enabled, owns `key`'s shard, and
    /// is listed among its own shard's replicas. Recomputed on every
    /// call, so a replica disabled mid-run starts rejecting immediately.
    fn owns_shard(&self, key: &str) -> bool {
        let owns = self.network.is_server_enabled(self.my_id)
            && shard_of(key, self.n_shards) == self.shard_id
            && self.replica_ids.contains(&self.my_id);
        trace!(my_id = self.my_id, key, owns, "shard ownership check");
        owns
    }

    pub fn get(&self, args: &GetArgs) -> GetReply {
        if !self.owns_shard(&args.key) {
            return GetReply {
                value: FAIL_SENTINEL.to_string(),
            };
        }
        let store = self.store.lock().unwrap();
        GetReply {
            value: store.values.get(&args.key).cloned().unwrap_or_default(),
        }
    }

    /// Put and Append share the same dedup+replicate+apply protocol;
    /// only the mutation applied at the end differs.
    pub fn put(&self, args: PutAppendArgs) -> PutAppendReply {
        debug_assert_eq!(args.op, Op::Put);
        self.handle_mutation(args)
    }

    pub fn append(&self, args: PutAppendArgs) -> PutAppendReply {
        debug_assert_eq!(args.op, Op::Append);
        self.handle_mutation(args)
    }

    fn handle_mutation(&self, args: PutAppendArgs) -> PutAppendReply {
        if !self.owns_shard(&args.key) {
            return PutAppendReply::fail();
        }

        if let Some(cached) = self.store.lock().unwrap().dedup.get(&args.request_id) {
            return cached.clone();
        }

        let peer_count = self.replica_ids.len().saturating_sub(1);
        let succeeded = self.replicate_to_peers(&args);
        if peer_count > 0 && succeeded == 0 {
            warn!(request_id = %args.request_id, "replication shortfall, no peer reachable");
            return PutAppendReply::fail();
        }

        self.apply_and_record(&args)
    }

    /// `Replicate`: a peer never re-replicates. It is a terminal applier.
    pub fn replicate(&self, args: PutAppendArgs) -> PutAppendReply {
        if !self.owns_shard(&args.key) {
            return PutAppendReply::fail();
        }
        self.apply_and_record(&args)
    }

    fn apply_and_record(&self, args: &PutAppendArgs) -> PutAppendReply {
        let mut store = self.store.lock().unwrap();
        if let Some(cached) = store.dedup.get(&args.request_id) {
            return cached.clone();
        }
        let old = store.values.get(&args.key).cloned().unwrap_or_default();
        let new = match args.op {
            Op::Put => args.value.clone(),
            Op::Append => format!("{old}{}", args.value),
        };
        store.values.insert(args.key.clone(), new);
        let reply = PutAppendReply { value: old };
        store.dedup.insert(args.request_id.clone(), reply.clone());
        reply
    }

    /// Sends `Replicate` to every peer in `replica_ids` (primary's
    /// fan-out order), one peer at a time, up to 5 attempts each. An
    /// attempt succeeds iff a reply arrives and its value isn't
    /// `__FAIL__`; the retry loop for that peer stops on first success.
    fn replicate_to_peers(&self, args: &PutAppendArgs) -> usize {
        let mut succeeded = 0;
        for &peer_id in &self.replica_ids {
            if peer_id == self.my_id {
                continue;
            }
            let Some(end) = self.peers.get(&peer_id) else {
                continue;
            };
            if self.replicate_to_one(end, peer_id, args) {
                succeeded += 1;
            } else {
                debug!(peer_id, request_id = %args.request_id, "replication to peer failed after all retries");
            }
        }
        succeeded
    }

    fn replicate_to_one(&self, end: &ClientEnd, peer_id: ReplicaId, args: &PutAppendArgs) -> bool {
        for attempt in 0..MAX_REPLICATE_ATTEMPTS {
            if self.network.is_server_enabled(peer_id) {
                match crate::call_replicate(end, args) {
                    Ok(reply) if !is_fail(&reply.value) => {
                        trace!(peer_id, attempt, "replication succeeded");
                        return true;
                    }
                    Ok(_) | Err(CallError::Timeout) => {}
                }
            }
            if !self.reliable {
                thread::sleep(backoff(attempt));
            }
        }
        false
    }
}
