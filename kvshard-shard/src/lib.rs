//! Static shard-id computation and the shard → replica-list table.
//!
//! Built once when a cluster is assembled and never mutated afterward;
//! there is no dynamic reshard or membership change in this design.

#[cfg(test)]
use test_log::test;

pub type ShardId = u64;
pub type ReplicaId = u64;

/// `shard_of(key) = int(key) mod n` when `key` parses as a non-negative
/// integer, otherwise the sum of `key`'s code points mod `n`.
pub fn shard_of(key: &str, n_shards: u64) -> ShardId {
    assert!(n_shards > 0, "shard count must be positive");
    match key.parse::<u64>() {
        Ok(n) => n % n_shards,
        Err(_) => {
            let sum: u64 = key.chars().map(|c| c as u64).sum();
            sum % n_shards
        }
    }
}

/// `shard_id -> ordered replica ids`; `replicas(shard)[0]` is the primary.
#[derive(Debug, Clone)]
pub struct ShardTable {
    shards: Vec<Vec<ReplicaId>>,
}

impl ShardTable {
    /// Builds a table for `n_shards` shards, each with `n_replicas`
    /// replicas, numbering replica ids sequentially shard-major
    /// (shard 0 gets replicas `0..n_replicas`, shard 1 the next block, ...).
    pub fn uniform(n_shards: u64, n_replicas: u64) -> Self {
        let mut shards = Vec::with_capacity(n_shards as usize);
        let mut next_id = 0u64;
        for _ in 0..n_shards {
            let mut replicas = Vec::with_capacity(n_replicas as usize);
            for _ in 0..n_replicas {
                replicas.push(next_id);
                next_id += 1;
            }
            shards.push(replicas);
        }
        ShardTable { shards }
    }

    pub fn n_shards(&self) -> u64 {
        self.shards.len() as u64
    }

    pub fn n_servers(&self) -> u64 {
        self.shards.iter().map(|r| r.len() as u64).sum()
    }

    /// Ordered replica list for `shard`, or an empty slice if out of range.
    pub fn replicas(&self, shard: ShardId) -> &[ReplicaId] {
        self.shards
            .get(shard as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The shard a replica id belongs to, if any.
    pub fn shard_of_replica(&self, replica: ReplicaId) -> Option<ShardId> {
        self.shards
            .iter()
            .position(|replicas| replicas.contains(&replica))
            .map(|idx| idx as ShardId)
    }

    /// Whether `replica` is the primary (first entry) of its shard.
    pub fn is_primary(&self, replica: ReplicaId) -> bool {
        self.shard_of_replica(replica)
            .map(|shard| self.replicas(shard).first() == Some(&replica))
            .unwrap_or(false)
    }
}

#[test]
fn integer_keys_hash_by_value() {
    assert_eq!(shard_of("0", 3), 0);
    assert_eq!(shard_of("4", 3), 1);
}

#[test]
fn non_integer_keys_hash_by_codepoint_sum() {
    // 'a'=97 'b'=98 'c'=99 -> 294 mod 3 == 0
    assert_eq!(shard_of("abc", 3), 0);
}

#[test]
fn table_assigns_primaries_and_disjoint_replica_sets() {
    let table = ShardTable::uniform(3, 3);
    assert_eq!(table.n_shards(), 3);
    assert_eq!(table.n_servers(), 9);
    assert_eq!(table.replicas(0), &[0, 1, 2]);
    assert_eq!(table.replicas(1), &[3, 4, 5]);
    assert!(table.is_primary(0));
    assert!(!table.is_primary(1));
    assert_eq!(table.shard_of_replica(4), Some(1));
}

#[test]
#[should_panic]
fn zero_shards_panics() {
    let _ = shard_of("x", 0);
}
