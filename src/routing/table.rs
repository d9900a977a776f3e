//! Shard Routing Table
//!
//! Maps a key to the backend address that owns it, in two hops:
//!
//! ```text
//!   key ──crc16──> shard id ──owners──> set id ──servers──> [addr, addr, ...]
//!                                                             ▲
//!                                                   first entry is preferred
//! ```
//!
//! Keys containing a non-empty `{hash tag}` are hashed on the tag alone, so
//! related keys can be pinned to the same shard.
//!
//! The table is written by the topology updater and read by every client
//! session. [`SharedShardTable`] wraps it in an `RwLock`; lookups take the
//! read lock for the duration of one resolve and never across an await.

use crc::{Crc, CRC_16_XMODEM};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Identifies one hash bucket of keys.
pub type ShardId = u32;

/// Identifies one group of equivalent backend servers.
pub type SetId = u32;

/// Number of shards when the configuration does not say otherwise.
pub const DEFAULT_SHARD_COUNT: u32 = 1024;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Returns the part of `key` that is hashed: the content of the first
/// non-empty `{...}` section, or the whole key.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}

/// Counts describing the current table contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub shard_count: u32,
    pub assigned_shards: usize,
    pub server_sets: usize,
}

/// The shard → set → servers routing table.
#[derive(Debug, Clone)]
pub struct ShardTable {
    shard_count: u32,
    owners: HashMap<ShardId, SetId>,
    servers: HashMap<SetId, Vec<String>>,
}

impl Default for ShardTable {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}

impl ShardTable {
    /// Creates an empty table hashing keys into `shard_count` shards.
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count: shard_count.max(1),
            owners: HashMap::new(),
            servers: HashMap::new(),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// The shard a key hashes to.
    #[inline]
    pub fn shard_of(&self, key: &[u8]) -> ShardId {
        u32::from(CRC16.checksum(hash_tag(key))) % self.shard_count
    }

    /// Assigns a shard to a set. Last write wins.
    pub fn set_shard_owner(&mut self, shard: ShardId, set: SetId) {
        self.owners.insert(shard, set);
    }

    /// Replaces the ordered server list of a set. Last write wins.
    pub fn set_servers(&mut self, set: SetId, addrs: Vec<String>) {
        self.servers.insert(set, addrs);
    }

    pub fn owner_of(&self, shard: ShardId) -> Option<SetId> {
        self.owners.get(&shard).copied()
    }

    pub fn servers_of(&self, set: SetId) -> Option<&[String]> {
        self.servers.get(&set).map(Vec::as_slice)
    }

    /// Returns the preferred address for `key`, or `None` while either the
    /// shard owner or the owner's server list is unknown.
    pub fn resolve(&self, key: &[u8]) -> Option<&str> {
        let set = self.owner_of(self.shard_of(key))?;
        self.servers_of(set)?.first().map(String::as_str)
    }

    /// Forgets every mapping. The shard count is kept.
    pub fn clear(&mut self) {
        self.owners.clear();
        self.servers.clear();
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            shard_count: self.shard_count,
            assigned_shards: self.owners.len(),
            server_sets: self.servers.len(),
        }
    }
}

/// A `ShardTable` shared between the topology updater and client sessions.
#[derive(Debug, Clone, Default)]
pub struct SharedShardTable {
    inner: Arc<RwLock<ShardTable>>,
}

impl SharedShardTable {
    pub fn new(table: ShardTable) -> Self {
        Self {
            inner: Arc::new(RwLock::new(table)),
        }
    }

    /// Resolves `key` to an owned address string.
    pub fn resolve(&self, key: &[u8]) -> Option<String> {
        self.inner.read().unwrap().resolve(key).map(str::to_owned)
    }

    /// Runs `f` with shared access to the table.
    pub fn read<R>(&self, f: impl FnOnce(&ShardTable) -> R) -> R {
        f(&self.inner.read().unwrap())
    }

    /// Runs `f` with exclusive access to the table.
    pub fn update<R>(&self, f: impl FnOnce(&mut ShardTable) -> R) -> R {
        f(&mut self.inner.write().unwrap())
    }

    pub fn stats(&self) -> TableStats {
        self.read(ShardTable::stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_everything_on(addr: &str) -> ShardTable {
        let mut table = ShardTable::new(16);
        for shard in 0..16 {
            table.set_shard_owner(shard, 1);
        }
        table.set_servers(1, vec![addr.to_string(), "10.0.0.2:7000".to_string()]);
        table
    }

    #[test]
    fn test_unresolved_before_mappings() {
        let mut table = ShardTable::new(16);
        assert_eq!(table.resolve(b"k"), None);

        // Owner without servers is still unresolved.
        table.set_shard_owner(table.shard_of(b"k"), 3);
        assert_eq!(table.resolve(b"k"), None);

        table.set_servers(3, vec!["10.0.0.1:7000".to_string()]);
        assert_eq!(table.resolve(b"k"), Some("10.0.0.1:7000"));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let table = table_with_everything_on("10.0.0.1:7000");
        let first = table.resolve(b"k").map(str::to_owned);
        for _ in 0..100 {
            assert_eq!(table.resolve(b"k").map(str::to_owned), first);
        }
        assert_eq!(first.as_deref(), Some("10.0.0.1:7000"));

        // A copy of the same state routes the same way.
        let copy = table.clone();
        assert_eq!(copy.shard_of(b"user:1"), table.shard_of(b"user:1"));
    }

    #[test]
    fn test_first_server_is_preferred() {
        let table = table_with_everything_on("10.0.0.9:7001");
        assert_eq!(table.resolve(b"anything"), Some("10.0.0.9:7001"));
    }

    #[test]
    fn test_last_write_wins() {
        let mut table = table_with_everything_on("10.0.0.1:7000");
        let shard = table.shard_of(b"foo");

        table.set_servers(2, vec!["10.0.0.3:7000".to_string()]);
        table.set_shard_owner(shard, 2);
        assert_eq!(table.resolve(b"foo"), Some("10.0.0.3:7000"));

        table.set_servers(2, vec!["10.0.0.4:7000".to_string()]);
        assert_eq!(table.resolve(b"foo"), Some("10.0.0.4:7000"));

        table.set_servers(2, vec![]);
        assert_eq!(table.resolve(b"foo"), None);
    }

    #[test]
    fn test_shard_of_known_values() {
        // CRC16/XMODEM("123456789") = 0x31C3
        let table = ShardTable::new(16384);
        assert_eq!(table.shard_of(b"123456789"), 0x31C3 % 16384);
        assert!(table.shard_of(b"foo") < 16384);
    }

    #[test]
    fn test_hash_tags() {
        assert_eq!(hash_tag(b"user:{42}:name"), b"42");
        assert_eq!(hash_tag(b"user:{}:name"), b"user:{}:name");
        assert_eq!(hash_tag(b"plain"), b"plain");
        assert_eq!(hash_tag(b"open{only"), b"open{only");

        let table = ShardTable::new(1024);
        assert_eq!(
            table.shard_of(b"{user42}:profile"),
            table.shard_of(b"{user42}:settings")
        );
    }

    #[test]
    fn test_shared_table() {
        let shared = SharedShardTable::new(ShardTable::new(8));
        assert_eq!(shared.resolve(b"k"), None);

        shared.update(|t| {
            for shard in 0..8 {
                t.set_shard_owner(shard, 7);
            }
            t.set_servers(7, vec!["127.0.0.1:7000".to_string()]);
        });
        assert_eq!(shared.resolve(b"k").as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(
            shared.stats(),
            TableStats {
                shard_count: 8,
                assigned_shards: 8,
                server_sets: 1
            }
        );
    }
}
