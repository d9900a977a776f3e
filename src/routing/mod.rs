//! Shard Routing
//!
//! This module decides which backend node owns a key.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   events    ┌──────────────────┐
//! │ Topology source  │────────────>│ TopologyUpdater  │
//! │ (config, SIGHUP) │             └────────┬─────────┘
//! └──────────────────┘                      │ write lock
//!                                           ▼
//!                                 ┌──────────────────┐
//!                                 │ SharedShardTable │
//!                                 └────────┬─────────┘
//!                                          │ read lock, resolve(key)
//!                                          ▼
//!                                  client sessions
//! ```

pub mod table;
pub mod topology;

// Re-export commonly used types
pub use table::{
    hash_tag, SetId, ShardId, ShardTable, SharedShardTable, TableStats, DEFAULT_SHARD_COUNT,
};
pub use topology::{TopologyError, TopologyEvent, TopologySnapshot, TopologyUpdater};
