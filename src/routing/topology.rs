//! Topology Updater
//!
//! The bridge between a topology source and the [`SharedShardTable`].
//!
//! A source (the configuration file today, a discovery service client in a
//! larger deployment) reports two kinds of change, plus an initial bulk
//! load:
//!
//! - a shard moved to another server set
//! - a server set's address list changed
//!
//! The updater applies them to the table. It also tracks whether an initial
//! load has happened: routing without one would answer every key with
//! "not ready", so startup waits for it with a deadline and gives up on the
//! whole process if the deadline passes.

use crate::routing::table::{SetId, ShardId, SharedShardTable};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A complete routing picture, used for the initial load and reloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub owners: Vec<(ShardId, SetId)>,
    pub sets: Vec<(SetId, Vec<String>)>,
}

/// A change reported by a topology source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    ShardOwnerChanged { shard: ShardId, set: SetId },
    ServerSetChanged { set: SetId, addrs: Vec<String> },
    Snapshot(TopologySnapshot),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// No initial load arrived in time. The proxy cannot route without one.
    #[error("topology handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

/// Pushes topology changes into the shard table.
#[derive(Debug, Clone)]
pub struct TopologyUpdater {
    table: SharedShardTable,
    ready: Arc<watch::Sender<bool>>,
}

impl TopologyUpdater {
    pub fn new(table: SharedShardTable) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            table,
            ready: Arc::new(ready),
        }
    }

    pub fn table(&self) -> &SharedShardTable {
        &self.table
    }

    /// Replaces the whole table with `snapshot` and marks the topology ready.
    pub fn load(&self, snapshot: &TopologySnapshot) {
        let (shards, sets) = self.table.update(|table| {
            table.clear();
            let shard_count = table.shard_count();
            for &(shard, set) in &snapshot.owners {
                if shard >= shard_count {
                    warn!(shard, shard_count, "Ignoring owner for out-of-range shard");
                    continue;
                }
                table.set_shard_owner(shard, set);
            }
            for (set, addrs) in &snapshot.sets {
                table.set_servers(*set, addrs.clone());
            }
            let stats = table.stats();
            (stats.assigned_shards, stats.server_sets)
        });

        info!(
            assigned_shards = shards,
            server_sets = sets,
            "Topology loaded"
        );
        self.ready.send_replace(true);
    }

    /// A shard now belongs to `set`.
    pub fn on_shard_owner_changed(&self, shard: ShardId, set: SetId) {
        let applied = self.table.update(|table| {
            if shard >= table.shard_count() {
                return false;
            }
            table.set_shard_owner(shard, set);
            true
        });
        if applied {
            debug!(shard, set, "Shard owner changed");
        } else {
            warn!(shard, set, "Ignoring owner for out-of-range shard");
        }
    }

    /// `set` is now served by `addrs`, preferred address first.
    pub fn on_server_set_changed(&self, set: SetId, addrs: Vec<String>) {
        debug!(set, servers = ?addrs, "Server set changed");
        self.table.update(|table| table.set_servers(set, addrs));
    }

    pub fn apply(&self, event: TopologyEvent) {
        match event {
            TopologyEvent::ShardOwnerChanged { shard, set } => {
                self.on_shard_owner_changed(shard, set)
            }
            TopologyEvent::ServerSetChanged { set, addrs } => {
                self.on_server_set_changed(set, addrs)
            }
            TopologyEvent::Snapshot(snapshot) => self.load(&snapshot),
        }
    }

    /// True once an initial load has been applied.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Waits for the initial load, failing after `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), TopologyError> {
        let mut ready = self.ready.subscribe();
        // `self` keeps the sender alive, so the wait itself cannot fail.
        let loaded = tokio::time::timeout(timeout, ready.wait_for(|loaded| *loaded))
            .await
            .is_ok();
        if loaded {
            Ok(())
        } else {
            Err(TopologyError::HandshakeTimeout(timeout))
        }
    }

    /// Applies every event from `events` until the source goes away.
    pub fn spawn(self, mut events: mpsc::Receiver<TopologyEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.apply(event);
            }
            debug!("Topology source closed");
        })
    }
}
