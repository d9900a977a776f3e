//! Proxy Context
//!
//! The state shared by every client session: the routing table, the backend
//! pool and the statistics. One `Proxy` is built at startup and handed to
//! each session behind an `Arc`; there are no globals.

use crate::backend::{BackendPool, Connector, TcpConnector};
use crate::connection::ConnectionStats;
use crate::routing::SharedShardTable;
use std::sync::Arc;
use std::time::Instant;

/// Default cap on replies a single client may have outstanding.
pub const DEFAULT_MAX_PENDING: usize = 1024;

pub struct Proxy<C: Connector = TcpConnector> {
    table: SharedShardTable,
    pool: Arc<BackendPool<C>>,
    stats: Arc<ConnectionStats>,
    started: Instant,
    max_pending: usize,
}

impl<C: Connector> Proxy<C> {
    pub fn new(table: SharedShardTable, pool: BackendPool<C>) -> Self {
        Self {
            table,
            pool: Arc::new(pool),
            stats: Arc::new(ConnectionStats::new()),
            started: Instant::now(),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    /// Caps the replies one client may have outstanding before its reads
    /// pause.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn table(&self) -> &SharedShardTable {
        &self.table
    }

    pub fn pool(&self) -> &Arc<BackendPool<C>> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backend::connector::testing::{ConnectRequest, ScriptedConnector};
    use crate::routing::ShardTable;
    use tokio::sync::mpsc;

    /// A proxy over scripted backends. With `addr`, every shard of a
    /// 16-shard table routes there; without it nothing is routable.
    pub(crate) fn scripted_proxy(
        addr: Option<&str>,
    ) -> (Arc<Proxy<ScriptedConnector>>, mpsc::UnboundedReceiver<ConnectRequest>) {
        let mut table = ShardTable::new(16);
        if let Some(addr) = addr {
            for shard in 0..16 {
                table.set_shard_owner(shard, 1);
            }
            table.set_servers(1, vec![addr.to_string()]);
        }
        let (connector, requests) = ScriptedConnector::new();
        let proxy = Proxy::new(SharedShardTable::new(table), BackendPool::new(connector));
        (Arc::new(proxy), requests)
    }
}
