//! Backend Connection Pool
//!
//! Holds at most one live connection per backend address.
//!
//! ## Entry Lifecycle
//!
//! ```text
//!             first lookup
//!   (absent) ─────────────> Connecting { waiters }
//!      ▲                        │            │
//!      │  connect failed        │            │ connected
//!      │  (every waiter fails)  │            ▼ (every waiter gets the handle)
//!      └────────────────────────┘        Connected(handle)
//!      ▲                                     │
//!      └──────────── session ended ──────────┘
//! ```
//!
//! Lookups that arrive while a connect is outstanding join its waiter list
//! instead of dialing again. The connect itself runs in its own task, so a
//! caller that gives up waiting never strands the others.
//!
//! Every connection gets a fresh id. Cleanup after a session ends removes
//! the entry only if it still carries that id, so a stale session can never
//! evict its replacement.

use crate::backend::connector::{Connector, TcpConnector};
use crate::backend::keepalive::{Keepalive, KeepaliveConfig};
use crate::backend::session::{run_session, BackendError, BackendHandle, ReplyReceiver};
use crate::protocol::{CommandFrame, ReplyFrame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Waiter = oneshot::Sender<Result<BackendHandle, BackendError>>;

enum PoolEntry {
    Connecting { id: u64, waiters: Vec<Waiter> },
    Connected(BackendHandle),
}

/// Shared pool of backend connections, keyed by address.
pub struct BackendPool<C: Connector = TcpConnector> {
    connector: C,
    entries: Mutex<HashMap<String, PoolEntry>>,
    next_id: AtomicU64,
    keepalive: Option<KeepaliveConfig>,
}

impl<C: Connector> BackendPool<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            keepalive: None,
        }
    }

    /// Pings every connection periodically and drops the ones that stop
    /// answering.
    pub fn with_keepalive(mut self, config: KeepaliveConfig) -> Self {
        self.keepalive = Some(config);
        self
    }

    /// Returns the live connection to `addr`, connecting if there is none.
    ///
    /// Concurrent calls for the same address share one connect attempt and
    /// all see its outcome.
    pub async fn get_or_connect(self: &Arc<Self>, addr: &str) -> Result<BackendHandle, BackendError> {
        let waiter = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(addr) {
                Some(PoolEntry::Connected(handle)) if !handle.is_closed() => {
                    return Ok(handle.clone());
                }
                Some(PoolEntry::Connecting { waiters, .. }) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                _ => {
                    let (tx, rx) = oneshot::channel();
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    entries.insert(
                        addr.to_string(),
                        PoolEntry::Connecting {
                            id,
                            waiters: vec![tx],
                        },
                    );
                    debug!(backend = %addr, connection = id, "Connecting to backend");
                    tokio::spawn(Arc::clone(self).connect_and_serve(addr.to_string(), id));
                    rx
                }
            }
        };

        waiter.await.unwrap_or(Err(BackendError::ConnectionLost))
    }

    /// Queues `frame` on the connection to `addr` and returns where its
    /// reply will arrive.
    pub async fn enqueue(
        self: &Arc<Self>,
        addr: &str,
        frame: &CommandFrame,
    ) -> Result<ReplyReceiver, BackendError> {
        let handle = self.get_or_connect(addr).await?;
        match handle.enqueue(frame) {
            // The session ended between lookup and send: one fresh attempt.
            Err(BackendError::ConnectionLost) => self.get_or_connect(addr).await?.enqueue(frame),
            result => result,
        }
    }

    /// Sends `frame` to `addr` and waits for the reply.
    pub async fn send(self: &Arc<Self>, addr: &str, frame: &CommandFrame) -> Result<ReplyFrame, BackendError> {
        let reply_rx = self.enqueue(addr, frame).await?;
        reply_rx.await.unwrap_or(Err(BackendError::ConnectionLost))
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|entry| matches!(entry, PoolEntry::Connected(h) if !h.is_closed()))
            .count()
    }

    /// Closes every connection and abandons outstanding connect attempts.
    pub fn close_all(&self) {
        let entries: Vec<PoolEntry> = self.entries.lock().unwrap().drain().map(|(_, e)| e).collect();
        for entry in entries {
            match entry {
                PoolEntry::Connected(handle) => handle.close(),
                PoolEntry::Connecting { waiters, .. } => {
                    for waiter in waiters {
                        let _ = waiter.send(Err(BackendError::ConnectionLost));
                    }
                }
            }
        }
    }

    async fn connect_and_serve(self: Arc<Self>, addr: String, id: u64) {
        let stream = match self.connector.connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(backend = %addr, error = %e, "Backend connect failed");
                let error = BackendError::ConnectFailed {
                    addr: addr.clone(),
                    reason: e.to_string(),
                };
                for waiter in self.take_waiters(&addr, id, None).unwrap_or_default() {
                    let _ = waiter.send(Err(error.clone()));
                }
                return;
            }
        };

        let (handle, commands) = BackendHandle::new(&addr, id);
        let Some(waiters) = self.take_waiters(&addr, id, Some(handle.clone())) else {
            // Abandoned by close_all while connecting.
            debug!(backend = %addr, connection = id, "Dropping abandoned backend connection");
            return;
        };

        info!(backend = %addr, connection = id, "Connected to backend");
        for waiter in waiters {
            let _ = waiter.send(Ok(handle.clone()));
        }

        let keepalive = self.keepalive.map(|config| Keepalive::start(handle.clone(), config));
        run_session(Arc::from(addr.as_str()), stream, commands).await;
        drop(keepalive);

        self.forget(&addr, id);
    }

    /// Resolves the attempt `id` for `addr`: takes its waiters and either
    /// installs `handle` or removes the entry. `None` if the attempt is no
    /// longer the one on record.
    fn take_waiters(&self, addr: &str, id: u64, handle: Option<BackendHandle>) -> Option<Vec<Waiter>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(addr) {
            Some(PoolEntry::Connecting { id: attempt, .. }) if *attempt == id => {}
            _ => return None,
        }

        let previous = match handle {
            Some(handle) => entries.insert(addr.to_string(), PoolEntry::Connected(handle)),
            None => entries.remove(addr),
        };
        match previous {
            Some(PoolEntry::Connecting { waiters, .. }) => Some(waiters),
            _ => None,
        }
    }

    fn forget(&self, addr: &str, id: u64) {
        let mut entries = self.entries.lock().unwrap();
        if matches!(entries.get(addr), Some(PoolEntry::Connected(h)) if h.id() == id) {
            entries.remove(addr);
            debug!(backend = %addr, connection = id, "Backend connection removed from pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::connector::testing::{ConnectRequest, ScriptedConnector};
    use crate::protocol::ParseError;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::{assert_pending, assert_ready};

    fn pool() -> (
        Arc<BackendPool<ScriptedConnector>>,
        tokio::sync::mpsc::UnboundedReceiver<ConnectRequest>,
    ) {
        let (connector, requests) = ScriptedConnector::new();
        (Arc::new(BackendPool::new(connector)), requests)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_connect() {
        let (pool, mut requests) = pool();

        let mut first = tokio_test::task::spawn({
            let pool = pool.clone();
            async move { pool.get_or_connect("A:1").await }
        });
        let mut second = tokio_test::task::spawn({
            let pool = pool.clone();
            async move { pool.get_or_connect("A:1").await }
        });
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        let request = requests.recv().await.unwrap();
        assert_eq!(request.addr, "A:1");
        let _backend = request.accept();
        settle().await;

        // Exactly one underlying connect.
        assert!(requests.try_recv().is_err());

        assert!(first.is_woken());
        assert!(second.is_woken());
        let a = assert_ready!(first.poll()).unwrap();
        let b = assert_ready!(second.poll()).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(pool.connection_count(), 1);

        // A later lookup reuses the live connection.
        let c = pool.get_or_connect("A:1").await.unwrap();
        assert_eq!(c.id(), a.id());
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_reaches_every_waiter() {
        let (pool, mut requests) = pool();

        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get_or_connect("A:1").await }
        });
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get_or_connect("A:1").await }
        });
        settle().await;

        requests.recv().await.unwrap().refuse();
        let expected = BackendError::ConnectFailed {
            addr: "A:1".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(first.await.unwrap().unwrap_err(), expected);
        assert_eq!(second.await.unwrap().unwrap_err(), expected);
        assert_eq!(pool.connection_count(), 0);

        // No implicit retry; the next lookup starts a fresh attempt.
        assert!(requests.try_recv().is_err());
        let third = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get_or_connect("A:1").await }
        });
        let _backend = requests.recv().await.unwrap().accept();
        assert!(third.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_clears_entry_for_reconnect() {
        let (pool, mut requests) = pool();

        let lookup = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get_or_connect("A:1").await }
        });
        let backend = requests.recv().await.unwrap().accept();
        let handle = lookup.await.unwrap().unwrap();

        drop(backend);
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.connection_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(handle.is_closed());

        let lookup = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get_or_connect("A:1").await }
        });
        let _backend = requests.recv().await.unwrap().accept();
        let replacement = lookup.await.unwrap().unwrap();
        assert_ne!(replacement.id(), handle.id());
    }

    #[tokio::test]
    async fn test_send_round_trip_in_order() {
        let (pool, mut requests) = pool();

        let r1 = tokio::spawn({
            let pool = pool.clone();
            async move {
                let rx1 = pool.enqueue("A:1", &CommandFrame::from_parts(["GET", "k1"])).await.unwrap();
                let rx2 = pool.enqueue("A:1", &CommandFrame::from_parts(["GET", "k2"])).await.unwrap();
                let rx3 = pool.enqueue("A:1", &CommandFrame::from_parts(["GET", "k3"])).await.unwrap();
                (rx1.await.unwrap(), rx2.await.unwrap(), rx3.await.unwrap())
            }
        });
        let mut backend = requests.recv().await.unwrap().accept();

        let expected = [
            CommandFrame::from_parts(["GET", "k1"]).encode(),
            CommandFrame::from_parts(["GET", "k2"]).encode(),
            CommandFrame::from_parts(["GET", "k3"]).encode(),
        ]
        .concat();
        let mut received = vec![0u8; expected.len()];
        backend.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        for chunk in [&b"$2\r\nv"[..], b"1\r\n$-1\r\n$2", b"\r\nv3\r\n"] {
            backend.write_all(chunk).await.unwrap();
            settle().await;
        }

        let (a, b, c) = r1.await.unwrap();
        assert_eq!(a, Ok(ReplyFrame::bulk("v1")));
        assert_eq!(b, Ok(ReplyFrame::null()));
        assert_eq!(c, Ok(ReplyFrame::bulk("v3")));
    }

    #[tokio::test]
    async fn test_protocol_error_fails_oldest_and_drops_connection() {
        let (pool, mut requests) = pool();

        let pending = tokio::spawn({
            let pool = pool.clone();
            async move {
                let rx1 = pool.enqueue("A:1", &CommandFrame::from_parts(["GET", "a"])).await.unwrap();
                let rx2 = pool.enqueue("A:1", &CommandFrame::from_parts(["GET", "b"])).await.unwrap();
                (rx1.await.unwrap(), rx2.await.unwrap())
            }
        });
        let mut backend = requests.recv().await.unwrap().accept();
        settle().await;
        backend.write_all(b"!bogus\r\n").await.unwrap();

        let (first, second) = pending.await.unwrap();
        assert_eq!(first, Err(BackendError::Protocol(ParseError::UnknownPrefix(b'!'))));
        assert_eq!(second, Err(BackendError::ConnectionLost));

        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.connection_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_all() {
        let (pool, mut requests) = pool();

        let pending = tokio::spawn({
            let pool = pool.clone();
            async move { pool.send("A:1", &CommandFrame::from_parts(["GET", "a"])).await }
        });
        let _backend = requests.recv().await.unwrap().accept();
        settle().await;
        assert_eq!(pool.connection_count(), 1);

        pool.close_all();
        assert_eq!(pending.await.unwrap(), Err(BackendError::ConnectionLost));
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_keepalive_is_attached() {
        let (connector, mut requests) = ScriptedConnector::new();
        let pool = Arc::new(BackendPool::new(connector).with_keepalive(KeepaliveConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(1),
        }));

        let lookup = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get_or_connect("A:1").await }
        });
        let mut backend = requests.recv().await.unwrap().accept();
        lookup.await.unwrap().unwrap();

        let wire = CommandFrame::from_parts(["PING"]).encode();
        let mut buf = vec![0u8; wire.len()];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, wire.to_vec());
    }
}
