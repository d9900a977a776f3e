//! Backend Keep-Alive
//!
//! A background task per backend connection that periodically sends `PING`
//! through the connection's own request queue.
//!
//! ## Why Through the Queue?
//!
//! The ping takes its place in the FIFO like any client request, so its
//! reply is correlated the same way and the client traffic around it is
//! undisturbed. A ping that errors or is not answered within the timeout
//! means the connection is no good: it is closed, which fails everything
//! queued on it and lets the pool reconnect on the next lookup.
//!
//! A busy backend answers the ping only after the requests queued before
//! it, so the timeout should be generous.

use crate::backend::session::{BackendError, BackendHandle};
use crate::protocol::CommandFrame;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Configuration for backend keep-alive pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Time between pings (default: 10s)
    pub interval: Duration,

    /// How long a ping may stay unanswered (default: 5s)
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        }
    }
}

/// A handle to a running keep-alive task.
///
/// When this handle is dropped, the task stops. It also stops by itself
/// once the connection closes.
#[derive(Debug)]
pub struct Keepalive {
    shutdown_tx: watch::Sender<bool>,
}

impl Keepalive {
    /// Starts pinging the connection behind `handle` every `config.interval`.
    pub fn start(handle: BackendHandle, config: KeepaliveConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        debug!(
            backend = %handle.addr(),
            interval_ms = config.interval.as_millis(),
            "Backend keep-alive started"
        );
        tokio::spawn(keepalive_loop(handle, config, shutdown_rx));

        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn keepalive_loop(
    handle: BackendHandle,
    config: KeepaliveConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let ping = CommandFrame::from_parts(["PING"]);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    trace!(backend = %handle.addr(), "Keep-alive stopped");
                    return;
                }
            }
        }

        if handle.is_closed() {
            return;
        }

        let result = match tokio::time::timeout(config.timeout, handle.send(&ping)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        };

        match result {
            Ok(reply) if !reply.is_error() => {
                trace!(backend = %handle.addr(), "Keep-alive ping answered");
            }
            Ok(reply) => {
                warn!(backend = %handle.addr(), reply = %reply, "Keep-alive ping refused, closing connection");
                handle.close();
                return;
            }
            Err(e) => {
                warn!(backend = %handle.addr(), error = %e, "Keep-alive ping failed, closing connection");
                handle.close();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::session::run_session;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn start_session(addr: &str) -> (BackendHandle, DuplexStream) {
        let (handle, commands) = BackendHandle::new(addr, 1);
        let (proxy_side, backend_side) = tokio::io::duplex(4096);
        tokio::spawn(run_session(Arc::from(addr), proxy_side, commands));
        (handle, backend_side)
    }

    fn quick() -> KeepaliveConfig {
        KeepaliveConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_answered_pings_keep_connection_open() {
        let (handle, mut backend) = start_session("10.0.0.1:7000");
        let _keepalive = Keepalive::start(handle.clone(), quick());

        let wire = CommandFrame::from_parts(["PING"]).encode();
        for _ in 0..3 {
            let mut buf = vec![0u8; wire.len()];
            backend.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, wire.to_vec());
            backend.write_all(b"+PONG\r\n").await.unwrap();
        }
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_unanswered_ping_closes_connection() {
        let (handle, mut backend) = start_session("10.0.0.1:7000");
        let _keepalive = Keepalive::start(handle.clone(), quick());

        // Swallow the ping and never answer; the proxy side eventually hangs up.
        let mut sink = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), backend.read_to_end(&mut sink))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_stop_on_drop() {
        let (handle, mut backend) = start_session("10.0.0.1:7000");
        let keepalive = Keepalive::start(handle.clone(), quick());
        drop(keepalive);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(20), backend.read(&mut buf)).await;
        assert!(read.is_err(), "no ping after the keep-alive was dropped");
        assert!(!handle.is_closed());
    }
}
