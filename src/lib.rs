//! # FlashProxy - A Sharding Proxy for Redis-Protocol Backends
//!
//! FlashProxy sits between clients speaking the Redis protocol and a set of
//! independent key-value nodes. Clients connect once and see a single
//! server; every command is routed by its key to the node owning that key's
//! shard, forwarded over a pooled connection, and its reply relayed back
//! unchanged.
//!
//! ## Features
//!
//! - **Incremental Decoding**: requests and replies are decoded across
//!   arbitrary read boundaries, multibulk or inline
//! - **Shard Routing**: CRC16 of the key (or its `{hash tag}`) picks a shard,
//!   shards map to server sets, sets to ordered server lists
//! - **Connection Pooling**: one connection per backend, pipelined, with
//!   concurrent connect attempts coalesced
//! - **Ordered Replies**: a client always gets replies in the order it sent
//!   its commands, even across backends
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             FlashProxy                                  │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Client      │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Session    │    │  Handler    │                  │
//! │  └─────────────┘    └──────▲──────┘    └──────┬──────┘                  │
//! │                            │ replies          │ resolve(key)            │
//! │                            │                  ▼                         │
//! │  ┌─────────────┐    ┌──────┴──────────────────────────────────────┐     │
//! │  │  Topology   │───>│ ShardTable ──> BackendPool ──> session tasks│──> backends
//! │  │  Updater    │    └─────────────────────────────────────────────┘     │
//! │  └─────────────┘                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashproxy::backend::{BackendPool, TcpConnector};
//! use flashproxy::commands::CommandHandler;
//! use flashproxy::connection::handle_connection;
//! use flashproxy::routing::{SharedShardTable, TopologySnapshot, TopologyUpdater};
//! use flashproxy::Proxy;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let table = SharedShardTable::default();
//!     TopologyUpdater::new(table.clone()).load(&TopologySnapshot {
//!         owners: (0..1024).map(|shard| (shard, 1)).collect(),
//!         sets: vec![(1, vec!["127.0.0.1:7000".to_string()])],
//!     });
//!
//!     let proxy = Arc::new(Proxy::new(table, BackendPool::new(TcpConnector::default())));
//!     let listener = TcpListener::bind("127.0.0.1:6380").await.unwrap();
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await.unwrap();
//!         tokio::spawn(handle_connection(stream, addr, CommandHandler::new(proxy.clone())));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: frame types and the request/reply decoders
//! - [`routing`]: shard table and topology updates
//! - [`backend`]: connection pool, per-connection sessions, keep-alive
//! - [`commands`]: command table and dispatch
//! - [`connection`]: client sessions and statistics
//! - [`config`]: TOML configuration
//!
//! ## Design Highlights
//!
//! ### No Locks Across Awaits
//!
//! The shard table sits behind an `RwLock` and the pool's address map behind
//! a `Mutex`; both are held only for a lookup or an update. Each backend
//! connection's request FIFO is owned by that connection's task and needs
//! no lock at all.
//!
//! ### Continuations as Channels
//!
//! Every forwarded request carries a `oneshot` sender. The backend session
//! resolves it with the matching reply, or with an error when the connection
//! dies, so no client ever waits on a request that can no longer complete.

pub mod backend;
pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod proxy;
pub mod routing;

// Re-export commonly used types for convenience
pub use backend::{BackendError, BackendPool, TcpConnector};
pub use commands::CommandHandler;
pub use config::Config;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{CommandFrame, ParseError, ReplyFrame};
pub use proxy::Proxy;
pub use routing::{ShardTable, SharedShardTable, TopologyUpdater};

/// The default port FlashProxy listens on
pub const DEFAULT_PORT: u16 = 6380;

/// The default host FlashProxy binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of FlashProxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
