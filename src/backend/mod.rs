//! Backend Module
//!
//! Everything on the proxy's backend side of the wire.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       BackendPool                         │
//! │   addr ─> Connecting { waiters } | Connected(handle)      │
//! └───────────────┬───────────────────────────────────────────┘
//!                 │ one per address
//!                 ▼
//! ┌──────────────────────────┐      ┌──────────────────────┐
//! │  session task            │◄─────│ Keepalive (optional) │
//! │  FIFO of continuations   │ PING └──────────────────────┘
//! └───────────┬──────────────┘
//!             │ Connector::Stream
//!             ▼
//!        backend node
//! ```
//!
//! - `connector`: opens streams (TCP in production)
//! - `session`: the per-connection multiplexer and [`BackendHandle`]
//! - `pool`: connect coalescing and connection reuse
//! - `keepalive`: periodic liveness pings

pub mod connector;
pub mod keepalive;
pub mod pool;
pub mod session;

pub use connector::{Connector, TcpConnector};
pub use keepalive::{Keepalive, KeepaliveConfig};
pub use pool::BackendPool;
pub use session::{BackendError, BackendHandle, ReplyReceiver};
