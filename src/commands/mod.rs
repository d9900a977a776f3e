//! Command Handling Module
//!
//! Classifies each decoded command and decides where it is answered.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ RequestDecoder  │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Lookup       │
//! │  - Arity check  │
//! │  - Local / Fwd  │
//! └───┬─────────┬───┘
//!     │         │
//!     ▼         ▼
//!   reply   ShardTable ──> BackendPool
//! ```
//!
//! ## Local Commands
//!
//! - `PING [message]`, `ECHO message`
//! - `INFO [section]`: proxy, client, backend and topology statistics
//! - `COMMAND`, `TIME`, `QUIT`
//!
//! Everything else in the [`table`] is forwarded to the backend that owns
//! its key.

pub mod handler;
pub mod table;

pub use handler::{CommandHandler, Dispatch};
pub use table::{CommandKind, CommandSpec};
