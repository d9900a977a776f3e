//! Connection Handler Module
//!
//! This module manages individual client connections to the proxy.
//! Each client connection is handled by its own async task.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (main.rs)                                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ClientSession                             │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Read bytes  │───>│ Decode      │───>│ Dispatch    │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               │             │
//! │  ┌─────────────┐    ┌─────────────────────┐   │             │
//! │  │ Write reply │<───│ Pending reply FIFO  │<──┘             │
//! │  └─────────────┘    └─────────────────────┘                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Pipelining**: many commands per read, replies in submission order
//! - **Backpressure**: reading pauses while too many replies are owed
//! - **Statistics**: connection, command and byte counters shared by all
//!   sessions
//!
//! ## Example
//!
//! ```ignore
//! use flashproxy::commands::CommandHandler;
//! use flashproxy::connection::handle_connection;
//!
//! // For each accepted connection...
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(handle_connection(stream, addr, CommandHandler::new(proxy.clone())));
//! ```

pub mod handler;

// Re-export commonly used types
pub use handler::{handle_connection, ClientSession, ConnectionError, ConnectionStats};
