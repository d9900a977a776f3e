//! Command Dispatch
//!
//! Decides what happens to each decoded command:
//!
//! ```text
//!   CommandFrame
//!        │
//!        ▼
//!   lookup(name) ──unknown──> -ERR unknown command
//!        │
//!        ▼
//!   arity check ──mismatch──> -ERR wrong number of arguments
//!        │
//!        ├── Local ───> answered here (PING, ECHO, INFO, COMMAND, TIME, QUIT)
//!        │
//!        └── Forward ─> resolve(key) ──unresolved──> -ERR shard not ready
//!                            │
//!                            ▼
//!                      pool.enqueue ──failed──> -ERR backend not alive
//!                            │
//!                            ▼
//!                   Dispatch::Pending(reply receiver)
//! ```
//!
//! Forwarded frames go out unchanged (inline commands are re-encoded as
//! multibulk) and their replies come back unchanged.

use crate::backend::{BackendError, Connector, ReplyReceiver, TcpConnector};
use crate::commands::table::{self, CommandKind, CommandSpec};
use crate::protocol::{CommandFrame, ParseError, ReplyFrame};
use crate::proxy::Proxy;
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// What the client session should do with one command.
#[derive(Debug)]
pub enum Dispatch {
    /// Write this reply.
    Reply(ReplyFrame),
    /// Write the backend's reply once it arrives.
    Pending(ReplyReceiver),
    /// Write this reply, then close the connection.
    Close(ReplyFrame),
}

/// Reply for a command the table does not know.
pub fn unknown_command(name: &[u8]) -> ReplyFrame {
    ReplyFrame::error(format!(
        "ERR unknown command '{}'",
        String::from_utf8_lossy(name)
    ))
}

/// Reply for an argument count that does not match the command's arity.
pub fn wrong_arity(name: &str) -> ReplyFrame {
    ReplyFrame::error(format!("ERR wrong number of arguments for '{}' command", name))
}

/// Reply for a key whose shard has no known owner yet.
pub fn not_ready() -> ReplyFrame {
    ReplyFrame::error("ERR shard not ready")
}

/// Reply for a forwarded command whose backend failed.
pub fn backend_failed(error: &BackendError) -> ReplyFrame {
    match error {
        BackendError::Timeout => ReplyFrame::error("ERR backend timed out"),
        _ => ReplyFrame::error("ERR backend not alive"),
    }
}

/// Reply sent just before closing a connection over malformed input.
pub fn protocol_error(error: &ParseError) -> ReplyFrame {
    ReplyFrame::error(format!("ERR Protocol error: {}", error))
}

/// Classifies commands and either answers or forwards them.
pub struct CommandHandler<C: Connector = TcpConnector> {
    proxy: Arc<Proxy<C>>,
}

impl<C: Connector> Clone for CommandHandler<C> {
    fn clone(&self) -> Self {
        Self {
            proxy: Arc::clone(&self.proxy),
        }
    }
}

impl<C: Connector> CommandHandler<C> {
    pub fn new(proxy: Arc<Proxy<C>>) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &Arc<Proxy<C>> {
        &self.proxy
    }

    /// Handles one command.
    ///
    /// Forwarded commands are on the backend's queue when this returns, so
    /// calling `dispatch` in arrival order keeps per-backend send order.
    pub async fn dispatch(&self, frame: CommandFrame) -> Dispatch {
        let name = frame.lowercase_name();
        let stats = self.proxy.stats();

        let Some(spec) = table::lookup(&name) else {
            debug!(command = %name, "Unknown command");
            stats.error_replied();
            return Dispatch::Reply(unknown_command(frame.name()));
        };

        if !spec.accepts(frame.len()) {
            stats.error_replied();
            return Dispatch::Reply(wrong_arity(spec.name));
        }

        match spec.kind {
            CommandKind::Local => {
                stats.command_local();
                self.execute_local(spec, &frame)
            }
            CommandKind::Forward => self.forward(spec, frame).await,
        }
    }

    async fn forward(&self, spec: &CommandSpec, frame: CommandFrame) -> Dispatch {
        let stats = self.proxy.stats();

        let Some(key) = frame.arg(spec.key_index) else {
            stats.error_replied();
            return Dispatch::Reply(wrong_arity(spec.name));
        };
        let Some(addr) = self.proxy.table().resolve(key) else {
            trace!(command = spec.name, "Key resolves to no backend");
            stats.error_replied();
            return Dispatch::Reply(not_ready());
        };

        match self.proxy.pool().enqueue(&addr, &frame).await {
            Ok(reply_rx) => {
                trace!(command = spec.name, backend = %addr, "Forwarded");
                stats.command_forwarded();
                Dispatch::Pending(reply_rx)
            }
            Err(e) => {
                debug!(command = spec.name, backend = %addr, error = %e, "Forward failed");
                stats.error_replied();
                Dispatch::Reply(backend_failed(&e))
            }
        }
    }

    fn execute_local(&self, spec: &CommandSpec, frame: &CommandFrame) -> Dispatch {
        let args = &frame.args()[1..];
        let reply = match spec.name {
            "ping" => self.cmd_ping(args),
            "echo" => ReplyFrame::Bulk(Some(args[0].clone())),
            "info" => self.cmd_info(args),
            "command" => self.cmd_command(),
            "time" => self.cmd_time(),
            "quit" => return Dispatch::Close(ReplyFrame::ok()),
            _ => unknown_command(frame.name()),
        };
        Dispatch::Reply(reply)
    }

    /// PING [message]
    fn cmd_ping(&self, args: &[Bytes]) -> ReplyFrame {
        match args {
            [] => ReplyFrame::pong(),
            [message] => ReplyFrame::Bulk(Some(message.clone())),
            _ => wrong_arity("ping"),
        }
    }

    /// INFO [section]
    fn cmd_info(&self, args: &[Bytes]) -> ReplyFrame {
        let section = match args {
            [] => None,
            [section] => Some(String::from_utf8_lossy(section).to_lowercase()),
            _ => return wrong_arity("info"),
        };
        let wanted = |name: &str| match section.as_deref() {
            None | Some("all") | Some("everything") | Some("default") => true,
            Some(s) => s == name,
        };

        let stats = self.proxy.stats();
        let table = self.proxy.table().stats();
        let mut info = String::new();

        if wanted("server") {
            info.push_str(&format!(
                "# Server\r\n\
                 flashproxy_version:{}\r\n\
                 os:{}\r\n\
                 uptime_in_seconds:{}\r\n\
                 \r\n",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                self.proxy.uptime_secs(),
            ));
        }
        if wanted("clients") {
            info.push_str(&format!(
                "# Clients\r\n\
                 connected_clients:{}\r\n\
                 \r\n",
                stats.active_connections.load(Ordering::Relaxed),
            ));
        }
        if wanted("stats") {
            info.push_str(&format!(
                "# Stats\r\n\
                 total_connections_received:{}\r\n\
                 total_commands_processed:{}\r\n\
                 commands_forwarded:{}\r\n\
                 commands_local:{}\r\n\
                 error_replies:{}\r\n\
                 total_net_input_bytes:{}\r\n\
                 total_net_output_bytes:{}\r\n\
                 \r\n",
                stats.connections_accepted.load(Ordering::Relaxed),
                stats.commands_processed.load(Ordering::Relaxed),
                stats.commands_forwarded.load(Ordering::Relaxed),
                stats.commands_local.load(Ordering::Relaxed),
                stats.error_replies.load(Ordering::Relaxed),
                stats.bytes_read.load(Ordering::Relaxed),
                stats.bytes_written.load(Ordering::Relaxed),
            ));
        }
        if wanted("backends") {
            info.push_str(&format!(
                "# Backends\r\n\
                 backend_connections:{}\r\n\
                 \r\n",
                self.proxy.pool().connection_count(),
            ));
        }
        if wanted("topology") {
            info.push_str(&format!(
                "# Topology\r\n\
                 shard_count:{}\r\n\
                 assigned_shards:{}\r\n\
                 server_sets:{}\r\n",
                table.shard_count, table.assigned_shards, table.server_sets,
            ));
        }

        ReplyFrame::bulk(info)
    }

    /// COMMAND
    fn cmd_command(&self) -> ReplyFrame {
        ReplyFrame::Array(
            table::all()
                .iter()
                .map(|spec| ReplyFrame::bulk(spec.name.to_uppercase()))
                .collect(),
        )
    }

    /// TIME
    fn cmd_time(&self) -> ReplyFrame {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        ReplyFrame::Array(vec![
            ReplyFrame::bulk(now.as_secs().to_string()),
            ReplyFrame::bulk(now.subsec_micros().to_string()),
        ])
    }
}
