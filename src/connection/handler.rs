//! Client Session
//!
//! One task per client connection. It reads bytes, decodes commands, hands
//! each one to the [`CommandHandler`] and writes the replies back.
//!
//! ## Reply Ordering
//!
//! A client may pipeline commands that land on different backends, and the
//! backends answer independently. Replies are nevertheless written in the
//! order the commands arrived: every command gets a slot in a FIFO of
//! pending replies, and only the slot at the front is ever written.
//!
//! ```text
//!   read ──> decode ──> dispatch ──┬── Reply(r) ───> [Ready(r)]   ┐
//!                                  └── Pending(rx) > [Waiting(rx)]├─ pending FIFO
//!                                                                 ┘
//!   write <── serialize <── front slot once it is Ready / rx resolves
//! ```
//!
//! ## Backpressure
//!
//! While the FIFO holds `max_pending` slots the session neither decodes nor
//! reads, so a client that never reads its replies cannot pile up unbounded
//! work on the proxy.
//!
//! ## Malformed Input
//!
//! A protocol error cannot be recovered from: the replies already owed are
//! written, followed by an `ERR Protocol error` reply, and the connection is
//! closed.

use crate::backend::{BackendError, Connector, ReplyReceiver, TcpConnector};
use crate::commands::handler::{backend_failed, protocol_error};
use crate::commands::{CommandHandler, Dispatch};
use crate::protocol::{ParseError, ReplyFrame, RequestDecoder};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Maximum size for the read buffer.
///
/// The decoder drops finished arguments as it goes, so undecoded input is
/// at most one bulk argument or one inline line; anything larger is not
/// valid input.
const MAX_BUFFER_SIZE: usize = (1 << 20) + 64 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands decoded
    pub commands_processed: AtomicU64,
    /// Commands sent to a backend
    pub commands_forwarded: AtomicU64,
    /// Commands answered by the proxy itself
    pub commands_local: AtomicU64,
    /// Error replies generated by the proxy
    pub error_replies: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_forwarded(&self) {
        self.commands_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_local(&self) {
        self.commands_local.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_replied(&self) {
        self.error_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// A reply slot, in client submission order.
enum PendingReply {
    Ready(ReplyFrame),
    Waiting(ReplyReceiver),
}

/// Handles a single client connection.
pub struct ClientSession<S, C: Connector = TcpConnector> {
    stream: BufWriter<S>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Bytes read but not yet decoded
    buffer: BytesMut,

    decoder: RequestDecoder,
    handler: CommandHandler<C>,
    pending: VecDeque<PendingReply>,

    /// Serialized replies waiting to be written
    out: BytesMut,

    /// Set once no further commands will be accepted; the session ends with
    /// this result after the pending replies are written.
    closing: Option<Result<(), ConnectionError>>,

    max_pending: usize,
    stats: Arc<ConnectionStats>,
}

impl<S, C> ClientSession<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: Connector,
{
    pub fn new(stream: S, addr: SocketAddr, handler: CommandHandler<C>) -> Self {
        let stats = Arc::clone(handler.proxy().stats());
        let max_pending = handler.proxy().max_pending();
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            decoder: RequestDecoder::new(),
            handler,
            pending: VecDeque::new(),
            out: BytesMut::new(),
            closing: None,
            max_pending,
            stats,
        }
    }

    /// Runs the session until the client disconnects or has to be dropped.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %self.addr, "Client disconnected")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %self.addr, "Connection reset by client")
                }
                _ => warn!(client = %self.addr, error = %e, "Connection error"),
            },
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            self.process_frames().await;
            self.drain_ready();
            self.send_replies().await?;

            if self.pending.is_empty() {
                if let Some(end) = self.closing.take() {
                    return end;
                }
            }

            let can_read = self.closing.is_none() && self.pending.len() < self.max_pending;
            if can_read && !self.prepare_read() {
                continue;
            }

            tokio::select! {
                result = self.stream.get_mut().read_buf(&mut self.buffer), if can_read => {
                    let n = result?;
                    if n == 0 {
                        self.on_eof();
                    } else {
                        self.stats.bytes_read(n);
                        trace!(client = %self.addr, bytes = n, "Read data");
                    }
                }
                reply = next_reply(&mut self.pending), if !self.pending.is_empty() => {
                    self.pending.pop_front();
                    reply.serialize_into(&mut self.out);
                }
            }
        }
    }

    /// Decodes and dispatches every complete command in the buffer, as far
    /// as the pending cap allows.
    async fn process_frames(&mut self) {
        while self.closing.is_none() && self.pending.len() < self.max_pending {
            match self.decoder.decode_buf(&mut self.buffer) {
                Ok(Some(frame)) => {
                    self.stats.command_processed();
                    trace!(
                        client = %self.addr,
                        command = %frame.lowercase_name(),
                        remaining = self.buffer.len(),
                        "Parsed command"
                    );

                    match self.handler.dispatch(frame).await {
                        Dispatch::Reply(reply) => self.pending.push_back(PendingReply::Ready(reply)),
                        Dispatch::Pending(reply_rx) => {
                            self.pending.push_back(PendingReply::Waiting(reply_rx))
                        }
                        Dispatch::Close(reply) => {
                            self.pending.push_back(PendingReply::Ready(reply));
                            self.closing = Some(Ok(()));
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(client = %self.addr, error = %e, "Parse error");
                    self.stats.error_replied();
                    self.pending.push_back(PendingReply::Ready(protocol_error(&e)));
                    self.closing = Some(Err(ConnectionError::ParseError(e)));
                }
            }
        }
    }

    /// Serializes the replies at the front of the FIFO that need no waiting.
    fn drain_ready(&mut self) {
        while let Some(slot) = self.pending.front_mut() {
            let reply = match slot {
                PendingReply::Ready(reply) => std::mem::replace(reply, ReplyFrame::null()),
                PendingReply::Waiting(reply_rx) => match reply_rx.try_recv() {
                    Ok(result) => reply_from(result),
                    Err(tokio::sync::oneshot::error::TryRecvError::Empty) => break,
                    Err(tokio::sync::oneshot::error::TryRecvError::Closed) => {
                        backend_failed(&BackendError::ConnectionLost)
                    }
                },
            };
            self.pending.pop_front();
            reply.serialize_into(&mut self.out);
        }
    }

    fn on_eof(&mut self) {
        let end = if self.buffer.is_empty() && !self.decoder.is_mid_frame() {
            ConnectionError::ClientDisconnected
        } else {
            ConnectionError::UnexpectedEof
        };
        // Replies still owed are written before the session ends.
        self.closing = Some(Err(end));
    }

    /// Makes room for the next read. Returns `false`, and starts closing,
    /// if the buffer is over its limit.
    fn prepare_read(&mut self) -> bool {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            error!(
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            self.closing = Some(Err(ConnectionError::BufferFull));
            return false;
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }
        true
    }

    async fn send_replies(&mut self) -> Result<(), ConnectionError> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.out).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(self.out.len());
        trace!(client = %self.addr, bytes = self.out.len(), "Sent replies");
        self.out.clear();
        Ok(())
    }
}

/// Waits for the reply at the front of the FIFO.
async fn next_reply(pending: &mut VecDeque<PendingReply>) -> ReplyFrame {
    match pending.front_mut() {
        Some(PendingReply::Waiting(reply_rx)) => match reply_rx.await {
            Ok(result) => reply_from(result),
            Err(_) => backend_failed(&BackendError::ConnectionLost),
        },
        Some(PendingReply::Ready(reply)) => std::mem::replace(reply, ReplyFrame::null()),
        None => std::future::pending().await,
    }
}

fn reply_from(result: Result<ReplyFrame, BackendError>) -> ReplyFrame {
    match result {
        Ok(reply) => reply,
        Err(e) => {
            debug!(error = %e, "Backend request failed");
            backend_failed(&e)
        }
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed request
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial command)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// Runs a [`ClientSession`] for an accepted TCP connection to completion.
pub async fn handle_connection<C: Connector>(
    stream: TcpStream,
    addr: SocketAddr,
    handler: CommandHandler<C>,
) {
    let session = ClientSession::new(stream, addr, handler);
    if let Err(e) = session.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}
