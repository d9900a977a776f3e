//! Backend Session
//!
//! One task per backend connection. The task owns the socket and a FIFO of
//! reply continuations, one per request written and not yet answered.
//!
//! ```text
//!  BackendHandle::enqueue ──mpsc──> ┌────────────────────────────┐
//!                                   │ session task               │
//!                                   │  out buffer ──write──> sock│
//!        oneshot <── pop_front ──── │  FIFO <── decode <── sock  │
//!                                   └────────────────────────────┘
//! ```
//!
//! Backends answer pipelined requests in order, so the n-th decoded reply
//! belongs to the n-th request written. Requests are appended to the FIFO
//! in the same step that appends their bytes to the output buffer, which
//! keeps the two sequences aligned.
//!
//! When the session ends for any reason, no continuation is left behind:
//! a reply that fails to decode goes to the oldest waiter as a protocol
//! error, everything else queued (including requests still in the channel)
//! gets `ConnectionLost`.

use crate::protocol::{CommandFrame, ParseError, ReplyDecoder, ReplyFrame};
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Errors a forwarded request can end with.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("connection to backend lost")]
    ConnectionLost,

    #[error("backend protocol error: {0}")]
    Protocol(#[from] ParseError),

    #[error("backend timed out")]
    Timeout,
}

/// The eventual answer to one forwarded request.
pub type ReplyReceiver = oneshot::Receiver<Result<ReplyFrame, BackendError>>;

type ReplySender = oneshot::Sender<Result<ReplyFrame, BackendError>>;

pub(crate) enum SessionCommand {
    Request { bytes: BytesMut, reply_tx: ReplySender },
    Close,
}

pub(crate) type SessionReceiver = mpsc::UnboundedReceiver<SessionCommand>;

/// A cheap, cloneable reference to a live backend connection.
#[derive(Debug, Clone)]
pub struct BackendHandle {
    addr: Arc<str>,
    id: u64,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl BackendHandle {
    pub(crate) fn new(addr: &str, id: u64) -> (Self, SessionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            addr: Arc::from(addr),
            id,
            tx,
        };
        (handle, rx)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Distinguishes successive connections to the same address.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once the session task has stopped accepting requests.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queues `frame` for sending and returns where its reply will arrive.
    ///
    /// Frames enqueued through the same handle reach the backend, and are
    /// answered, in enqueue order.
    pub fn enqueue(&self, frame: &CommandFrame) -> Result<ReplyReceiver, BackendError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Request {
                bytes: frame.encode(),
                reply_tx,
            })
            .map_err(|_| BackendError::ConnectionLost)?;
        Ok(reply_rx)
    }

    /// Sends `frame` and waits for its reply.
    pub async fn send(&self, frame: &CommandFrame) -> Result<ReplyFrame, BackendError> {
        let reply_rx = self.enqueue(frame)?;
        reply_rx.await.unwrap_or(Err(BackendError::ConnectionLost))
    }

    /// Asks the session to close. Queued requests fail with `ConnectionLost`.
    pub fn close(&self) {
        let _ = self.tx.send(SessionCommand::Close);
    }
}

/// Why a session stopped.
#[derive(Debug)]
enum SessionEnd {
    ClosedByBackend,
    CloseRequested,
    Io(io::Error),
    Protocol(ParseError),
    UnexpectedReply,
}

/// Drives one backend connection until it closes.
pub(crate) async fn run_session<S>(addr: Arc<str>, stream: S, mut commands: SessionReceiver)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut out = BytesMut::new();
    let mut input = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
    let mut decoder = ReplyDecoder::new();
    let mut pending: VecDeque<ReplySender> = VecDeque::new();

    let end = loop {
        if input.capacity() - input.len() < 1024 {
            input.reserve(INITIAL_BUFFER_SIZE);
        }

        tokio::select! {
            result = writer.write_buf(&mut out), if out.has_remaining() => {
                if let Err(e) = result {
                    break SessionEnd::Io(e);
                }
            }
            result = reader.read_buf(&mut input) => {
                match result {
                    Ok(0) => break SessionEnd::ClosedByBackend,
                    Ok(n) => {
                        trace!(backend = %addr, bytes = n, "Read from backend");
                        if let Err(end) = dispatch_replies(&mut decoder, &mut input, &mut pending) {
                            break end;
                        }
                    }
                    Err(e) => break SessionEnd::Io(e),
                }
            }
            command = commands.recv() => match command {
                Some(SessionCommand::Request { bytes, reply_tx }) => {
                    out.extend_from_slice(&bytes);
                    pending.push_back(reply_tx);
                }
                Some(SessionCommand::Close) | None => break SessionEnd::CloseRequested,
            }
        }
    };

    match &end {
        SessionEnd::CloseRequested => debug!(backend = %addr, "Backend session closed"),
        SessionEnd::ClosedByBackend => info!(backend = %addr, "Backend closed the connection"),
        SessionEnd::Io(e) => warn!(backend = %addr, error = %e, "Backend I/O error"),
        SessionEnd::Protocol(e) => warn!(backend = %addr, error = %e, "Backend protocol error"),
        SessionEnd::UnexpectedReply => {
            warn!(backend = %addr, "Reply from backend with no pending request")
        }
    }

    // Nothing queued may wait forever.
    commands.close();
    let mut lost = pending.len();
    for reply_tx in pending.drain(..) {
        let _ = reply_tx.send(Err(BackendError::ConnectionLost));
    }
    while let Ok(command) = commands.try_recv() {
        if let SessionCommand::Request { reply_tx, .. } = command {
            let _ = reply_tx.send(Err(BackendError::ConnectionLost));
            lost += 1;
        }
    }
    if lost > 0 {
        debug!(backend = %addr, requests = lost, "Failed requests pending on closed backend");
    }
}

/// Hands every complete reply in `input` to the oldest waiter.
fn dispatch_replies(
    decoder: &mut ReplyDecoder,
    input: &mut BytesMut,
    pending: &mut VecDeque<ReplySender>,
) -> Result<(), SessionEnd> {
    loop {
        match decoder.decode_buf(input) {
            Ok(Some(reply)) => {
                let Some(reply_tx) = pending.pop_front() else {
                    return Err(SessionEnd::UnexpectedReply);
                };
                // The requester may have gone away; its reply is dropped.
                let _ = reply_tx.send(Ok(reply));
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                if let Some(reply_tx) = pending.pop_front() {
                    let _ = reply_tx.send(Err(BackendError::Protocol(e.clone())));
                }
                return Err(SessionEnd::Protocol(e));
            }
        }
    }
}
