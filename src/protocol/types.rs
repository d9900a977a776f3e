//! RESP Frame Types
//!
//! Two kinds of frames cross the proxy:
//!
//! - [`CommandFrame`]: what a client asks for. Always an ordered list of byte
//!   strings, `args[0]` being the command name.
//! - [`ReplyFrame`]: what a backend node answers. One of the reply shapes
//!   selected by the first byte of the reply line.
//!
//! ## Wire Format
//!
//! Each RESP type starts with a type prefix byte:
//! - `+` Simple String
//! - `-` Error
//! - `:` Integer
//! - `$` Bulk String
//! - `*` Array
//!
//! All lines are terminated with CRLF (`\r\n`).
//!
//! ## Examples
//!
//! Simple String: `+OK\r\n`
//! Error: `-ERR unknown command\r\n`
//! Integer: `:1000\r\n`
//! Bulk String: `$5\r\nhello\r\n`
//! Null Bulk String: `$-1\r\n`
//! Array: `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A client command: `args[0]` is the command name, the rest its arguments.
///
/// Produced by [`RequestDecoder`](crate::protocol::RequestDecoder) from either
/// the multibulk or the inline encoding. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    args: Vec<Bytes>,
}

impl CommandFrame {
    /// Builds a frame from its arguments, or `None` if there are none.
    pub fn new(args: Vec<Bytes>) -> Option<Self> {
        if args.is_empty() {
            None
        } else {
            Some(Self { args })
        }
    }

    /// Convenience constructor for tests and internal requests (e.g. `PING`).
    ///
    /// # Panics
    ///
    /// Panics if `parts` is empty.
    pub fn from_parts<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        let args: Vec<Bytes> = parts.into_iter().map(Into::into).collect();
        assert!(!args.is_empty(), "a command frame needs at least one argument");
        Self { args }
    }

    /// The raw command name, as sent by the client.
    pub fn name(&self) -> &Bytes {
        &self.args[0]
    }

    /// The command name lower-cased, for table lookups and messages.
    pub fn lowercase_name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_lowercase()
    }

    /// All arguments, including the command name.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Returns the argument at `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    /// Number of arguments, including the command name.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Appends the multibulk encoding of this frame to `dst`.
    ///
    /// Inline commands are forwarded in this form too, so backends only ever
    /// see multibulk requests.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        let body: usize = self.args.iter().map(|a| a.len() + 16).sum();
        dst.reserve(16 + body);
        dst.put_u8(prefix::ARRAY);
        dst.extend_from_slice(self.args.len().to_string().as_bytes());
        dst.extend_from_slice(CRLF);
        for arg in &self.args {
            dst.put_u8(prefix::BULK_STRING);
            dst.extend_from_slice(arg.len().to_string().as_bytes());
            dst.extend_from_slice(CRLF);
            dst.extend_from_slice(arg);
            dst.extend_from_slice(CRLF);
        }
    }

    /// Returns the multibulk encoding of this frame.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

/// A backend reply.
///
/// Replies are relayed to clients without reinterpretation, so every shape
/// that can arrive on the wire has a distinct variant: a null bulk string
/// (`$-1`) and a null array (`*-1`) serialize back to their own encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyFrame {
    /// Status reply.
    /// Format: `+<string>\r\n`
    Simple(String),

    /// Error reply.
    /// Format: `-<error message>\r\n`
    Error(String),

    /// 64-bit signed integer.
    /// Format: `:<integer>\r\n`
    Integer(i64),

    /// Binary-safe string; `None` is the null bulk string `$-1\r\n`.
    /// Format: `$<length>\r\n<data>\r\n`
    Bulk(Option<Bytes>),

    /// Nested replies, which may contain nulls and further arrays.
    /// Format: `*<count>\r\n<element1><element2>...`
    Array(Vec<ReplyFrame>),

    /// The null array `*-1\r\n`.
    NullArray,
}

impl ReplyFrame {
    /// Creates a new status reply.
    ///
    /// # Example
    /// ```
    /// use flashproxy::protocol::ReplyFrame;
    /// let ok = ReplyFrame::simple("OK");
    /// assert_eq!(ok.serialize(), b"+OK\r\n");
    /// ```
    pub fn simple(s: impl Into<String>) -> Self {
        ReplyFrame::Simple(s.into())
    }

    /// Creates a new error reply.
    pub fn error(s: impl Into<String>) -> Self {
        ReplyFrame::Error(s.into())
    }

    /// Creates a new bulk string reply.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        ReplyFrame::Bulk(Some(data.into()))
    }

    /// The null bulk string.
    pub fn null() -> Self {
        ReplyFrame::Bulk(None)
    }

    pub fn ok() -> Self {
        ReplyFrame::Simple("OK".to_string())
    }

    pub fn pong() -> Self {
        ReplyFrame::Simple("PONG".to_string())
    }

    /// Serializes the reply to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf.to_vec()
    }

    /// Serializes the reply into an existing buffer.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        match self {
            ReplyFrame::Simple(s) => {
                buf.put_u8(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            ReplyFrame::Error(s) => {
                buf.put_u8(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            ReplyFrame::Integer(n) => {
                buf.put_u8(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            ReplyFrame::Bulk(Some(data)) => {
                buf.put_u8(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            ReplyFrame::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            ReplyFrame::Array(values) => {
                buf.put_u8(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
            ReplyFrame::NullArray => buf.extend_from_slice(b"*-1\r\n"),
        }
    }

    /// Returns true if this reply is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, ReplyFrame::Error(_))
    }
}

impl fmt::Display for ReplyFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyFrame::Simple(s) => write!(f, "\"{}\"", s),
            ReplyFrame::Error(s) => write!(f, "(error) {}", s),
            ReplyFrame::Integer(n) => write!(f, "(integer) {}", n),
            ReplyFrame::Bulk(Some(data)) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            ReplyFrame::Bulk(None) | ReplyFrame::NullArray => write!(f, "(nil)"),
            ReplyFrame::Array(values) => {
                if values.is_empty() {
                    return write!(f, "(empty array)");
                }
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frame_rejects_empty() {
        assert!(CommandFrame::new(vec![]).is_none());
    }

    #[test]
    fn test_command_frame_encode() {
        let frame = CommandFrame::from_parts(["GET", "foo"]);
        assert_eq!(&frame.encode()[..], b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
    }

    #[test]
    fn test_command_frame_binary_arg() {
        let frame = CommandFrame::from_parts([Bytes::from("SET"), Bytes::from(&b"k\r\n"[..])]);
        assert_eq!(&frame.encode()[..], b"*2\r\n$3\r\nSET\r\n$3\r\nk\r\n\r\n");
        assert_eq!(frame.lowercase_name(), "set");
    }

    #[test]
    fn test_reply_serialize_shapes() {
        assert_eq!(ReplyFrame::ok().serialize(), b"+OK\r\n");
        assert_eq!(
            ReplyFrame::error("ERR unknown command").serialize(),
            b"-ERR unknown command\r\n"
        );
        assert_eq!(ReplyFrame::Integer(-42).serialize(), b":-42\r\n");
        assert_eq!(ReplyFrame::bulk("hello").serialize(), b"$5\r\nhello\r\n");
        assert_eq!(ReplyFrame::null().serialize(), b"$-1\r\n");
        assert_eq!(ReplyFrame::NullArray.serialize(), b"*-1\r\n");
    }

    #[test]
    fn test_nested_array_serialize() {
        let value = ReplyFrame::Array(vec![
            ReplyFrame::Integer(1),
            ReplyFrame::Array(vec![ReplyFrame::null(), ReplyFrame::Integer(3)]),
        ]);
        assert_eq!(value.serialize(), b"*2\r\n:1\r\n*2\r\n$-1\r\n:3\r\n");
    }
}
