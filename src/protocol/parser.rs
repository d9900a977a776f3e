//! Incremental Request Decoder
//!
//! Turns the byte stream of one client connection into [`CommandFrame`]s.
//!
//! ## How the Decoder Works
//!
//! The decoder is handed the caller's whole unconsumed buffer and returns
//! either:
//! - `Ok(Some((frame, consumed)))` - a complete frame occupying `consumed` bytes
//! - `Ok(None)` - need more data
//! - `Err(ParseError)` - the stream is structurally invalid
//!
//! Unlike a stateless parser it remembers how far it got, so a command that
//! arrives one byte at a time is scanned once, not re-parsed on every read.
//! The caller must keep presenting the same buffer prefix (with new bytes
//! appended) until a frame comes out, then drop exactly `consumed` bytes.
//!
//! ## State Machine
//!
//! ```text
//! ExpectMarker ──'*'──> ExpectCount ──> ExpectBulkMarker ──> ExpectBulkLength
//!      │                                      ▲                    │
//!      │ other byte                           └── ExpectBulkBody <─┘
//!      ▼                                               │ last arg
//!    Inline ──CRLF──> frame                            ▼
//!                                                    frame
//! ```
//!
//! Lines that do not start with `*` are inline commands: whitespace separated
//! tokens up to a bare CRLF. A line holding only blanks is skipped.

use crate::protocol::types::{prefix, CommandFrame};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Errors that can occur while decoding requests or replies.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown reply type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// A byte that has no business at this position
    #[error("expected '{expected}', got {found:#04x}")]
    UnexpectedByte { expected: char, found: u8 },

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a status or error line
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk length outside the accepted range
    #[error("invalid bulk length: {0}")]
    InvalidBulkLength(i64),

    /// Array count outside the accepted range
    #[error("invalid multibulk length: {0}")]
    InvalidArrayLength(i64),

    /// A CRLF was required here
    #[error("missing CRLF terminator")]
    MissingCrlf,

    /// A line grew past its limit without a terminator
    #[error("line too long: {0} bytes without CRLF")]
    LineTooLong(usize),

    /// Arrays nested deeper than allowed
    #[error("maximum nesting depth exceeded: {0}")]
    TooDeep(usize),
}

/// Result type for decoding operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Largest argument count accepted in a multibulk request
pub const MAX_MULTIBULK_LEN: i64 = 1024;

/// Largest bulk argument accepted in a request (1 MiB)
pub const MAX_REQUEST_BULK_LEN: i64 = 1 << 20;

/// Longest inline command line
pub const MAX_INLINE_LEN: usize = 64 * 1024;

/// Longest `<digits>\r\n` line we wait for before giving up
pub(crate) const MAX_LENGTH_LINE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ExpectMarker,
    ExpectCount,
    ExpectBulkMarker,
    ExpectBulkLength,
    ExpectBulkBody(usize),
    Inline,
}

/// Resumable decoder for client requests.
///
/// # Example
///
/// ```
/// use flashproxy::protocol::RequestDecoder;
///
/// let mut decoder = RequestDecoder::new();
/// let buf = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
///
/// assert!(decoder.decode(&buf[..10]).unwrap().is_none());
/// let (frame, consumed) = decoder.decode(buf).unwrap().unwrap();
/// assert_eq!(frame.len(), 2);
/// assert_eq!(consumed, buf.len());
/// ```
#[derive(Debug)]
pub struct RequestDecoder {
    state: State,
    /// Offset into the caller's buffer of the next byte to examine
    cursor: usize,
    /// Bulk arguments still expected for the current multibulk frame
    remaining: usize,
    args: Vec<Bytes>,
    /// Where the CRLF search of an inline line resumes
    inline_scan: usize,
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self {
            state: State::ExpectMarker,
            cursor: 0,
            remaining: 0,
            args: Vec::new(),
            inline_scan: 0,
        }
    }

    /// True while a multibulk frame has been started but not finished.
    ///
    /// An error in this state means the stream cannot be resynchronized.
    pub fn is_mid_frame(&self) -> bool {
        !matches!(self.state, State::ExpectMarker | State::Inline)
    }

    /// Drops any partial frame and starts over at the next byte 0.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Attempts to decode one command from the start of `buf`.
    pub fn decode(&mut self, buf: &[u8]) -> ParseResult<Option<(CommandFrame, usize)>> {
        loop {
            match self.state {
                State::ExpectMarker => {
                    let Some(&byte) = buf.get(self.cursor) else {
                        return Ok(None);
                    };
                    if byte == prefix::ARRAY {
                        self.cursor += 1;
                        self.state = State::ExpectCount;
                    } else {
                        self.inline_scan = self.cursor;
                        self.state = State::Inline;
                    }
                }
                State::ExpectCount => {
                    let Some((count, next)) = read_length_line(buf, self.cursor)? else {
                        return Ok(None);
                    };
                    if !(1..=MAX_MULTIBULK_LEN).contains(&count) {
                        return Err(ParseError::InvalidArrayLength(count));
                    }
                    self.cursor = next;
                    self.remaining = count as usize;
                    self.args = Vec::with_capacity(self.remaining);
                    self.state = State::ExpectBulkMarker;
                }
                State::ExpectBulkMarker => {
                    let Some(&byte) = buf.get(self.cursor) else {
                        return Ok(None);
                    };
                    if byte != prefix::BULK_STRING {
                        return Err(ParseError::UnexpectedByte {
                            expected: '$',
                            found: byte,
                        });
                    }
                    self.cursor += 1;
                    self.state = State::ExpectBulkLength;
                }
                State::ExpectBulkLength => {
                    let Some((len, next)) = read_length_line(buf, self.cursor)? else {
                        return Ok(None);
                    };
                    if !(0..=MAX_REQUEST_BULK_LEN).contains(&len) {
                        return Err(ParseError::InvalidBulkLength(len));
                    }
                    self.cursor = next;
                    self.state = State::ExpectBulkBody(len as usize);
                }
                State::ExpectBulkBody(len) => {
                    let end = self.cursor + len;
                    let Some(data) = read_bulk_body(buf, self.cursor, len)? else {
                        return Ok(None);
                    };
                    self.args.push(data);
                    self.cursor = end + 2;
                    self.remaining -= 1;
                    if self.remaining == 0 {
                        let args = std::mem::take(&mut self.args);
                        // At least one argument is guaranteed by the count check.
                        if let Some(frame) = CommandFrame::new(args) {
                            return Ok(Some(self.finish(frame)));
                        }
                    }
                    self.state = State::ExpectBulkMarker;
                }
                State::Inline => {
                    let line_start = self.cursor;
                    let Some(pos) = find_crlf(buf, self.inline_scan.max(line_start)) else {
                        let seen = buf.len().saturating_sub(line_start);
                        if seen > MAX_INLINE_LEN {
                            return Err(ParseError::LineTooLong(seen));
                        }
                        // A trailing '\r' may still be completed by the next read.
                        self.inline_scan = buf.len().saturating_sub(1).max(line_start);
                        return Ok(None);
                    };

                    let args: Vec<Bytes> = buf[line_start..pos]
                        .split(|&b| b == b' ' || b == b'\t')
                        .filter(|token| !token.is_empty())
                        .map(Bytes::copy_from_slice)
                        .collect();
                    self.cursor = pos + 2;
                    match CommandFrame::new(args) {
                        Some(frame) => return Ok(Some(self.finish(frame))),
                        None => self.state = State::ExpectMarker,
                    }
                }
            }
        }
    }

    /// Decodes one command from `buf` and removes its bytes on success.
    ///
    /// While a frame is incomplete, bytes the decoder is done with (finished
    /// arguments, skipped blank lines) are removed as well, so `buf` never
    /// holds more than the argument or line currently being read.
    pub fn decode_buf(&mut self, buf: &mut BytesMut) -> ParseResult<Option<CommandFrame>> {
        match self.decode(buf)? {
            Some((frame, consumed)) => {
                let _ = buf.split_to(consumed);
                Ok(Some(frame))
            }
            None => {
                let done = self.rebase();
                let _ = buf.split_to(done);
                Ok(None)
            }
        }
    }

    /// Forgets the bytes before the cursor and returns how many there were.
    /// Finished arguments are already copied out of the buffer.
    fn rebase(&mut self) -> usize {
        let done = self.cursor;
        self.cursor = 0;
        self.inline_scan = self.inline_scan.saturating_sub(done);
        done
    }

    fn finish(&mut self, frame: CommandFrame) -> (CommandFrame, usize) {
        let consumed = self.cursor;
        self.reset();
        (frame, consumed)
    }
}

/// Finds the position of the first CRLF at or after `from`.
///
/// Returns the position of `\r`.
#[inline]
pub(crate) fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| from + pos)
}

/// Reads a signed decimal line starting at `start`.
///
/// Returns the value and the offset just past its CRLF. Fails as soon as a
/// byte that cannot belong to the line shows up, so garbage is reported
/// without waiting for a terminator that may never come.
pub(crate) fn read_length_line(buf: &[u8], start: usize) -> ParseResult<Option<(i64, usize)>> {
    let avail = buf.get(start..).unwrap_or_default();
    for (i, &byte) in avail.iter().enumerate() {
        match byte {
            b'0'..=b'9' | b'-' => {}
            b'\r' => {
                return match avail.get(i + 1) {
                    None => Ok(None),
                    Some(b'\n') => {
                        let n = parse_integer(&avail[..i])?;
                        Ok(Some((n, start + i + 2)))
                    }
                    Some(_) => Err(ParseError::MissingCrlf),
                };
            }
            other => {
                return Err(ParseError::UnexpectedByte {
                    expected: '0',
                    found: other,
                })
            }
        }
        if i >= MAX_LENGTH_LINE {
            return Err(ParseError::LineTooLong(i + 1));
        }
    }
    Ok(None)
}

/// Reads `len` bytes at `start` followed by CRLF.
pub(crate) fn read_bulk_body(buf: &[u8], start: usize, len: usize) -> ParseResult<Option<Bytes>> {
    let end = start + len;
    match buf.get(end) {
        None => return Ok(None),
        Some(b'\r') => {}
        Some(_) => return Err(ParseError::MissingCrlf),
    }
    match buf.get(end + 1) {
        None => Ok(None),
        Some(b'\n') => Ok(Some(Bytes::copy_from_slice(&buf[start..end]))),
        Some(_) => Err(ParseError::MissingCrlf),
    }
}

pub(crate) fn parse_integer(digits: &[u8]) -> ParseResult<i64> {
    let s = std::str::from_utf8(digits).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    s.parse()
        .map_err(|_| ParseError::InvalidInteger(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> ParseResult<Option<(CommandFrame, usize)>> {
        RequestDecoder::new().decode(input)
    }

    fn args(frame: &CommandFrame) -> Vec<&[u8]> {
        frame.args().iter().map(|a| a.as_ref()).collect()
    }

    #[test]
    fn test_decode_multibulk() {
        let input = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
        let (frame, consumed) = decode_all(input).unwrap().unwrap();
        assert_eq!(args(&frame), vec![&b"GET"[..], b"name"]);
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_decode_empty_bulk_argument() {
        let input = b"*2\r\n$4\r\nECHO\r\n$0\r\n\r\n";
        let (frame, consumed) = decode_all(input).unwrap().unwrap();
        assert_eq!(args(&frame), vec![&b"ECHO"[..], b""]);
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_binary_safe_argument() {
        let input = b"*1\r\n$5\r\nhe\r\no\r\n";
        let (frame, _) = decode_all(input).unwrap().unwrap();
        assert_eq!(args(&frame), vec![&b"he\r\no"[..]]);
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let original = CommandFrame::from_parts(["SET", "user:101", "Ariz", ""]);
        let wire = original.encode();

        // Every split point, and one byte at a time.
        for split in 0..=wire.len() {
            let mut decoder = RequestDecoder::new();
            let first = decoder.decode(&wire[..split]).unwrap();
            let (frame, consumed) = match first {
                Some(done) => done,
                None => decoder.decode(&wire).unwrap().unwrap(),
            };
            assert_eq!(frame, original, "split at {split}");
            assert_eq!(consumed, wire.len());
        }

        let mut decoder = RequestDecoder::new();
        for end in 1..wire.len() {
            assert!(decoder.decode(&wire[..end]).unwrap().is_none());
        }
        let (frame, _) = decoder.decode(&wire).unwrap().unwrap();
        assert_eq!(frame, original);
    }

    #[test]
    fn test_pipelined_frames() {
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\nECHO hi\r\n*2\r\n$3\r\nGET\r\n$1\r\nk"[..]);
        let mut decoder = RequestDecoder::new();

        let first = decoder.decode_buf(&mut buf).unwrap().unwrap();
        assert_eq!(args(&first), vec![&b"PING"[..]]);
        let second = decoder.decode_buf(&mut buf).unwrap().unwrap();
        assert_eq!(args(&second), vec![&b"ECHO"[..], b"hi"]);
        assert!(decoder.decode_buf(&mut buf).unwrap().is_none());
        assert!(decoder.is_mid_frame());

        buf.extend_from_slice(b"\r\n");
        let third = decoder.decode_buf(&mut buf).unwrap().unwrap();
        assert_eq!(args(&third), vec![&b"GET"[..], b"k"]);
        assert!(buf.is_empty());
        assert!(!decoder.is_mid_frame());
    }

    #[test]
    fn test_inline_command() {
        let (frame, consumed) = decode_all(b"PING\r\n").unwrap().unwrap();
        assert_eq!(args(&frame), vec![&b"PING"[..]]);
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_inline_collapses_blank_runs() {
        let input = b"  PING   PARAM  \r\n";
        let (frame, consumed) = decode_all(input).unwrap().unwrap();
        assert_eq!(args(&frame), vec![&b"PING"[..], b"PARAM"]);
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_inline_waits_for_terminator() {
        let mut decoder = RequestDecoder::new();
        assert!(decoder.decode(b"GET fo").unwrap().is_none());
        assert!(decoder.decode(b"GET foo\r").unwrap().is_none());
        let (frame, consumed) = decoder.decode(b"GET foo\r\n").unwrap().unwrap();
        assert_eq!(args(&frame), vec![&b"GET"[..], b"foo"]);
        assert_eq!(consumed, 9);
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let input = b"\r\n   \r\nPING\r\n";
        let (frame, consumed) = decode_all(input).unwrap().unwrap();
        assert_eq!(args(&frame), vec![&b"PING"[..]]);
        assert_eq!(consumed, input.len());
        assert!(decode_all(b"\r\n").unwrap().is_none());
    }

    #[test]
    fn test_blank_lines_are_drained_from_buffer() {
        let mut decoder = RequestDecoder::new();
        let mut buf = BytesMut::new();
        for _ in 0..1000 {
            buf.extend_from_slice(b"\r\n  \r\n");
            assert!(decoder.decode_buf(&mut buf).unwrap().is_none());
            assert!(buf.is_empty());
        }
        assert!(!decoder.is_mid_frame());

        buf.extend_from_slice(b"PI");
        assert!(decoder.decode_buf(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"NG\r\n");
        let frame = decoder.decode_buf(&mut buf).unwrap().unwrap();
        assert_eq!(args(&frame), vec![&b"PING"[..]]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_large_frame_holds_one_argument_at_a_time() {
        let value = Bytes::from(vec![b'v'; 700 * 1024]);
        let original = CommandFrame::from_parts([
            Bytes::from_static(b"HSET"),
            Bytes::from_static(b"h"),
            Bytes::from_static(b"f1"),
            value.clone(),
            Bytes::from_static(b"f2"),
            value.clone(),
            Bytes::from_static(b"f3"),
            value.clone(),
        ]);
        let wire = original.encode();
        assert!(wire.len() > 2 * MAX_REQUEST_BULK_LEN as usize);

        let mut decoder = RequestDecoder::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in wire.chunks(64 * 1024) {
            assert!(decoded.is_none());
            buf.extend_from_slice(chunk);
            decoded = decoder.decode_buf(&mut buf).unwrap();
            assert!(buf.len() <= value.len() + 2, "buffer grew to {}", buf.len());
        }
        assert_eq!(decoded.unwrap(), original);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_inline_line_too_long() {
        let input = vec![b'a'; MAX_INLINE_LEN + 1];
        assert!(matches!(decode_all(&input), Err(ParseError::LineTooLong(_))));
    }

    #[test]
    fn test_array_count_bounds() {
        assert_eq!(
            decode_all(b"*1025\r\n").unwrap_err(),
            ParseError::InvalidArrayLength(1025)
        );
        assert_eq!(
            decode_all(b"*0\r\n").unwrap_err(),
            ParseError::InvalidArrayLength(0)
        );
        assert_eq!(
            decode_all(b"*-1\r\n").unwrap_err(),
            ParseError::InvalidArrayLength(-1)
        );
        // The largest legal count is waiting for its arguments, not failing.
        assert!(decode_all(b"*1024\r\n").unwrap().is_none());
    }

    #[test]
    fn test_bulk_length_bounds() {
        assert_eq!(
            decode_all(b"*1\r\n$1048577\r\n").unwrap_err(),
            ParseError::InvalidBulkLength(1_048_577)
        );
        assert_eq!(
            decode_all(b"*1\r\n$-1\r\n").unwrap_err(),
            ParseError::InvalidBulkLength(-1)
        );
        assert!(decode_all(b"*1\r\n$1048576\r\n").unwrap().is_none());
    }

    #[test]
    fn test_invalid_length_line() {
        assert!(matches!(
            decode_all(b"*x\r\n"),
            Err(ParseError::UnexpectedByte { .. })
        ));
        assert!(matches!(
            decode_all(b"*\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert_eq!(decode_all(b"*2\rX").unwrap_err(), ParseError::MissingCrlf);
        let long = [&b"*"[..], &[b'1'; 40][..]].concat();
        assert!(matches!(decode_all(&long), Err(ParseError::LineTooLong(_))));
    }

    #[test]
    fn test_missing_bulk_marker() {
        assert_eq!(
            decode_all(b"*1\r\n:3\r\n").unwrap_err(),
            ParseError::UnexpectedByte {
                expected: '$',
                found: b':'
            }
        );
    }

    #[test]
    fn test_missing_bulk_terminator() {
        assert_eq!(
            decode_all(b"*1\r\n$3\r\nGETX\r\n").unwrap_err(),
            ParseError::MissingCrlf
        );
        assert_eq!(
            decode_all(b"*1\r\n$3\r\nGET\rX").unwrap_err(),
            ParseError::MissingCrlf
        );
        // Not enough bytes yet to tell.
        assert!(decode_all(b"*1\r\n$3\r\nGE").unwrap().is_none());
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut decoder = RequestDecoder::new();
        assert!(decoder.decode(b"*2\r\n$3\r\nGET\r\n").unwrap().is_none());
        decoder.reset();
        assert!(!decoder.is_mid_frame());
        let (frame, _) = decoder.decode(b"PING\r\n").unwrap().unwrap();
        assert_eq!(args(&frame), vec![&b"PING"[..]]);
    }
}
