//! Incremental Reply Decoder
//!
//! Turns the byte stream of one backend connection into [`ReplyFrame`]s.
//!
//! Nested arrays are decoded with an explicit stack of partially filled
//! arrays rather than recursion, which keeps the decoder resumable at any
//! byte: a reply split across reads continues where it stopped instead of
//! being re-parsed from its first byte.

use crate::protocol::parser::{
    find_crlf, read_bulk_body, read_length_line, ParseError, ParseResult, MAX_INLINE_LEN,
};
use crate::protocol::types::{prefix, ReplyFrame};
use bytes::BytesMut;

/// Largest bulk string accepted from a backend (512 MB, same as Redis)
pub const MAX_REPLY_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest array accepted from a backend
pub const MAX_REPLY_ARRAY_LEN: i64 = 1024 * 1024;

/// Maximum array nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

#[derive(Debug)]
struct PartialArray {
    expected: usize,
    items: Vec<ReplyFrame>,
}

/// Resumable decoder for backend replies.
///
/// Same contract as [`RequestDecoder`](crate::protocol::RequestDecoder):
/// present the unconsumed buffer, get `Ok(None)` until a whole reply is
/// there, then drop `consumed` bytes.
#[derive(Debug, Default)]
pub struct ReplyDecoder {
    cursor: usize,
    /// Arrays opened but not yet filled, innermost last
    stack: Vec<PartialArray>,
    /// Length of a bulk string whose header has been read
    pending_bulk: Option<usize>,
}

impl ReplyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops any partial reply.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.stack.clear();
        self.pending_bulk = None;
    }

    /// Attempts to decode one reply from the start of `buf`.
    pub fn decode(&mut self, buf: &[u8]) -> ParseResult<Option<(ReplyFrame, usize)>> {
        loop {
            let leaf = if let Some(len) = self.pending_bulk {
                let Some(data) = read_bulk_body(buf, self.cursor, len)? else {
                    return Ok(None);
                };
                self.cursor += len + 2;
                self.pending_bulk = None;
                ReplyFrame::Bulk(Some(data))
            } else {
                let Some(&marker) = buf.get(self.cursor) else {
                    return Ok(None);
                };
                match marker {
                    prefix::SIMPLE_STRING | prefix::ERROR => {
                        let Some(text) = self.read_text_line(buf)? else {
                            return Ok(None);
                        };
                        if marker == prefix::ERROR {
                            ReplyFrame::Error(text)
                        } else {
                            ReplyFrame::Simple(text)
                        }
                    }
                    prefix::INTEGER => {
                        let Some((n, next)) = read_length_line(buf, self.cursor + 1)? else {
                            return Ok(None);
                        };
                        self.cursor = next;
                        ReplyFrame::Integer(n)
                    }
                    prefix::BULK_STRING => {
                        let Some((len, next)) = read_length_line(buf, self.cursor + 1)? else {
                            return Ok(None);
                        };
                        self.cursor = next;
                        match len {
                            -1 => ReplyFrame::Bulk(None),
                            0..=MAX_REPLY_BULK_LEN => {
                                self.pending_bulk = Some(len as usize);
                                continue;
                            }
                            _ => return Err(ParseError::InvalidBulkLength(len)),
                        }
                    }
                    prefix::ARRAY => {
                        let Some((count, next)) = read_length_line(buf, self.cursor + 1)? else {
                            return Ok(None);
                        };
                        match count {
                            -1 => {
                                self.cursor = next;
                                ReplyFrame::NullArray
                            }
                            0 => {
                                self.cursor = next;
                                ReplyFrame::Array(Vec::new())
                            }
                            1..=MAX_REPLY_ARRAY_LEN => {
                                if self.stack.len() >= MAX_NESTING_DEPTH {
                                    return Err(ParseError::TooDeep(MAX_NESTING_DEPTH));
                                }
                                self.cursor = next;
                                let expected = count as usize;
                                self.stack.push(PartialArray {
                                    expected,
                                    items: Vec::with_capacity(expected.min(1024)),
                                });
                                continue;
                            }
                            _ => return Err(ParseError::InvalidArrayLength(count)),
                        }
                    }
                    other => return Err(ParseError::UnknownPrefix(other)),
                }
            };

            // Attach the finished value to its enclosing arrays, closing any
            // that are now full.
            let mut value = leaf;
            loop {
                let Some(mut top) = self.stack.pop() else {
                    let consumed = self.cursor;
                    self.reset();
                    return Ok(Some((value, consumed)));
                };
                top.items.push(value);
                if top.items.len() < top.expected {
                    self.stack.push(top);
                    break;
                }
                value = ReplyFrame::Array(top.items);
            }
        }
    }

    /// Decodes one reply from `buf` and removes its bytes on success.
    pub fn decode_buf(&mut self, buf: &mut BytesMut) -> ParseResult<Option<ReplyFrame>> {
        match self.decode(buf)? {
            Some((frame, consumed)) => {
                let _ = buf.split_to(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Reads the text of a `+` or `-` line at the cursor.
    fn read_text_line(&mut self, buf: &[u8]) -> ParseResult<Option<String>> {
        let start = self.cursor + 1;
        let Some(pos) = find_crlf(buf, start) else {
            let seen = buf.len().saturating_sub(start);
            if seen > MAX_INLINE_LEN {
                return Err(ParseError::LineTooLong(seen));
            }
            return Ok(None);
        };
        let text = std::str::from_utf8(&buf[start..pos])
            .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?
            .to_string();
        self.cursor = pos + 2;
        Ok(Some(text))
    }
}
