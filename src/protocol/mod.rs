//! RESP Protocol Implementation
//!
//! This module provides the wire side of the proxy: the frame types and the
//! two incremental decoders.
//!
//! ## Modules
//!
//! - `types`: `CommandFrame`, `ReplyFrame` and their serialization
//! - `parser`: client request decoder (multibulk plus inline fallback)
//! - `reply`: backend reply decoder
//!
//! ## Example
//!
//! ```
//! use flashproxy::protocol::{ReplyDecoder, ReplyFrame, RequestDecoder};
//!
//! // A client request
//! let mut requests = RequestDecoder::new();
//! let (command, _) = requests
//!     .decode(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(command.lowercase_name(), "get");
//!
//! // A backend reply
//! let mut replies = ReplyDecoder::new();
//! let (reply, _) = replies.decode(b"$4\r\nAriz\r\n").unwrap().unwrap();
//! assert_eq!(reply, ReplyFrame::bulk("Ariz"));
//! ```

pub mod parser;
pub mod reply;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{ParseError, ParseResult, RequestDecoder};
pub use reply::ReplyDecoder;
pub use types::{CommandFrame, ReplyFrame};
