//! Tokio codec for carriage-return delimited reader lines.
//!
//! ```text
//! serial bytes -> Decoder -> String (one reply line, CR stripped)
//! Request      -> Encoder -> serial bytes (opcode + params + CR)
//! ```
//!
//! Decoding never interprets the status byte; that is [`crate::Reply`]'s
//! job. The codec only guarantees that a line never grows beyond
//! `max_line_len` bytes, so a reader spewing garbage cannot make the host
//! buffer forever.
//!
//! # Usage with Tokio Framed
//!
//! ```rust,no_run
//! use futures::{SinkExt, StreamExt};
//! use keycreator_protocol::{Opcode, Reply, Request, Twn4Codec};
//! use tokio_util::codec::Framed;
//!
//! # async fn example(port: tokio::io::DuplexStream) -> Result<(), Box<dyn std::error::Error>> {
//! let mut framed = Framed::new(port, Twn4Codec::new());
//! framed.send(Request::new(Opcode::GetVersionString).param_u8(0xFF)).await?;
//! if let Some(line) = framed.next().await {
//!     let reply = Reply::parse(&line?)?;
//!     println!("{}", reply.payload());
//! }
//! # Ok(())
//! # }
//! ```

use crate::frame::Request;
use bytes::BytesMut;
use keycreator_core::{LinkError, constants::{DEFAULT_MAX_REPLY_LEN, FRAME_DELIMITER}};
use tokio_util::codec::{Decoder, Encoder};

/// Line codec for the reader's Simple Protocol.
#[derive(Debug, Clone)]
pub struct Twn4Codec {
    delimiter: u8,
    max_line_len: usize,
}

impl Twn4Codec {
    pub fn new() -> Self {
        Self {
            delimiter: FRAME_DELIMITER,
            max_line_len: DEFAULT_MAX_REPLY_LEN,
        }
    }

    /// Codec rejecting lines longer than `max_line_len` bytes (delimiter excluded).
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            max_line_len,
            ..Self::new()
        }
    }

    /// Use another line terminator.
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn max_line_len(&self) -> usize {
        self.max_line_len
    }
}

impl Default for Twn4Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for Twn4Codec {
    type Item = String;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, LinkError> {
        // Some firmware prefixes replies with LF left over from the previous line.
        while src.first() == Some(&b'\n') {
            let _ = src.split_to(1);
        }

        let Some(pos) = src.iter().position(|b| *b == self.delimiter) else {
            if src.len() > self.max_line_len {
                return Err(LinkError::FrameTooLong {
                    max_len: self.max_line_len,
                });
            }
            return Ok(None);
        };

        if pos > self.max_line_len {
            return Err(LinkError::FrameTooLong {
                max_len: self.max_line_len,
            });
        }

        let line = src.split_to(pos + 1);
        let text = std::str::from_utf8(&line[..pos]).map_err(|e| {
            LinkError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        Ok(Some(text.to_string()))
    }
}

impl Encoder<Request> for Twn4Codec {
    type Error = LinkError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), LinkError> {
        let line = item.encode();
        if line.len() > self.max_line_len {
            return Err(LinkError::FrameTooLong {
                max_len: self.max_line_len,
            });
        }
        dst.reserve(line.len() + 1);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(&[self.delimiter]);
        Ok(())
    }
}
