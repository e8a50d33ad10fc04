//! Request encoding and reply parsing.

use crate::{hex, opcode::Opcode};
use keycreator_core::ProtocolError;
use std::fmt;

/// One command for the reader: an opcode plus its hex parameters.
///
/// # Examples
///
/// ```
/// use keycreator_protocol::{Opcode, Request};
///
/// let request = Request::new(Opcode::SearchTag).param_u8(0x10);
/// assert_eq!(request.to_wire(), "050010\r");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub params: String,
}

impl Request {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            params: String::new(),
        }
    }

    pub fn param_u8(mut self, value: u8) -> Self {
        self.params.push_str(&hex::u8_hex(value));
        self
    }

    pub fn param_u16_le(mut self, value: u16) -> Self {
        self.params.push_str(&hex::u16_le_hex(value));
        self
    }

    pub fn param_u32_le(mut self, value: u32) -> Self {
        self.params.push_str(&hex::u32_le_hex(value));
        self
    }

    pub fn param_bytes(mut self, bytes: &[u8]) -> Self {
        self.params.push_str(&hex::bytes_hex(bytes));
        self
    }

    /// Length-prefixed byte string (one length byte, then the bytes).
    ///
    /// # Errors
    ///
    /// `ProtocolError::ParameterTooLong` for more than 255 bytes.
    pub fn param_prefixed(self, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let len = u8::try_from(bytes.len())
            .map_err(|_| ProtocolError::ParameterTooLong { len: bytes.len() })?;
        Ok(self.param_u8(len).param_bytes(bytes))
    }

    /// Line without the terminating carriage return.
    pub fn encode(&self) -> String {
        format!("{}{}", self.opcode, self.params)
    }

    /// Complete wire line including the carriage return.
    pub fn to_wire(&self) -> String {
        format!("{}\r", self.encode())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Successful reply of the reader. Nonzero statuses never become a `Reply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    payload: String,
}

impl Reply {
    /// Parse one reply line.
    ///
    /// Trailing CR/LF is stripped. The first two hex digits are the status;
    /// `00` yields the remaining payload, any other value its
    /// [`ProtocolError`].
    ///
    /// # Errors
    ///
    /// Returns the mapped `ProtocolError` for a nonzero status and
    /// `ProtocolError::MalformedReply` when the status is missing or not hex.
    ///
    /// # Examples
    ///
    /// ```
    /// use keycreator_core::ProtocolError;
    /// use keycreator_protocol::Reply;
    ///
    /// let reply = Reply::parse("0001\r").unwrap();
    /// assert_eq!(reply.payload(), "01");
    ///
    /// assert_eq!(Reply::parse("02\r"), Err(ProtocolError::MissingParameter));
    /// ```
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 2 {
            return Err(ProtocolError::malformed(line));
        }
        let status = hex::parse_u8(line, 0)?;
        if let Some(error) = ProtocolError::from_status(status) {
            return Err(error);
        }
        Ok(Self {
            payload: line[2..].to_string(),
        })
    }

    /// Payload hex after the status byte.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Boolean result byte that leads most payloads (`01` true, `00` false).
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedReply` when the payload does not start
    /// with `00` or `01`.
    pub fn result(&self) -> Result<bool, ProtocolError> {
        match self.payload.get(..2) {
            Some("01") => Ok(true),
            Some("00") => Ok(false),
            _ => Err(ProtocolError::malformed(&self.payload)),
        }
    }

    /// Payload hex following the result byte.
    pub fn data(&self) -> &str {
        self.payload.get(2..).unwrap_or("")
    }

    /// Payload bytes, result byte included.
    pub fn bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        hex::parse_bytes(&self.payload)
    }

    /// Byte at `index` in the payload, result byte is index 0.
    pub fn byte(&self, index: usize) -> Result<u8, ProtocolError> {
        hex::parse_u8(&self.payload, index * 2)
    }
}
