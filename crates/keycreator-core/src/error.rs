//! Error taxonomy for the provisioning engine.
//!
//! Three layers of failure exist:
//!
//! - [`LinkError`]: the byte stream itself failed (timeout, closed port,
//!   oversized reply).
//! - [`ProtocolError`]: the reader answered with a nonzero status byte or an
//!   unparseable reply.
//! - [`Error`]: everything above the wire, including the two layers above.
//!
//! The session loop treats link and protocol failures as recoverable (it
//! returns to searching); see [`Error::is_recoverable`].

use crate::types::TechnologySet;

/// Result type alias for keycreator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the byte-stream channel to the reader.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// No complete reply arrived in time.
    #[error("Read timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The port is closed or was never opened.
    #[error("Link closed: {port}")]
    Closed { port: String },

    /// The reader returned nothing for a request.
    #[error("No response to request {request}")]
    NoResponse { request: String },

    /// The read timed out after part of a reply, before its delimiter.
    #[error("Reply {partial:?} missing delimiter")]
    Unterminated { partial: String },

    /// A reply grew beyond the configured maximum.
    #[error("Reply exceeds maximum length of {max_len} bytes")]
    FrameTooLong { max_len: usize },

    /// Underlying I/O failure.
    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Create a new timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a new closed link error.
    pub fn closed(port: impl Into<String>) -> Self {
        Self::Closed { port: port.into() }
    }

    /// Create a new no response error.
    pub fn no_response(request: impl Into<String>) -> Self {
        Self::NoResponse {
            request: request.into(),
        }
    }
}

/// Nonzero status codes of the Simple Protocol, plus malformed replies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Reader reported unknown function")]
    UnknownFunction,

    #[error("Reader reported missing parameter")]
    MissingParameter,

    #[error("Reader reported unused parameters")]
    UnusedParameters,

    #[error("Reader reported invalid function")]
    InvalidFunction,

    #[error("Reader reported parser error")]
    ParserError,

    #[error("Reader reported unknown status 0x{code:02X}")]
    Unknown { code: u8 },

    #[error("Malformed reply: {reply:?}")]
    MalformedReply { reply: String },

    #[error("Parameter of {len} bytes does not fit a one byte length prefix")]
    ParameterTooLong { len: usize },
}

impl ProtocolError {
    /// Map a status byte to its error. `0x00` is success and yields `None`.
    ///
    /// # Examples
    ///
    /// ```
    /// use keycreator_core::ProtocolError;
    ///
    /// assert_eq!(ProtocolError::from_status(0x00), None);
    /// assert_eq!(ProtocolError::from_status(0x02), Some(ProtocolError::MissingParameter));
    /// assert_eq!(ProtocolError::from_status(0x42), Some(ProtocolError::Unknown { code: 0x42 }));
    /// ```
    pub fn from_status(code: u8) -> Option<Self> {
        match code {
            0x00 => None,
            0x01 => Some(Self::UnknownFunction),
            0x02 => Some(Self::MissingParameter),
            0x03 => Some(Self::UnusedParameters),
            0x04 => Some(Self::InvalidFunction),
            0x05 => Some(Self::ParserError),
            code => Some(Self::Unknown { code }),
        }
    }

    /// Create a new malformed reply error.
    pub fn malformed(reply: impl Into<String>) -> Self {
        Self::MalformedReply {
            reply: reply.into(),
        }
    }
}

/// Errors raised above the wire.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The reader executed the command but its result flag was false.
    #[error("Command rejected by tag: {operation}")]
    CommandRejected { operation: String },

    /// No candidate key authenticated.
    #[error("Authentication failed: {target}")]
    Authentication { target: String },

    /// HITAG block checksum did not match.
    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    /// Technologies on the reader differ from the required set.
    #[error("Configuration mismatch: detected {detected}, required {required}")]
    ConfigurationMismatch {
        detected: TechnologySet,
        required: TechnologySet,
    },

    /// A DESFire format succeeded but the key reset did not.
    #[error("Tag formatted but key reset failed: {message}")]
    PartialFormat { message: String },

    /// Data written to a tag did not read back identically.
    #[error("Verification failed: wrote {expected}, read {actual}")]
    VerificationFailed { expected: String, actual: String },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid number {input:?}: must be exactly 6 digits")]
    InvalidNumber { input: String },

    /// Number is valid but outside the window of the required technologies.
    #[error("Number {number:06} outside window {min:06}..={max:06}")]
    NumberOutOfRange { number: u32, min: u32, max: u32 },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A newer session generation replaced the one running this loop.
    #[error("Stale session: generation {captured} replaced by {current}")]
    StaleSession { captured: u64, current: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    /// Failure reported by the ERP backend.
    #[error("ERP error: {0}")]
    Erp(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new rejected command error.
    pub fn rejected(operation: impl Into<String>) -> Self {
        Self::CommandRejected {
            operation: operation.into(),
        }
    }

    /// Create a new authentication error.
    pub fn authentication(target: impl Into<String>) -> Self {
        Self::Authentication {
            target: target.into(),
        }
    }

    /// Create a new partial format error.
    pub fn partial_format(message: impl Into<String>) -> Self {
        Self::PartialFormat {
            message: message.into(),
        }
    }

    /// Create a new verification error.
    pub fn verification(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::VerificationFailed {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether the provisioning loop may silently return to searching.
    ///
    /// Link and protocol failures, as well as commands the tag refused, are
    /// typical of a token lifted mid-operation. Everything else is reported.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Link(_) | Self::Protocol(_) | Self::CommandRejected { .. }
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
