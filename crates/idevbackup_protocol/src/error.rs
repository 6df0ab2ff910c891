//! Error types for protocol parsing.

use idevbackup_plist::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised when a message does not have the expected shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Message envelope is malformed.
    #[error("invalid message: {message}")]
    InvalidMessage {
        /// Description of the problem.
        message: String,
    },

    /// A different message was received than the one expected.
    #[error("unexpected message: expected {expected}, found {found}")]
    UnexpectedMessage {
        /// Expected message name.
        expected: String,
        /// Received message name or shape.
        found: String,
    },

    /// A required field is missing or has the wrong type.
    #[error("missing or invalid field: {field}")]
    MissingField {
        /// Field name.
        field: String,
    },

    /// Plist codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ProtocolError {
    /// Create an invalid message error.
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }

    /// Create an unexpected message error.
    pub fn unexpected(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::UnexpectedMessage {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }
}
