//! Error types for the backup engine.

use idevbackup_plist::CodecError;
use idevbackup_protocol::ProtocolError;
use std::io;
use thiserror::Error;

/// Result type for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;

/// Result type for collaborator services.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors that can end a backup session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    /// Read or write failure on the device stream.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the connection may still be usable.
        retryable: bool,
    },

    /// Malformed or unexpected message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Version handshake was rejected.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Plist codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Local filesystem error.
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        /// Error kind.
        kind: io::ErrorKind,
        /// Error message.
        message: String,
    },

    /// The sync lock could not be opened or locked.
    #[error("failed to acquire sync lock: {0}")]
    LockFailed(String),

    /// The sync lock stayed busy for the whole retry budget.
    #[error("sync lock still busy after {attempts} attempts")]
    LockTimeout {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Backup denied by device management policy.
    #[error("backup denied by device management policy")]
    DeniedByPolicy,

    /// Policy requires an encrypted backup but no password is set.
    #[error("an encryption password is required by policy")]
    PasswordRequiredByPolicy,

    /// Device is locked or the user declined the trust prompt.
    #[error("device is locked")]
    DeviceLocked,

    /// Device reported an unrecognized failure.
    #[error("device error {code}{}", suffix(.description))]
    DeviceError {
        /// Signed device error code.
        code: i64,
        /// Device-provided description.
        description: Option<String>,
    },

    /// Device went away during the session.
    #[error("device disconnected")]
    Disconnected,

    /// The session was cancelled.
    #[error("backup cancelled")]
    Cancelled,

    /// No message arrived within the receive timeout.
    #[error("operation timed out")]
    Timeout,

    /// A backup password is already set.
    #[error("a backup password is already set")]
    PasswordAlreadySet,

    /// Backup encryption is not enabled.
    #[error("backup encryption is disabled")]
    EncryptionDisabled,

    /// A collaborator service failed.
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

impl BackupError {
    /// Creates a transport error that may be retried.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a fatal transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an I/O error.
    pub fn io(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self::Io {
            kind,
            message: message.into(),
        }
    }

    /// Maps a device process-message result code. Returns `None` for 0.
    pub fn from_result_code(code: i64, description: Option<String>) -> Option<Self> {
        match code {
            0 => None,
            -38 => Some(Self::DeniedByPolicy),
            -207 => Some(Self::PasswordRequiredByPolicy),
            -208 => Some(Self::DeviceLocked),
            _ => Some(Self::DeviceError { code, description }),
        }
    }

    /// Returns true for named device policy rejections.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            BackupError::DeniedByPolicy
                | BackupError::PasswordRequiredByPolicy
                | BackupError::DeviceLocked
        )
    }

    /// Returns true if the error ends the session.
    pub fn is_fatal(&self) -> bool {
        match self {
            BackupError::Transport { retryable, .. } => !retryable,
            BackupError::Timeout | BackupError::Cancelled => false,
            _ => true,
        }
    }
}

impl From<io::Error> for BackupError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Self::transport_fatal(error.to_string()),
            kind => Self::io(kind, error.to_string()),
        }
    }
}

fn suffix(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

/// Errors reported by collaborator services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The requested path or key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A non-blocking lock is held elsewhere.
    #[error("operation would block")]
    WouldBlock,

    /// The handle or service was already closed.
    #[error("service already disposed")]
    Disposed,

    /// The request is not supported by this device.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The request is deprecated on this device.
    #[error("deprecated: {0}")]
    Deprecated(String),

    /// Communication with the service failed.
    #[error("service I/O error: {0}")]
    Io(String),

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

impl ServiceError {
    /// Returns true if the request is not available on this device.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ServiceError::Unsupported(_) | ServiceError::Deprecated(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes() {
        assert_eq!(BackupError::from_result_code(0, None), None);
        assert_eq!(
            BackupError::from_result_code(-38, None),
            Some(BackupError::DeniedByPolicy)
        );
        assert_eq!(
            BackupError::from_result_code(-207, None),
            Some(BackupError::PasswordRequiredByPolicy)
        );
        assert_eq!(
            BackupError::from_result_code(-208, Some("locked".into())),
            Some(BackupError::DeviceLocked)
        );
        assert_eq!(
            BackupError::from_result_code(-4, Some("boom".into())),
            Some(BackupError::DeviceError {
                code: -4,
                description: Some("boom".into())
            })
        );
    }

    #[test]
    fn classification() {
        assert!(BackupError::DeviceLocked.is_policy_rejection());
        assert!(!BackupError::Disconnected.is_policy_rejection());
        assert!(BackupError::transport_fatal("eof").is_fatal());
        assert!(!BackupError::transport_retryable("busy").is_fatal());
        assert!(!BackupError::Timeout.is_fatal());
        assert!(BackupError::LockTimeout { attempts: 50 }.is_fatal());
    }

    #[test]
    fn error_display() {
        let err = BackupError::DeviceError {
            code: -4,
            description: Some("Backup failed".into()),
        };
        assert_eq!(err.to_string(), "device error -4: Backup failed");

        let err = BackupError::DeviceError {
            code: -4,
            description: None,
        };
        assert_eq!(err.to_string(), "device error -4");

        let err = BackupError::LockTimeout { attempts: 50 };
        assert!(err.to_string().contains("50"));
    }

    #[test]
    fn io_conversion() {
        let err: BackupError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(err, BackupError::Transport { retryable: false, .. }));

        let err: BackupError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(
            err,
            BackupError::Io {
                kind: io::ErrorKind::PermissionDenied,
                ..
            }
        ));
    }

    #[test]
    fn service_availability() {
        assert!(ServiceError::Deprecated("diagnostics".into()).is_unavailable());
        assert!(!ServiceError::WouldBlock.is_unavailable());
    }
}
