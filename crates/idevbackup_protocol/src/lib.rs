//! # idevbackup protocol
//!
//! Message vocabulary of the DeviceLink and mobilebackup2 protocols.
//!
//! This crate provides:
//! - DeviceLink envelopes (version exchange, process message, status response)
//! - The device message names and their progress positions
//! - `ResultCode` tags of the file-transfer sub-protocol
//! - The `Status.plist` model (`BackupStatus`, `SnapshotState`, `BackupState`)
//! - Session-start requests and `Hello` negotiation
//! - Per-file error reports and directory-listing entries
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file_error;
mod listing;
mod messages;
mod request;
mod result_code;
mod status;

pub use error::{ProtocolError, ProtocolResult};
pub use file_error::{
    multi_status, DeviceErrorCode, FileErrorReport, MULTI_STATUS_CODE, MULTI_STATUS_MESSAGE,
    UNSUPPORTED_CODE, UNSUPPORTED_MESSAGE,
};
pub use listing::{DirectoryEntry, FileType};
pub use messages::{
    disconnect, is_device_ready, message_name, parse_process_message, process_message,
    status_response, versions_ok, DeviceMessage, ProcessResult, VersionExchange,
    DEVICE_LINK_VERSION_MAJOR, DEVICE_LINK_VERSION_MINOR, DL_MESSAGE_DEVICE_READY,
    DL_MESSAGE_DISCONNECT, DL_MESSAGE_PROCESS_MESSAGE, DL_MESSAGE_STATUS_RESPONSE,
    DL_MESSAGE_VERSION_EXCHANGE, DL_VERSIONS_OK, EMPTY_PARAMETER_STRING,
};
pub use request::{
    change_password_options, hello_request, HelloResponse, Operation, SessionRequest,
    SUPPORTED_PROTOCOL_VERSIONS,
};
pub use result_code::ResultCode;
pub use status::{BackupState, BackupStatus, SnapshotState};
