//! DeviceLink envelopes and the device message vocabulary.
//!
//! Every DeviceLink message is a plist array whose first element names the
//! message. The host answers every device-initiated operation with a
//! status response.

use crate::error::{ProtocolError, ProtocolResult};
use idevbackup_plist::Value;

/// First message of the version handshake, and the reply's tag.
pub const DL_MESSAGE_VERSION_EXCHANGE: &str = "DLMessageVersionExchange";
/// Host acceptance marker inside the version exchange reply.
pub const DL_VERSIONS_OK: &str = "DLVersionsOk";
/// Device confirmation that ends the handshake.
pub const DL_MESSAGE_DEVICE_READY: &str = "DLMessageDeviceReady";
/// Generic request/command envelope.
pub const DL_MESSAGE_PROCESS_MESSAGE: &str = "DLMessageProcessMessage";
/// Host acknowledgement envelope.
pub const DL_MESSAGE_STATUS_RESPONSE: &str = "DLMessageStatusResponse";
/// Teardown envelope.
pub const DL_MESSAGE_DISCONNECT: &str = "DLMessageDisconnect";
/// Placeholder used wherever the protocol expects a string but none applies.
pub const EMPTY_PARAMETER_STRING: &str = "___EmptyParameterString___";

/// DeviceLink major version spoken by the backup service.
pub const DEVICE_LINK_VERSION_MAJOR: i64 = 300;
/// DeviceLink minor version spoken by the backup service.
pub const DEVICE_LINK_VERSION_MINOR: i64 = 0;

/// Operations the device asks the host to perform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceMessage {
    /// Device wants files sent from the host.
    DownloadFiles,
    /// Device pushes files to the host.
    UploadFiles,
    /// Device asks for free space in the backup location.
    GetFreeDiskSpace,
    /// Create a directory in the backup.
    CreateDirectory,
    /// List a backup directory.
    ContentsOfDirectory,
    /// Rename items in the backup.
    MoveItems,
    /// Delete items from the backup.
    RemoveItems,
    /// Copy a single file in the backup.
    CopyItem,
    /// Device asks the host to free disk space.
    PurgeDiskSpace,
    /// Generic message carrying a result code.
    ProcessMessage,
    /// Device is ending the session.
    Disconnect,
    /// Message name the host does not know.
    Unknown(String),
}

impl DeviceMessage {
    /// Maps a message name to the vocabulary. Legacy aliases are accepted.
    pub fn from_name(name: &str) -> Self {
        match name {
            "DLMessageDownloadFiles" => DeviceMessage::DownloadFiles,
            "DLMessageUploadFiles" => DeviceMessage::UploadFiles,
            "DLMessageGetFreeDiskSpace" => DeviceMessage::GetFreeDiskSpace,
            "DLMessageCreateDirectory" => DeviceMessage::CreateDirectory,
            "DLContentsOfDirectory" => DeviceMessage::ContentsOfDirectory,
            "DLMessageMoveItems" | "DLMessageMoveFiles" => DeviceMessage::MoveItems,
            "DLMessageRemoveItems" | "DLMessageRemoveFiles" => DeviceMessage::RemoveItems,
            "DLMessageCopyItem" => DeviceMessage::CopyItem,
            "DLMessagePurgeDiskSpace" => DeviceMessage::PurgeDiskSpace,
            DL_MESSAGE_PROCESS_MESSAGE => DeviceMessage::ProcessMessage,
            DL_MESSAGE_DISCONNECT => DeviceMessage::Disconnect,
            other => DeviceMessage::Unknown(other.to_string()),
        }
    }

    /// Returns the canonical message name.
    pub fn name(&self) -> &str {
        match self {
            DeviceMessage::DownloadFiles => "DLMessageDownloadFiles",
            DeviceMessage::UploadFiles => "DLMessageUploadFiles",
            DeviceMessage::GetFreeDiskSpace => "DLMessageGetFreeDiskSpace",
            DeviceMessage::CreateDirectory => "DLMessageCreateDirectory",
            DeviceMessage::ContentsOfDirectory => "DLContentsOfDirectory",
            DeviceMessage::MoveItems => "DLMessageMoveItems",
            DeviceMessage::RemoveItems => "DLMessageRemoveItems",
            DeviceMessage::CopyItem => "DLMessageCopyItem",
            DeviceMessage::PurgeDiskSpace => "DLMessagePurgeDiskSpace",
            DeviceMessage::ProcessMessage => DL_MESSAGE_PROCESS_MESSAGE,
            DeviceMessage::Disconnect => DL_MESSAGE_DISCONNECT,
            DeviceMessage::Unknown(name) => name,
        }
    }

    /// Position of the overall-progress real inside the message array.
    pub fn progress_index(&self) -> Option<usize> {
        match self {
            DeviceMessage::DownloadFiles
            | DeviceMessage::MoveItems
            | DeviceMessage::RemoveItems
            | DeviceMessage::CopyItem => Some(3),
            DeviceMessage::UploadFiles => Some(2),
            _ => None,
        }
    }

    /// Reads the overall progress carried by `message`, if any.
    ///
    /// Only a real value at the expected position counts.
    pub fn progress(&self, message: &Value) -> Option<f64> {
        let index = self.progress_index()?;
        match message.item(index)? {
            Value::Real(progress) => Some(*progress),
            _ => None,
        }
    }
}

/// Returns the name of a DeviceLink message (its first array element).
pub fn message_name(message: &Value) -> Option<&str> {
    message.item(0).and_then(Value::as_string)
}

/// Wraps a dictionary in a process-message envelope.
pub fn process_message(payload: Value) -> Value {
    Value::Array(vec![Value::from(DL_MESSAGE_PROCESS_MESSAGE), payload])
}

/// Extracts the dictionary from a process-message envelope.
pub fn parse_process_message(message: &Value) -> ProtocolResult<&Value> {
    let name = message_name(message)
        .ok_or_else(|| ProtocolError::invalid_message("expected a DeviceLink array"))?;
    if name != DL_MESSAGE_PROCESS_MESSAGE {
        return Err(ProtocolError::unexpected(DL_MESSAGE_PROCESS_MESSAGE, name));
    }
    match message.item(1) {
        Some(payload @ Value::Dictionary(_)) => Ok(payload),
        _ => Err(ProtocolError::missing_field("process message dictionary")),
    }
}

/// Builds `[DLMessageStatusResponse, code, message, extra]`.
///
/// A missing message becomes the empty-parameter placeholder and a missing
/// `extra` an empty dictionary.
pub fn status_response(code: i64, message: Option<&str>, extra: Option<Value>) -> Value {
    Value::Array(vec![
        Value::from(DL_MESSAGE_STATUS_RESPONSE),
        Value::Integer(code),
        Value::from(message.unwrap_or(EMPTY_PARAMETER_STRING)),
        extra.unwrap_or_else(Value::empty_dict),
    ])
}

/// Builds the teardown envelope.
pub fn disconnect(message: Option<&str>) -> Value {
    Value::Array(vec![
        Value::from(DL_MESSAGE_DISCONNECT),
        Value::from(message.unwrap_or(EMPTY_PARAMETER_STRING)),
    ])
}

/// Version offer sent by the device to open the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionExchange {
    /// Device major version.
    pub major: i64,
    /// Device minor version.
    pub minor: i64,
}

impl VersionExchange {
    /// Parses `[DLMessageVersionExchange, major, minor]`.
    pub fn parse(message: &Value) -> ProtocolResult<Self> {
        let name = message_name(message)
            .ok_or_else(|| ProtocolError::invalid_message("expected a DeviceLink array"))?;
        if name != DL_MESSAGE_VERSION_EXCHANGE {
            return Err(ProtocolError::unexpected(DL_MESSAGE_VERSION_EXCHANGE, name));
        }
        let major = message
            .item(1)
            .and_then(Value::as_integer)
            .ok_or_else(|| ProtocolError::missing_field("major version"))?;
        let minor = message
            .item(2)
            .and_then(Value::as_integer)
            .ok_or_else(|| ProtocolError::missing_field("minor version"))?;
        Ok(Self { major, minor })
    }

    /// Builds the offer, as a device would send it.
    pub fn to_value(self) -> Value {
        Value::Array(vec![
            Value::from(DL_MESSAGE_VERSION_EXCHANGE),
            Value::Integer(self.major),
            Value::Integer(self.minor),
        ])
    }
}

/// Builds the host's acceptance of the negotiated major version.
pub fn versions_ok(major: i64) -> Value {
    Value::Array(vec![
        Value::from(DL_MESSAGE_VERSION_EXCHANGE),
        Value::from(DL_VERSIONS_OK),
        Value::Integer(major),
    ])
}

/// Returns true if `message` is the device-ready confirmation.
pub fn is_device_ready(message: &Value) -> bool {
    message_name(message) == Some(DL_MESSAGE_DEVICE_READY)
}

/// Result carried by a device `DLMessageProcessMessage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// Signed result code; 0 means success.
    pub error_code: i64,
    /// Device-provided description.
    pub description: Option<String>,
}

impl ProcessResult {
    /// Reads the result from a process-message envelope.
    pub fn from_message(message: &Value) -> ProtocolResult<Self> {
        let payload = parse_process_message(message)?;
        Ok(Self {
            error_code: payload
                .get("ErrorCode")
                .and_then(Value::as_integer)
                .unwrap_or(0),
            description: payload
                .get("ErrorDescription")
                .and_then(Value::as_string)
                .map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_names_round_trip() {
        for message in [
            DeviceMessage::DownloadFiles,
            DeviceMessage::UploadFiles,
            DeviceMessage::GetFreeDiskSpace,
            DeviceMessage::CreateDirectory,
            DeviceMessage::ContentsOfDirectory,
            DeviceMessage::MoveItems,
            DeviceMessage::RemoveItems,
            DeviceMessage::CopyItem,
            DeviceMessage::PurgeDiskSpace,
            DeviceMessage::ProcessMessage,
            DeviceMessage::Disconnect,
        ] {
            assert_eq!(DeviceMessage::from_name(message.name()), message);
        }
    }

    #[test]
    fn legacy_aliases() {
        assert_eq!(
            DeviceMessage::from_name("DLMessageMoveFiles"),
            DeviceMessage::MoveItems
        );
        assert_eq!(
            DeviceMessage::from_name("DLMessageRemoveFiles"),
            DeviceMessage::RemoveItems
        );
        assert_eq!(
            DeviceMessage::from_name("DLMessageReboot"),
            DeviceMessage::Unknown("DLMessageReboot".into())
        );
    }

    #[test]
    fn progress_positions() {
        let upload = Value::Array(vec![
            Value::from("DLMessageUploadFiles"),
            Value::empty_dict(),
            Value::Real(37.5),
        ]);
        assert_eq!(DeviceMessage::UploadFiles.progress(&upload), Some(37.5));

        let remove = Value::Array(vec![
            Value::from("DLMessageRemoveItems"),
            Value::Array(vec![]),
            Value::empty_dict(),
            Value::Real(80.0),
        ]);
        assert_eq!(DeviceMessage::RemoveItems.progress(&remove), Some(80.0));

        // Integer at the progress position is not a progress report.
        let download = Value::Array(vec![
            Value::from("DLMessageDownloadFiles"),
            Value::Array(vec![]),
            Value::empty_dict(),
            Value::Integer(5),
        ]);
        assert_eq!(DeviceMessage::DownloadFiles.progress(&download), None);
        assert_eq!(DeviceMessage::CreateDirectory.progress(&download), None);
    }

    #[test]
    fn status_response_placeholders() {
        let response = status_response(0, None, None);
        assert_eq!(message_name(&response), Some(DL_MESSAGE_STATUS_RESPONSE));
        assert_eq!(response.item(1), Some(&Value::Integer(0)));
        assert_eq!(response.item(2), Some(&Value::from(EMPTY_PARAMETER_STRING)));
        assert_eq!(response.item(3), Some(&Value::empty_dict()));
    }

    #[test]
    fn process_message_shape() {
        let message = process_message(Value::dict([("ErrorCode", Value::Integer(-208))]));
        let result = ProcessResult::from_message(&message).unwrap();
        assert_eq!(result.error_code, -208);
        assert!(result.description.is_none());

        let wrong = status_response(0, None, None);
        assert!(matches!(
            parse_process_message(&wrong),
            Err(ProtocolError::UnexpectedMessage { .. })
        ));

        let missing = Value::Array(vec![Value::from(DL_MESSAGE_PROCESS_MESSAGE)]);
        assert!(matches!(
            parse_process_message(&missing),
            Err(ProtocolError::MissingField { .. })
        ));
    }

    #[test]
    fn version_exchange_parse() {
        let offer = VersionExchange {
            major: DEVICE_LINK_VERSION_MAJOR,
            minor: DEVICE_LINK_VERSION_MINOR,
        };
        assert_eq!(VersionExchange::parse(&offer.to_value()).unwrap(), offer);

        let reply = versions_ok(300);
        assert_eq!(reply.item(1), Some(&Value::from(DL_VERSIONS_OK)));
        assert!(VersionExchange::parse(&reply).is_err());
    }

    #[test]
    fn device_ready_detection() {
        let ready = Value::Array(vec![Value::from(DL_MESSAGE_DEVICE_READY)]);
        assert!(is_device_ready(&ready));
        assert!(!is_device_ready(&disconnect(None)));
        assert!(!is_device_ready(&Value::from(DL_MESSAGE_DEVICE_READY)));
    }
}
