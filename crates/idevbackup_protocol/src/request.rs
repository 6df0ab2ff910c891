//! Session-start requests and the mobilebackup2 `Hello` negotiation.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::parse_process_message;
use idevbackup_plist::Value;

/// Protocol versions offered in `Hello`.
pub const SUPPORTED_PROTOCOL_VERSIONS: [f64; 2] = [2.0, 2.1];

/// Operation named in a session-start request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Start a backup.
    Backup,
    /// Restore a backup to the device.
    Restore,
    /// Ask the device for backup info.
    Info,
    /// List backup contents.
    List,
    /// Decrypt an encrypted backup.
    Unback,
    /// Toggle cloud backup.
    EnableCloudBackup,
    /// Set, change or remove the backup password.
    ChangePassword,
}

impl Operation {
    /// Returns the `MessageName` value for this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Backup => "Backup",
            Operation::Restore => "Restore",
            Operation::Info => "Info",
            Operation::List => "List",
            Operation::Unback => "Unback",
            Operation::EnableCloudBackup => "EnableCloudBackup",
            Operation::ChangePassword => "ChangePassword",
        }
    }

    /// Option key lifted to the top level of the request, if any.
    pub fn lifted_option(&self) -> Option<&'static str> {
        match self {
            Operation::Unback => Some("Password"),
            Operation::EnableCloudBackup => Some("CloudBackupState"),
            _ => None,
        }
    }
}

/// A session-start request sent inside a process message.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    /// Requested operation.
    pub operation: Operation,
    /// Identifier of the device being backed up.
    pub target_identifier: String,
    /// Identifier of the backup source, when different from the target.
    pub source_identifier: Option<String>,
    /// Operation options dictionary.
    pub options: Option<Value>,
}

impl SessionRequest {
    /// Create a request for `operation` on `target_identifier`.
    pub fn new(operation: Operation, target_identifier: impl Into<String>) -> Self {
        Self {
            operation,
            target_identifier: target_identifier.into(),
            source_identifier: None,
            options: None,
        }
    }

    /// Set the source identifier.
    pub fn with_source(mut self, source_identifier: impl Into<String>) -> Self {
        self.source_identifier = Some(source_identifier.into());
        self
    }

    /// Set the options dictionary.
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Builds the request dictionary.
    ///
    /// For operations with a lifted option the value is copied out of
    /// `Options` to the top level; `Options` itself is sent unchanged.
    pub fn to_value(&self) -> Value {
        let mut dict = Value::dict([
            ("MessageName", Value::from(self.operation.as_str())),
            ("TargetIdentifier", Value::from(self.target_identifier.as_str())),
        ]);
        if let Some(source) = &self.source_identifier {
            dict.insert("SourceIdentifier", Value::from(source.as_str()));
        }
        if let Some(options) = &self.options {
            dict.insert("Options", options.clone());
            if let Some(key) = self.operation.lifted_option() {
                if let Some(lifted) = options.get(key) {
                    dict.insert(key, lifted.clone());
                }
            }
        }
        dict
    }
}

/// Builds the `Hello` dictionary offering `versions`.
pub fn hello_request(versions: &[f64]) -> Value {
    Value::dict([
        ("MessageName", Value::from("Hello")),
        (
            "SupportedProtocolVersions",
            Value::Array(versions.iter().copied().map(Value::Real).collect()),
        ),
    ])
}

/// Device reply to `Hello`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HelloResponse {
    /// Device error code; 0 on success.
    pub error_code: i64,
    /// Protocol version the device selected.
    pub protocol_version: Option<f64>,
}

impl HelloResponse {
    /// Parses the reply from its process-message envelope.
    pub fn from_message(message: &Value) -> ProtocolResult<Self> {
        let payload = parse_process_message(message)?;
        match payload.get("MessageName").and_then(Value::as_string) {
            Some("Response") => {}
            Some(other) => return Err(ProtocolError::unexpected("Response", other)),
            None => return Err(ProtocolError::missing_field("MessageName")),
        }
        Ok(Self {
            error_code: payload
                .get("ErrorCode")
                .and_then(Value::as_integer)
                .unwrap_or(0),
            protocol_version: payload.get("ProtocolVersion").and_then(Value::as_real),
        })
    }
}

/// Builds the options for a `ChangePassword` request.
///
/// Setting a first password omits `OldPassword`; removing one omits
/// `NewPassword`.
pub fn change_password_options(old: Option<&str>, new: Option<&str>) -> Value {
    let mut options = Value::empty_dict();
    if let Some(old) = old {
        options.insert("OldPassword", Value::from(old));
    }
    if let Some(new) = new {
        options.insert("NewPassword", Value::from(new));
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::process_message;

    #[test]
    fn backup_request_shape() {
        let request = SessionRequest::new(Operation::Backup, "00008030-001A")
            .with_options(Value::dict([("ForceFullBackup", Value::Boolean(true))]));
        let value = request.to_value();

        assert_eq!(value.get("MessageName"), Some(&Value::from("Backup")));
        assert_eq!(value.get("TargetIdentifier"), Some(&Value::from("00008030-001A")));
        assert!(value.get("SourceIdentifier").is_none());
        assert_eq!(
            value.get("Options").and_then(|o| o.get("ForceFullBackup")),
            Some(&Value::Boolean(true))
        );
        assert!(value.get("Password").is_none());
    }

    #[test]
    fn unback_lifts_password() {
        let value = SessionRequest::new(Operation::Unback, "dev")
            .with_source("other")
            .with_options(Value::dict([("Password", Value::from("hunter2"))]))
            .to_value();

        assert_eq!(value.get("Password"), Some(&Value::from("hunter2")));
        assert_eq!(value.get("SourceIdentifier"), Some(&Value::from("other")));
        assert!(value.get("Options").and_then(|o| o.get("Password")).is_some());
    }

    #[test]
    fn cloud_backup_lifts_state() {
        let value = SessionRequest::new(Operation::EnableCloudBackup, "dev")
            .with_options(Value::dict([("CloudBackupState", Value::Boolean(false))]))
            .to_value();
        assert_eq!(value.get("CloudBackupState"), Some(&Value::Boolean(false)));
    }

    #[test]
    fn other_operations_do_not_lift() {
        let value = SessionRequest::new(Operation::Backup, "dev")
            .with_options(Value::dict([("Password", Value::from("x"))]))
            .to_value();
        assert!(value.get("Password").is_none());
    }

    #[test]
    fn hello_round() {
        let hello = hello_request(&SUPPORTED_PROTOCOL_VERSIONS);
        assert_eq!(
            hello
                .get("SupportedProtocolVersions")
                .and_then(Value::as_array)
                .map(<[Value]>::len),
            Some(2)
        );

        let reply = process_message(Value::dict([
            ("MessageName", Value::from("Response")),
            ("ErrorCode", Value::Integer(0)),
            ("ProtocolVersion", Value::Real(2.1)),
        ]));
        let response = HelloResponse::from_message(&reply).unwrap();
        assert_eq!(response.error_code, 0);
        assert_eq!(response.protocol_version, Some(2.1));

        let wrong = process_message(Value::dict([("MessageName", Value::from("Backup"))]));
        assert!(HelloResponse::from_message(&wrong).is_err());
    }

    #[test]
    fn password_options() {
        let set = change_password_options(None, Some("new"));
        assert!(set.get("OldPassword").is_none());
        assert_eq!(set.get("NewPassword"), Some(&Value::from("new")));

        let remove = change_password_options(Some("old"), None);
        assert!(remove.get("NewPassword").is_none());
    }
}
