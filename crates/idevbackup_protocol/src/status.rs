//! Backup status model.
//!
//! The device writes `Status.plist` into the backup several times during a
//! session. Each write is parsed into a [`BackupStatus`]; only the most
//! recent one matters to the host.

use crate::error::{ProtocolError, ProtocolResult};
use idevbackup_plist::Value;
use std::time::SystemTime;

/// Phase of a single backup pass.
///
/// `Waiting` and `Uninitialized` are synthesized by the host. The rest are
/// reported by the device. The device can report `Uploading` again after a
/// timeout recovery, so states are not assumed to only increase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SnapshotState {
    /// Host is waiting for the device (receive timed out).
    Waiting,
    /// No status has been seen yet.
    Uninitialized,
    /// Device is uploading files.
    Uploading,
    /// Device is moving files into place.
    Moving,
    /// Device is removing stale files.
    Removing,
    /// Snapshot is complete. Terminal.
    Finished,
    /// State name the host does not know.
    Unknown(String),
}

impl SnapshotState {
    /// Parses the state name used in `Status.plist`. Case-insensitive.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "waiting" => SnapshotState::Waiting,
            "uninitialized" => SnapshotState::Uninitialized,
            "uploading" => SnapshotState::Uploading,
            "moving" => SnapshotState::Moving,
            "removing" => SnapshotState::Removing,
            "finished" => SnapshotState::Finished,
            _ => SnapshotState::Unknown(name.to_string()),
        }
    }

    /// Returns the numeric ordinal, if the state is known.
    pub fn to_code(&self) -> Option<i8> {
        match self {
            SnapshotState::Waiting => Some(-2),
            SnapshotState::Uninitialized => Some(-1),
            SnapshotState::Uploading => Some(0),
            SnapshotState::Moving => Some(1),
            SnapshotState::Removing => Some(2),
            SnapshotState::Finished => Some(3),
            SnapshotState::Unknown(_) => None,
        }
    }

    /// Converts from the numeric ordinal.
    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            -2 => Some(SnapshotState::Waiting),
            -1 => Some(SnapshotState::Uninitialized),
            0 => Some(SnapshotState::Uploading),
            1 => Some(SnapshotState::Moving),
            2 => Some(SnapshotState::Removing),
            3 => Some(SnapshotState::Finished),
            _ => None,
        }
    }

    /// Returns the state name as written in `Status.plist`.
    pub fn as_str(&self) -> &str {
        match self {
            SnapshotState::Waiting => "waiting",
            SnapshotState::Uninitialized => "uninitialized",
            SnapshotState::Uploading => "uploading",
            SnapshotState::Moving => "moving",
            SnapshotState::Removing => "removing",
            SnapshotState::Finished => "finished",
            SnapshotState::Unknown(name) => name,
        }
    }

    /// Returns true for states only the host produces.
    pub fn is_host_synthetic(&self) -> bool {
        matches!(self, SnapshotState::Waiting | SnapshotState::Uninitialized)
    }

    /// Returns true if the snapshot is complete.
    pub fn is_finished(&self) -> bool {
        matches!(self, SnapshotState::Finished)
    }
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form backup state reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackupState {
    /// A new backup.
    New,
    /// An empty backup.
    Empty,
    /// State name the host does not know.
    Unknown(String),
}

impl BackupState {
    /// Parses the state name. Case-insensitive.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "new" => BackupState::New,
            "empty" => BackupState::Empty,
            _ => BackupState::Unknown(name.to_string()),
        }
    }

    /// Returns the state name.
    pub fn as_str(&self) -> &str {
        match self {
            BackupState::New => "new",
            BackupState::Empty => "empty",
            BackupState::Unknown(name) => name,
        }
    }

    /// Returns true for names outside the known vocabulary.
    pub fn is_unknown(&self) -> bool {
        matches!(self, BackupState::Unknown(_))
    }
}

/// Parsed contents of a `Status.plist`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupStatus {
    /// Backup UUID.
    pub uuid: String,
    /// Time the status was written.
    pub date: Option<SystemTime>,
    /// Whether this pass is a full backup.
    pub is_full_backup: bool,
    /// Backup format version, e.g. "3.3".
    pub protocol_version: String,
    /// Backup state.
    pub backup_state: BackupState,
    /// Snapshot state.
    pub snapshot_state: SnapshotState,
}

impl BackupStatus {
    /// Builds a status from a decoded `Status.plist` dictionary.
    ///
    /// Missing fields take neutral defaults; a missing snapshot state is
    /// `Uninitialized`. Only a non-dictionary root is an error.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        if value.as_dictionary().is_none() {
            return Err(ProtocolError::invalid_message(format!(
                "status must be a dictionary, got {}",
                value.type_name()
            )));
        }

        let text = |key: &str| value.get(key).and_then(Value::as_string);

        Ok(Self {
            uuid: text("UUID").unwrap_or_default().to_string(),
            date: value.get("Date").and_then(Value::as_date),
            is_full_backup: value
                .get("IsFullBackup")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            protocol_version: text("Version").unwrap_or_default().to_string(),
            backup_state: BackupState::parse(text("BackupState").unwrap_or("new")),
            snapshot_state: text("SnapshotState")
                .map(SnapshotState::parse)
                .unwrap_or(SnapshotState::Uninitialized),
        })
    }

    /// Decodes a status from raw `Status.plist` bytes.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = idevbackup_plist::decode(bytes)?;
        Self::from_value(&value)
    }

    /// Converts back to the `Status.plist` dictionary.
    pub fn to_value(&self) -> Value {
        let mut dict = Value::dict([
            ("UUID", Value::from(self.uuid.as_str())),
            ("IsFullBackup", Value::Boolean(self.is_full_backup)),
            ("Version", Value::from(self.protocol_version.as_str())),
            ("BackupState", Value::from(self.backup_state.as_str())),
            ("SnapshotState", Value::from(self.snapshot_state.as_str())),
        ]);
        if let Some(date) = self.date {
            dict.insert("Date", Value::Date(date));
        }
        dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_state_names() {
        assert_eq!(SnapshotState::parse("uploading"), SnapshotState::Uploading);
        assert_eq!(SnapshotState::parse("Moving"), SnapshotState::Moving);
        assert_eq!(SnapshotState::parse("FINISHED"), SnapshotState::Finished);
        assert_eq!(
            SnapshotState::parse("rebooting"),
            SnapshotState::Unknown("rebooting".into())
        );
    }

    #[test]
    fn snapshot_state_codes() {
        for code in -2..=3 {
            let state = SnapshotState::from_code(code).unwrap();
            assert_eq!(state.to_code(), Some(code));
        }
        assert!(SnapshotState::from_code(4).is_none());
        assert!(SnapshotState::Unknown("x".into()).to_code().is_none());
        assert!(SnapshotState::Waiting.is_host_synthetic());
        assert!(!SnapshotState::Uploading.is_host_synthetic());
    }

    #[test]
    fn parse_status_dictionary() {
        let value = Value::dict([
            ("UUID", Value::from("4C2F7F4E-1D2B-4B7A-9C3B-52B6C3A5F0AA")),
            ("IsFullBackup", Value::Boolean(true)),
            ("Version", Value::from("3.3")),
            ("BackupState", Value::from("new")),
            ("SnapshotState", Value::from("moving")),
        ]);

        let status = BackupStatus::from_value(&value).unwrap();
        assert_eq!(status.uuid, "4C2F7F4E-1D2B-4B7A-9C3B-52B6C3A5F0AA");
        assert!(status.is_full_backup);
        assert_eq!(status.protocol_version, "3.3");
        assert_eq!(status.backup_state, BackupState::New);
        assert_eq!(status.snapshot_state, SnapshotState::Moving);
        assert!(status.date.is_none());
    }

    #[test]
    fn unknown_backup_state_is_kept() {
        let value = Value::dict([("BackupState", Value::from("migrating"))]);
        let status = BackupStatus::from_value(&value).unwrap();
        assert!(status.backup_state.is_unknown());
        assert_eq!(status.backup_state.as_str(), "migrating");
        assert_eq!(status.snapshot_state, SnapshotState::Uninitialized);
    }

    #[test]
    fn non_dictionary_is_rejected() {
        let result = BackupStatus::from_value(&Value::from("finished"));
        assert!(matches!(result, Err(ProtocolError::InvalidMessage { .. })));
    }

    #[test]
    fn status_survives_xml_file() {
        let status = BackupStatus {
            uuid: "abc".into(),
            date: None,
            is_full_backup: false,
            protocol_version: "3.3".into(),
            backup_state: BackupState::New,
            snapshot_state: SnapshotState::Removing,
        };
        let bytes = idevbackup_plist::to_xml(&status.to_value()).unwrap();
        assert_eq!(BackupStatus::from_bytes(&bytes).unwrap(), status);
    }
}
