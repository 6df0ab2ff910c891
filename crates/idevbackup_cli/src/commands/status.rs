//! Status command implementation.

use super::{format_date, read_plist};
use idevbackup_engine::STATUS_FILE_NAME;
use idevbackup_protocol::BackupStatus;
use serde::Serialize;
use std::path::Path;

/// Backup status as printed.
#[derive(Debug, Serialize)]
pub struct StatusView {
    /// Device identifier.
    pub udid: String,
    /// Backup UUID.
    pub uuid: String,
    /// When the device wrote the status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Whether the last pass was a full backup.
    pub is_full_backup: bool,
    /// Backup format version.
    pub version: String,
    /// Backup state name.
    pub backup_state: String,
    /// Snapshot state name.
    pub snapshot_state: String,
    /// Whether the last pass completed.
    pub complete: bool,
}

impl StatusView {
    /// Builds the view of a parsed status.
    pub fn new(udid: &str, status: &BackupStatus) -> Self {
        Self {
            udid: udid.to_string(),
            uuid: status.uuid.clone(),
            date: status.date.map(format_date),
            is_full_backup: status.is_full_backup,
            version: status.protocol_version.clone(),
            backup_state: status.backup_state.as_str().to_string(),
            snapshot_state: status.snapshot_state.as_str().to_string(),
            complete: status.snapshot_state.is_finished(),
        }
    }
}

/// Loads the status of the backup of `udid` under `root`.
pub fn load(root: &Path, udid: &str) -> Result<StatusView, Box<dyn std::error::Error>> {
    let value = read_plist(&root.join(udid).join(STATUS_FILE_NAME))?;
    let status = BackupStatus::from_value(&value)?;
    Ok(StatusView::new(udid, &status))
}

/// Runs the status command.
pub fn run(root: &Path, udid: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let view = load(root, udid)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        _ => {
            println!("Backup {}", view.udid);
            println!("  UUID:           {}", view.uuid);
            if let Some(date) = &view.date {
                println!("  Date:           {date}");
            }
            println!("  Full backup:    {}", view.is_full_backup);
            println!("  Version:        {}", view.version);
            println!("  Backup state:   {}", view.backup_state);
            println!("  Snapshot state: {}", view.snapshot_state);
            if !view.complete {
                println!("  (last backup did not finish)");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use idevbackup_plist::{to_xml, Value};
    use tempfile::tempdir;

    #[test]
    fn status_view() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("udid")).unwrap();
        let status = Value::dict([
            ("UUID", Value::from("ABCD")),
            ("IsFullBackup", Value::Boolean(true)),
            ("Version", Value::from("3.3")),
            ("BackupState", Value::from("new")),
            ("SnapshotState", Value::from("finished")),
            ("Date", Value::Date(std::time::UNIX_EPOCH)),
        ]);
        std::fs::write(
            dir.path().join("udid/Status.plist"),
            to_xml(&status).unwrap(),
        )
        .unwrap();

        let view = load(dir.path(), "udid").unwrap();
        assert_eq!(view.uuid, "ABCD");
        assert_eq!(view.snapshot_state, "finished");
        assert!(view.complete);
        assert_eq!(view.date.as_deref(), Some("1970-01-01T00:00:00Z"));
    }

    #[test]
    fn missing_status() {
        let dir = tempdir().unwrap();
        assert!(load(dir.path(), "udid").is_err());
    }
}
