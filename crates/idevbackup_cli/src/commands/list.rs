//! List command implementation.

use super::{format_date, read_plist};
use idevbackup_engine::{INFO_FILE_NAME, STATUS_FILE_NAME};
use idevbackup_plist::Value;
use idevbackup_protocol::BackupStatus;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::debug;

/// One device backup found under the root.
#[derive(Debug, Serialize)]
pub struct BackupSummary {
    /// Device identifier (directory name).
    pub udid: String,
    /// Device name from the info file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// OS version from the info file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_version: Option<String>,
    /// Last backup date from the info file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<String>,
    /// Snapshot state from the status file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_state: Option<String>,
    /// Bytes on disk.
    pub size: u64,
}

/// Scans `root` for device backups.
///
/// A directory counts as a backup when it holds an info or status file.
pub fn scan(root: &Path) -> Result<Vec<BackupSummary>, Box<dyn std::error::Error>> {
    let mut backups = Vec::new();
    for entry in fs::read_dir(root).map_err(|e| format!("cannot read {}: {e}", root.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        let info_path = path.join(INFO_FILE_NAME);
        let status_path = path.join(STATUS_FILE_NAME);
        if !info_path.exists() && !status_path.exists() {
            continue;
        }

        let mut summary = BackupSummary {
            udid: entry.file_name().to_string_lossy().into_owned(),
            device_name: None,
            product_version: None,
            last_backup: None,
            snapshot_state: None,
            size: directory_size(&path)?,
        };

        match read_plist(&info_path) {
            Ok(info) => {
                let text = |key: &str| info.get(key).and_then(Value::as_string).map(str::to_string);
                summary.device_name = text("Device Name");
                summary.product_version = text("Product Version");
                summary.last_backup = info
                    .get("Last Backup Date")
                    .and_then(Value::as_date)
                    .map(format_date);
            }
            Err(e) => debug!(udid = %summary.udid, error = %e, "no usable info file"),
        }
        match read_plist(&status_path).map(|v| BackupStatus::from_value(&v)) {
            Ok(Ok(status)) => {
                summary.snapshot_state = Some(status.snapshot_state.as_str().to_string());
            }
            Ok(Err(e)) => debug!(udid = %summary.udid, error = %e, "unreadable status file"),
            Err(e) => debug!(udid = %summary.udid, error = %e, "no usable status file"),
        }

        backups.push(summary);
    }

    backups.sort_by(|a, b| a.udid.cmp(&b.udid));
    Ok(backups)
}

/// Runs the list command.
pub fn run(root: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let backups = scan(root)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&backups)?);
        }
        _ => {
            if backups.is_empty() {
                println!("No backups found in {}", root.display());
                return Ok(());
            }
            for backup in &backups {
                println!(
                    "{}  {}  {}  {}  {}",
                    backup.udid,
                    backup.device_name.as_deref().unwrap_or("-"),
                    backup.product_version.as_deref().unwrap_or("-"),
                    backup.last_backup.as_deref().unwrap_or("-"),
                    backup.snapshot_state.as_deref().unwrap_or("-"),
                );
                println!("    {} bytes", backup.size);
            }
        }
    }

    Ok(())
}

fn directory_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        total += if metadata.is_dir() {
            directory_size(&entry.path())?
        } else {
            metadata.len()
        };
    }
    Ok(total)
}
