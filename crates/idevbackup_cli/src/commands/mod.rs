//! CLI command implementations.

pub mod info;
pub mod list;
pub mod status;

use chrono::{DateTime, SecondsFormat, Utc};
use idevbackup_plist::Value;
use std::path::Path;
use std::time::SystemTime;

/// Reads and decodes a property-list file.
pub fn read_plist(path: &Path) -> Result<Value, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    Ok(idevbackup_plist::decode(&bytes)?)
}

/// Formats a timestamp as RFC 3339 in UTC.
pub fn format_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true)
}
