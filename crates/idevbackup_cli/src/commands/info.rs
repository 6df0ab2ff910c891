//! Info command implementation.

use super::{format_date, read_plist};
use idevbackup_engine::INFO_FILE_NAME;
use idevbackup_plist::Value;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

// Keys printed in text output, in order.
const TEXT_KEYS: [&str; 12] = [
    "Device Name",
    "Product Type",
    "Product Version",
    "Build Version",
    "Serial Number",
    "IMEI",
    "Phone Number",
    "Target Identifier",
    "Unique Identifier",
    "GUID",
    "Last Backup Date",
    "iTunes Version",
];

/// Device information as printed.
#[derive(Debug, Serialize)]
pub struct InfoView {
    /// Device identifier.
    pub udid: String,
    /// Scalar fields by info key.
    pub fields: BTreeMap<String, String>,
    /// Names of the stored iTunes files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub itunes_files: Option<Vec<String>>,
}

/// Loads the info file of the backup of `udid` under `root`.
pub fn load(
    root: &Path,
    udid: &str,
    with_files: bool,
) -> Result<InfoView, Box<dyn std::error::Error>> {
    let value = read_plist(&root.join(udid).join(INFO_FILE_NAME))?;
    let entries = value
        .as_dictionary()
        .ok_or_else(|| format!("{INFO_FILE_NAME} of {udid} is not a dictionary"))?;

    let mut fields = BTreeMap::new();
    for (key, value) in entries {
        if let Some(text) = scalar_text(value) {
            fields.insert(key.clone(), text);
        }
    }

    let itunes_files = with_files.then(|| {
        value
            .get("iTunes Files")
            .and_then(Value::as_dictionary)
            .map(|files| files.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    });

    Ok(InfoView {
        udid: udid.to_string(),
        fields,
        itunes_files,
    })
}

/// Runs the info command.
pub fn run(
    root: &Path,
    udid: &str,
    with_files: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let view = load(root, udid, with_files)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        _ => {
            println!("Backup {}", view.udid);
            for key in TEXT_KEYS {
                if let Some(value) = view.fields.get(key) {
                    println!("  {:<18} {value}", format!("{key}:"));
                }
            }
            if let Some(files) = &view.itunes_files {
                println!("  iTunes files:");
                for name in files {
                    println!("    {name}");
                }
            }
        }
    }

    Ok(())
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(r) => Some(r.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        Value::Date(t) => Some(format_date(*t)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idevbackup_plist::to_xml;
    use tempfile::tempdir;

    #[test]
    fn info_view() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("udid")).unwrap();
        let info = Value::dict([
            ("Device Name", Value::from("Test Phone")),
            ("Product Version", Value::from("17.2")),
            (
                "iTunes Files",
                Value::dict([("iTunesPrefs", Value::Data(vec![1, 2]))]),
            ),
        ]);
        std::fs::write(dir.path().join("udid/Info.plist"), to_xml(&info).unwrap()).unwrap();

        let view = load(dir.path(), "udid", true).unwrap();
        assert_eq!(view.fields.get("Device Name").map(String::as_str), Some("Test Phone"));
        assert!(!view.fields.contains_key("iTunes Files"));
        assert_eq!(view.itunes_files, Some(vec!["iTunesPrefs".to_string()]));

        let view = load(dir.path(), "udid", false).unwrap();
        assert!(view.itunes_files.is_none());
    }
}
