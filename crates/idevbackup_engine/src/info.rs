//! `Info.plist` generation.
//!
//! Written to the device backup directory when the device sends its first
//! message. Built from lockdown values, the iTunes settings domain and the
//! iTunes control files on the device.

use crate::error::{BackupResult, ServiceError};
use crate::events::{BackupEvent, EventSink};
use crate::files::{BackupDirectory, BackupFile, INFO_FILE_NAME};
use crate::services::{DeviceSettings, FileAccess};
use idevbackup_plist::{to_xml, Value};
use std::time::SystemTime;
use tracing::{debug, warn};
use uuid::Uuid;

/// Settings domain holding the iTunes settings.
pub const ITUNES_DOMAIN: &str = "com.apple.iTunes";
/// Device directory holding the iTunes control files.
pub const ITUNES_CONTROL_DIR: &str = "/iTunes_Control/iTunes";
/// Host version recorded in the info file.
pub const ITUNES_VERSION: &str = "10.0.1";

/// iTunes control files copied into the info file when present.
pub const ITUNES_FILES: [&str; 11] = [
    "ApertureAlbumPrefs",
    "IC-Info.sidb",
    "IC-Info.sidv",
    "PhotosFolderAlbums",
    "PhotosFolderName",
    "PhotosFolderPrefs",
    "VoiceMemos.plist",
    "iPhotoAlbumPrefs",
    "iTunesApplicationIDs",
    "iTunesPrefs",
    "iTunesPrefs.plist",
];

// (info key, lockdown key)
const ROOT_KEYS: [(&str, &str); 11] = [
    ("Build Version", "BuildVersion"),
    ("Device Name", "DeviceName"),
    ("Display Name", "DeviceName"),
    ("ICCID", "IntegratedCircuitCardIdentity"),
    ("IMEI", "InternationalMobileEquipmentIdentity"),
    ("MEID", "MobileEquipmentIdentifier"),
    ("Phone Number", "PhoneNumber"),
    ("Product Name", "ProductName"),
    ("Product Type", "ProductType"),
    ("Product Version", "ProductVersion"),
    ("Serial Number", "SerialNumber"),
];

/// Builds the info dictionary for `target`.
pub async fn build_info(
    settings: &dyn DeviceSettings,
    files: &dyn FileAccess,
    target: &str,
) -> BackupResult<Value> {
    let root = settings.get_value(None, None).await?;

    let mut info = Value::empty_dict();
    for (info_key, lockdown_key) in ROOT_KEYS {
        if let Some(value) = root.get(lockdown_key) {
            info.insert(info_key, value.clone());
        }
    }
    info.insert(
        "GUID",
        Value::from(Uuid::new_v4().simple().to_string().to_uppercase()),
    );
    info.insert("Last Backup Date", Value::from(SystemTime::now()));
    info.insert("Target Identifier", Value::from(target));
    info.insert("Target Type", Value::from("Device"));
    info.insert("Unique Identifier", Value::from(target.to_uppercase()));

    let mut itunes_files = Value::empty_dict();
    for name in ITUNES_FILES {
        let path = format!("{ITUNES_CONTROL_DIR}/{name}");
        match files.read_file_contents(&path).await {
            Ok(contents) => {
                itunes_files.insert(name, Value::Data(contents));
            }
            Err(ServiceError::NotFound(_)) => {}
            Err(e) => debug!(%path, error = %e, "skipping iTunes file"),
        }
    }
    info.insert("iTunes Files", itunes_files);

    match settings.get_value(Some(ITUNES_DOMAIN), None).await {
        Ok(value) => {
            info.insert("iTunes Settings", value);
        }
        Err(e) => warn!(error = %e, "no iTunes settings"),
    }
    info.insert("iTunes Version", Value::from(ITUNES_VERSION));

    Ok(info)
}

/// Builds and writes the info file, reporting it like a received file.
pub(crate) async fn write_info(
    settings: &dyn DeviceSettings,
    files: &dyn FileAccess,
    directory: &BackupDirectory,
    target: &str,
    sink: &EventSink,
) -> BackupResult<BackupFile> {
    let mut file = BackupFile::new(
        INFO_FILE_NAME,
        format!("{target}/{INFO_FILE_NAME}"),
        directory.root(),
    );
    sink.emit(BackupEvent::BeforeReceivingFile(file.clone()));

    let info = build_info(settings, files, target).await?;
    let bytes = to_xml(&info)?;
    tokio::fs::create_dir_all(directory.device_root()).await?;
    tokio::fs::write(file.local_path(), &bytes).await?;

    file.file_size = bytes.len() as u64;
    file.expected_file_size = file.file_size;
    sink.emit(BackupEvent::FileReceived(file.clone()));
    debug!(path = %file.local_path().display(), "info file written");
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockFileAccess, MockSettings};
    use idevbackup_plist::decode;
    use tempfile::tempdir;

    fn device_settings() -> MockSettings {
        let settings = MockSettings::new();
        settings.set_value(
            None,
            None,
            Value::dict([
                ("DeviceName", Value::from("Test Phone")),
                ("ProductType", Value::from("iPhone15,2")),
                ("ProductVersion", Value::from("17.2")),
                ("SerialNumber", Value::from("F00")),
            ]),
        );
        settings
    }

    #[tokio::test]
    async fn info_contents() {
        let settings = device_settings();
        settings.set_value(
            Some(ITUNES_DOMAIN),
            None,
            Value::dict([("LibraryID", Value::from("ABC"))]),
        );
        let files = MockFileAccess::new();
        files.add_file("/iTunes_Control/iTunes/iTunesPrefs", b"prefs".to_vec());

        let info = build_info(&settings, &files, "00008110-abc").await.unwrap();
        assert_eq!(info.get("Device Name"), Some(&Value::from("Test Phone")));
        assert_eq!(info.get("Display Name"), Some(&Value::from("Test Phone")));
        assert_eq!(info.get("Product Version"), Some(&Value::from("17.2")));
        assert_eq!(info.get("IMEI"), None);
        assert_eq!(info.get("Target Type"), Some(&Value::from("Device")));
        assert_eq!(
            info.get("Unique Identifier"),
            Some(&Value::from("00008110-ABC"))
        );
        assert_eq!(info.get("GUID").and_then(Value::as_string).map(str::len), Some(32));

        let itunes_files = info.get("iTunes Files").unwrap();
        assert_eq!(
            itunes_files.get("iTunesPrefs"),
            Some(&Value::Data(b"prefs".to_vec()))
        );
        assert_eq!(itunes_files.as_dictionary().map(<[_]>::len), Some(1));
        assert!(info.get("iTunes Settings").is_some());
    }

    #[tokio::test]
    async fn info_file_is_xml_in_device_root() {
        let dir = tempdir().unwrap();
        let directory = BackupDirectory::new(dir.path(), "udid");
        let sink = EventSink::new();
        let mut events = sink.subscribe();

        let file = write_info(
            &device_settings(),
            &MockFileAccess::new(),
            &directory,
            "udid",
            &sink,
        )
        .await
        .unwrap();

        let bytes = std::fs::read(dir.path().join("udid/Info.plist")).unwrap();
        assert!(bytes.starts_with(b"<?xml"));
        assert_eq!(
            decode(&bytes).unwrap().get("Target Identifier"),
            Some(&Value::from("udid"))
        );
        assert_eq!(file.file_size, bytes.len() as u64);
        assert!(matches!(
            events.try_recv(),
            Ok(BackupEvent::BeforeReceivingFile(_))
        ));
        assert!(matches!(events.try_recv(), Ok(BackupEvent::FileReceived(_))));
    }

    #[tokio::test]
    async fn missing_lockdown_values_fail() {
        let err = build_info(&MockSettings::new(), &MockFileAccess::new(), "udid")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::BackupError::Service(_)));
    }
}
