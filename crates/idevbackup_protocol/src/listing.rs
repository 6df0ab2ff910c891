//! Directory-listing entries.

use idevbackup_plist::Value;
use std::time::SystemTime;

/// Type of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// A directory.
    Directory,
    /// Any other file.
    Regular,
}

impl FileType {
    /// Returns the type string used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Directory => "DLFileTypeDirectory",
            FileType::Regular => "DLFileTypeRegular",
        }
    }
}

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Last modification time.
    pub modification_date: SystemTime,
    /// Size in bytes.
    pub size: u64,
    /// Entry type.
    pub file_type: FileType,
}

impl DirectoryEntry {
    /// Builds the entry dictionary.
    pub fn to_value(&self) -> Value {
        Value::dict([
            ("DLFileModificationDate", Value::Date(self.modification_date)),
            (
                "DLFileSize",
                Value::Integer(i64::try_from(self.size).unwrap_or(i64::MAX)),
            ),
            ("DLFileType", Value::from(self.file_type.as_str())),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_dictionary() {
        let entry = DirectoryEntry {
            modification_date: SystemTime::UNIX_EPOCH,
            size: 4096,
            file_type: FileType::Directory,
        };
        let value = entry.to_value();
        assert_eq!(value.get("DLFileSize"), Some(&Value::Integer(4096)));
        assert_eq!(
            value.get("DLFileType"),
            Some(&Value::from("DLFileTypeDirectory"))
        );
        assert_eq!(
            value.get("DLFileModificationDate"),
            Some(&Value::Date(SystemTime::UNIX_EPOCH))
        );
    }
}
