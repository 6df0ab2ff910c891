//! Per-file error reports.
//!
//! Host-side filesystem failures are translated into the device's negative
//! error codes with canned messages.

use idevbackup_plist::Value;
use std::io;

/// Status code for a reply carrying a filename to error map.
pub const MULTI_STATUS_CODE: i64 = -13;
/// Message paired with [`MULTI_STATUS_CODE`].
pub const MULTI_STATUS_MESSAGE: &str = "Multi status";
/// Status code for an operation the host does not implement.
pub const UNSUPPORTED_CODE: i64 = -1;
/// Message paired with [`UNSUPPORTED_CODE`].
pub const UNSUPPORTED_MESSAGE: &str = "Operation not supported";

/// Device-side error code for a filesystem failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorCode {
    /// No such file or directory.
    NotFound,
    /// File exists.
    AlreadyExists,
    /// A path component is not a directory.
    NotADirectory,
    /// Target is a directory.
    IsADirectory,
    /// Too many levels of symbolic links.
    SymlinkLoop,
    /// Input/output error.
    Io,
    /// No space left on device.
    NoSpace,
    /// Anything else.
    Unknown,
}

#[cfg(target_os = "macos")]
const ELOOP: i32 = 62;
#[cfg(not(target_os = "macos"))]
const ELOOP: i32 = 40;
const EIO: i32 = 5;

impl DeviceErrorCode {
    /// Returns the signed code sent to the device.
    pub fn code(self) -> i64 {
        match self {
            DeviceErrorCode::NotFound => -6,
            DeviceErrorCode::AlreadyExists => -7,
            DeviceErrorCode::NotADirectory => -8,
            DeviceErrorCode::IsADirectory => -9,
            DeviceErrorCode::SymlinkLoop => -10,
            DeviceErrorCode::Io => -11,
            DeviceErrorCode::NoSpace => -15,
            DeviceErrorCode::Unknown => -1,
        }
    }

    /// Returns the canned message for this code.
    pub fn message(self) -> &'static str {
        match self {
            DeviceErrorCode::NotFound => "No such file or directory",
            DeviceErrorCode::AlreadyExists => "File exists",
            DeviceErrorCode::NotADirectory => "Not a directory",
            DeviceErrorCode::IsADirectory => "Is a directory",
            DeviceErrorCode::SymlinkLoop => "Too many levels of symbolic links",
            DeviceErrorCode::Io => "Input/output error",
            DeviceErrorCode::NoSpace => "No space left on device",
            DeviceErrorCode::Unknown => "Unknown error",
        }
    }

    /// Classifies a host I/O error.
    pub fn from_io_error(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => return DeviceErrorCode::NotFound,
            io::ErrorKind::AlreadyExists => return DeviceErrorCode::AlreadyExists,
            io::ErrorKind::NotADirectory => return DeviceErrorCode::NotADirectory,
            io::ErrorKind::IsADirectory => return DeviceErrorCode::IsADirectory,
            io::ErrorKind::StorageFull => return DeviceErrorCode::NoSpace,
            _ => {}
        }
        match error.raw_os_error() {
            Some(EIO) => DeviceErrorCode::Io,
            Some(ELOOP) => DeviceErrorCode::SymlinkLoop,
            _ => DeviceErrorCode::Unknown,
        }
    }
}

/// Structured error for one file, as sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileErrorReport {
    /// Signed device error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl FileErrorReport {
    /// Create a report with an explicit code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Report for a classified code with its canned message.
    pub fn from_code(code: DeviceErrorCode) -> Self {
        Self::new(code.code(), code.message())
    }

    /// Report for a host I/O error.
    pub fn from_io_error(error: &io::Error) -> Self {
        Self::from_code(DeviceErrorCode::from_io_error(error))
    }

    /// Builds `{DLFileErrorString, DLFileErrorCode}`.
    pub fn to_value(&self) -> Value {
        Value::dict([
            ("DLFileErrorString", Value::from(self.message.as_str())),
            ("DLFileErrorCode", Value::Integer(self.code)),
        ])
    }
}

/// Builds the filename to error map carried by a multi-status reply.
pub fn multi_status<'a, I>(errors: I) -> Value
where
    I: IntoIterator<Item = (&'a str, &'a FileErrorReport)>,
{
    Value::dict(
        errors
            .into_iter()
            .map(|(name, report)| (name, report.to_value())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_map_to_codes() {
        let cases = [
            (io::ErrorKind::NotFound, -6),
            (io::ErrorKind::AlreadyExists, -7),
            (io::ErrorKind::NotADirectory, -8),
            (io::ErrorKind::IsADirectory, -9),
            (io::ErrorKind::StorageFull, -15),
            (io::ErrorKind::PermissionDenied, -1),
        ];
        for (kind, code) in cases {
            let report = FileErrorReport::from_io_error(&io::Error::from(kind));
            assert_eq!(report.code, code, "{kind:?}");
        }
    }

    #[test]
    fn raw_os_errors() {
        let eio = io::Error::from_raw_os_error(EIO);
        assert_eq!(DeviceErrorCode::from_io_error(&eio), DeviceErrorCode::Io);
        let eloop = io::Error::from_raw_os_error(ELOOP);
        assert_eq!(
            DeviceErrorCode::from_io_error(&eloop),
            DeviceErrorCode::SymlinkLoop
        );
    }

    #[test]
    fn unknown_gets_generic_message() {
        let report = FileErrorReport::from_code(DeviceErrorCode::Unknown);
        assert_eq!(report.message, "Unknown error");
    }

    #[test]
    fn multi_status_map() {
        let missing = FileErrorReport::from_code(DeviceErrorCode::NotFound);
        let custom = FileErrorReport::new(-1, "device aborted");
        let map = multi_status([("a/b", &missing), ("c", &custom)]);

        assert_eq!(map.as_dictionary().map(<[_]>::len), Some(2));
        let entry = map.get("a/b").unwrap();
        assert_eq!(entry.get("DLFileErrorCode"), Some(&Value::Integer(-6)));
        assert_eq!(
            entry.get("DLFileErrorString"),
            Some(&Value::from("No such file or directory"))
        );
    }
}
