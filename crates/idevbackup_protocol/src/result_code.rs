//! Tag bytes of the file-transfer sub-protocol.

/// Tag byte that follows every chunk length in a file transfer.
///
/// The device vocabulary may grow, so unknown tags are preserved rather
/// than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Transfer of the current file completed.
    Success,
    /// The host failed to provide the file.
    LocalError,
    /// The device failed to provide the file.
    RemoteError,
    /// The chunk carries file content.
    FileData,
    /// The file was skipped.
    Skipped,
    /// Unrecognized tag.
    Unknown(u8),
}

impl ResultCode {
    /// Converts from the wire byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => ResultCode::Success,
            0x06 => ResultCode::LocalError,
            0x0B => ResultCode::RemoteError,
            0x0C => ResultCode::FileData,
            0xFF => ResultCode::Skipped,
            other => ResultCode::Unknown(other),
        }
    }

    /// Converts to the wire byte.
    pub fn to_byte(self) -> u8 {
        match self {
            ResultCode::Success => 0x00,
            ResultCode::LocalError => 0x06,
            ResultCode::RemoteError => 0x0B,
            ResultCode::FileData => 0x0C,
            ResultCode::Skipped => 0xFF,
            ResultCode::Unknown(byte) => byte,
        }
    }

    /// Returns true for tags outside the known vocabulary.
    pub fn is_unknown(self) -> bool {
        matches!(self, ResultCode::Unknown(_))
    }
}
