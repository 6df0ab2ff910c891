//! # idevbackup plist
//!
//! Property-list values and codecs for the device backup protocol.
//!
//! Every DeviceLink message is a property list. On the wire the binary
//! (`bplist00`) format is used; files the host writes into a backup
//! (`Info.plist`) use XML. Decoding detects the format from the input.
//!
//! ## Usage
//!
//! ```
//! use idevbackup_plist::{decode, to_binary, Value};
//!
//! let value = Value::Array(vec![Value::from("DLMessageDisconnect")]);
//! let bytes = to_binary(&value).unwrap();
//!
//! let decoded = decode(&bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod decoder;
mod encoder;
mod error;
mod value;

pub use codec::{DefaultCodec, PlistCodec};
pub use decoder::decode;
pub use encoder::{encode, to_binary, to_xml, PlistFormat};
pub use error::{CodecError, CodecResult};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn roundtrip(value: &Value, format: PlistFormat) -> Value {
        let bytes = encode(value, format).unwrap();
        decode(&bytes).unwrap()
    }

    #[test]
    fn roundtrip_devicelink_envelope() {
        let value = Value::Array(vec![
            Value::from("DLMessageStatusResponse"),
            Value::Integer(-13),
            Value::from("Multi status"),
            Value::dict([(
                "Snapshot/Manifest.db",
                Value::dict([
                    ("DLFileErrorString", Value::from("No such file or directory")),
                    ("DLFileErrorCode", Value::Integer(-6)),
                ]),
            )]),
        ]);

        assert_eq!(roundtrip(&value, PlistFormat::Binary), value);
        assert_eq!(roundtrip(&value, PlistFormat::Xml), value);
    }

    #[test]
    fn roundtrip_scalars() {
        // Whole seconds survive both formats.
        let date = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let value = Value::dict([
            ("Real", Value::Real(42.5)),
            ("Data", Value::Data(vec![0, 1, 2, 255])),
            ("Date", Value::Date(date)),
            ("Negative", Value::Integer(-208)),
            ("Flag", Value::Boolean(false)),
        ]);

        assert_eq!(roundtrip(&value, PlistFormat::Binary), value);
    }
}
