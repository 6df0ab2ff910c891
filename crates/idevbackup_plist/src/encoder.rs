//! Property-list encoder.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Wire format for an encoded property list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlistFormat {
    /// `bplist00` binary encoding, used on the wire.
    #[default]
    Binary,
    /// XML encoding, used for files written to disk.
    Xml,
}

/// Encode a value in the requested format.
///
/// # Errors
///
/// Returns an error if the underlying writer rejects the value.
pub fn encode(value: &Value, format: PlistFormat) -> CodecResult<Vec<u8>> {
    let native = to_native(value);
    let mut buffer = Vec::new();
    let written = match format {
        PlistFormat::Binary => native.to_writer_binary(&mut buffer),
        PlistFormat::Xml => native.to_writer_xml(&mut buffer),
    };
    written.map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// Encode a value as a binary property list.
///
/// # Errors
///
/// Returns an error if the value cannot be encoded.
pub fn to_binary(value: &Value) -> CodecResult<Vec<u8>> {
    encode(value, PlistFormat::Binary)
}

/// Encode a value as an XML property list.
///
/// # Errors
///
/// Returns an error if the value cannot be encoded.
pub fn to_xml(value: &Value) -> CodecResult<Vec<u8>> {
    encode(value, PlistFormat::Xml)
}

fn to_native(value: &Value) -> plist::Value {
    match value {
        Value::Boolean(b) => plist::Value::Boolean(*b),
        Value::Integer(n) => plist::Value::Integer((*n).into()),
        Value::Real(r) => plist::Value::Real(*r),
        Value::String(s) => plist::Value::String(s.clone()),
        Value::Data(d) => plist::Value::Data(d.clone()),
        Value::Date(d) => plist::Value::Date((*d).into()),
        Value::Array(items) => plist::Value::Array(items.iter().map(to_native).collect()),
        Value::Dictionary(pairs) => {
            let mut dict = plist::Dictionary::new();
            for (key, value) in pairs {
                dict.insert(key.clone(), to_native(value));
            }
            plist::Value::Dictionary(dict)
        }
        Value::Uid(uid) => plist::Value::Uid(plist::Uid::new(*uid)),
    }
}
