//! Property-list decoder.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use std::io::Cursor;

/// Decode a value from binary or XML property-list bytes.
///
/// The format is detected from the input.
///
/// # Errors
///
/// Returns an error if the bytes are empty or not a valid property list.
pub fn decode(bytes: &[u8]) -> CodecResult<Value> {
    if bytes.is_empty() {
        return Err(CodecError::UnexpectedEof);
    }
    let native = plist::Value::from_reader(Cursor::new(bytes))
        .map_err(|e| CodecError::decoding_failed(e.to_string()))?;
    from_native(native)
}

fn from_native(value: plist::Value) -> CodecResult<Value> {
    let converted = match value {
        plist::Value::Boolean(b) => Value::Boolean(b),
        plist::Value::Integer(n) => match n.as_signed() {
            Some(signed) => Value::Integer(signed),
            None => return Err(CodecError::IntegerOverflow),
        },
        plist::Value::Real(r) => Value::Real(r),
        plist::Value::String(s) => Value::String(s),
        plist::Value::Data(d) => Value::Data(d),
        plist::Value::Date(d) => Value::Date(d.into()),
        plist::Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(from_native)
                .collect::<CodecResult<Vec<_>>>()?,
        ),
        plist::Value::Dictionary(dict) => {
            let mut pairs = Vec::with_capacity(dict.len());
            for (key, value) in dict {
                pairs.push((key, from_native(value)?));
            }
            Value::Dictionary(pairs)
        }
        plist::Value::Uid(uid) => Value::Uid(uid.get()),
        other => return Err(CodecError::unsupported_type(format!("{other:?}"))),
    };
    Ok(converted)
}
