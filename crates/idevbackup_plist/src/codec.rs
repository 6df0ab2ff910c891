//! Pluggable codec interface.

use crate::encoder::PlistFormat;
use crate::error::CodecResult;
use crate::value::Value;

/// Encodes and decodes property lists.
///
/// The engine holds a codec behind this trait so callers can substitute
/// their own implementation.
pub trait PlistCodec: Send + Sync {
    /// Encodes `value` in `format`.
    fn encode(&self, value: &Value, format: PlistFormat) -> CodecResult<Vec<u8>>;

    /// Decodes a binary or XML property list.
    fn decode(&self, bytes: &[u8]) -> CodecResult<Value>;
}

/// Codec backed by the `plist` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodec;

impl PlistCodec for DefaultCodec {
    fn encode(&self, value: &Value, format: PlistFormat) -> CodecResult<Vec<u8>> {
        crate::encoder::encode(value, format)
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Value> {
        crate::decoder::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codec_detects_format() {
        let codec: &dyn PlistCodec = &DefaultCodec;
        let value = Value::dict([("WillEncrypt", Value::Boolean(true))]);

        let xml = codec.encode(&value, PlistFormat::Xml).unwrap();
        assert!(xml.starts_with(b"<?xml"));
        assert_eq!(codec.decode(&xml).unwrap(), value);

        let binary = codec.encode(&value, PlistFormat::Binary).unwrap();
        assert!(binary.starts_with(b"bplist00"));
        assert_eq!(codec.decode(&binary).unwrap(), value);
    }
}
