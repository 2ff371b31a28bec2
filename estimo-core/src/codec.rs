//! Text codecs for durable values.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Literal stored text meaning "no value".
pub const UNDEFINED_PLACEHOLDER: &str = "undefined";

/// Converts values to and from their stored text.
pub trait Codec<T> {
    fn encode(&self, value: &T) -> Result<String, CodecError>;
    fn decode(&self, raw: &str) -> Result<T, CodecError>;
}

/// Lossless JSON codec.
///
/// JSON `null` is stored as [`UNDEFINED_PLACEHOLDER`], and the placeholder is
/// read back as `null`, so it only decodes for types that accept `null`
/// (`Option`, unit).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<String, CodecError> {
        let text = serde_json::to_string(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        if text == "null" {
            return Ok(UNDEFINED_PLACEHOLDER.to_string());
        }
        Ok(text)
    }

    fn decode(&self, raw: &str) -> Result<T, CodecError> {
        let text = if raw == UNDEFINED_PLACEHOLDER { "null" } else { raw };
        serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
        tags: Vec<String>,
    }

    #[test]
    fn test_json_roundtrip_struct() {
        let value = Sample {
            name: "deck".into(),
            count: 8,
            tags: vec!["a".into(), "b".into()],
        };
        let text = JsonCodec.encode(&value).unwrap();
        let back: Sample = JsonCodec.decode(&text).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_none_is_stored_as_placeholder() {
        let text = Codec::<Option<u32>>::encode(&JsonCodec, &None).unwrap();
        assert_eq!(text, UNDEFINED_PLACEHOLDER);

        let back: Option<u32> = JsonCodec.decode(&text).unwrap();
        assert_eq!(back, None);
    }

    #[test]
    fn test_placeholder_rejected_for_non_nullable() {
        let result: Result<Sample, _> = JsonCodec.decode(UNDEFINED_PLACEHOLDER);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_malformed_text_is_decode_error() {
        let result: Result<Sample, _> = JsonCodec.decode("{not json");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
