//! Value codecs: the pluggable strategy that turns typed values into
//! opaque payload strings and back.
//!
//! Typed values pass through [`serde_json::Value`] on both sides so that
//! [`ValueCodec`] stays object safe and can be swapped per call.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::PersistError;

/// Serialization strategy for stored values.
pub trait ValueCodec: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Render a value as a payload string.
    fn encode(&self, value: &Value) -> Result<String, PersistError>;

    /// Parse a payload string back into a value.
    fn decode(&self, payload: &str) -> Result<Value, PersistError>;
}

/// Compact JSON. The default codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<String, PersistError> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, payload: &str) -> Result<Value, PersistError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Indented JSON, for payloads meant to be read by people.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrettyJsonCodec;

impl ValueCodec for PrettyJsonCodec {
    fn name(&self) -> &str {
        "json-pretty"
    }

    fn encode(&self, value: &Value) -> Result<String, PersistError> {
        Ok(serde_json::to_string_pretty(value)?)
    }

    fn decode(&self, payload: &str) -> Result<Value, PersistError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Encode a typed value with the given codec.
pub fn encode_value<T: Serialize + ?Sized>(
    codec: &dyn ValueCodec,
    value: &T,
) -> Result<String, PersistError> {
    let value = serde_json::to_value(value)?;
    codec.encode(&value)
}

/// Decode a payload string into `T`.
///
/// When the codec cannot produce a `T`, the payload is tried as a number
/// using Rust's own numeric parsers (so `+5` and `007` load as integers),
/// then as a plain string so that bare text written by other clients still
/// loads into `String`.
pub fn decode_value<T: DeserializeOwned>(
    codec: &dyn ValueCodec,
    payload: &str,
) -> Result<T, PersistError> {
    codec
        .decode(payload)
        .and_then(|value| Ok(serde_json::from_value(value)?))
        .or_else(|err| {
            parse_number(payload)
                .and_then(|number| serde_json::from_value(number).ok())
                .map_or_else(
                    || serde_json::from_value(Value::String(payload.to_string())),
                    Ok,
                )
                .map_err(|_| err)
        })
}

fn parse_number(text: &str) -> Option<Value> {
    if let Ok(n) = text.parse::<i64>() {
        return Some(n.into());
    }
    if let Ok(n) = text.parse::<u64>() {
        return Some(n.into());
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        level: u32,
    }

    #[test]
    fn test_numbers_decode_from_payload_text() {
        assert_eq!(decode_value::<i32>(&JsonCodec, "42").unwrap(), 42);
        assert_eq!(decode_value::<u64>(&JsonCodec, "18446744073709551615").unwrap(), u64::MAX);
        assert_eq!(decode_value::<f64>(&JsonCodec, "2.5").unwrap(), 2.5);
        assert!(decode_value::<u8>(&JsonCodec, "300").is_err());
    }

    #[test]
    fn test_numbers_accept_native_number_syntax() {
        assert_eq!(decode_value::<i32>(&JsonCodec, "+5").unwrap(), 5);
        assert_eq!(decode_value::<i32>(&JsonCodec, "007").unwrap(), 7);
        assert_eq!(decode_value::<u64>(&JsonCodec, "+18446744073709551615").unwrap(), u64::MAX);
        assert_eq!(decode_value::<f64>(&JsonCodec, "+2.5").unwrap(), 2.5);
        assert_eq!(decode_value::<String>(&JsonCodec, "007").unwrap(), "007");
        assert_eq!(decode_value::<String>(&JsonCodec, "inf").unwrap(), "inf");
        assert!(decode_value::<i32>(&JsonCodec, "+").is_err());
    }

    #[test]
    fn test_struct_payload() {
        let profile = Profile {
            name: "ada".into(),
            level: 3,
        };
        let payload = encode_value(&JsonCodec, &profile).unwrap();
        assert_eq!(payload, r#"{"name":"ada","level":3}"#);
        assert_eq!(decode_value::<Profile>(&JsonCodec, &payload).unwrap(), profile);
    }

    #[test]
    fn test_bare_text_loads_as_string() {
        assert_eq!(
            decode_value::<String>(&JsonCodec, "hello world").unwrap(),
            "hello world"
        );
        assert_eq!(decode_value::<String>(&JsonCodec, "42").unwrap(), "42");
        assert!(matches!(
            decode_value::<u32>(&JsonCodec, "hello"),
            Err(PersistError::Serialization(_))
        ));
    }

    #[test]
    fn test_pretty_codec_is_readable_and_compatible() {
        let profile = Profile {
            name: "bo".into(),
            level: 1,
        };
        let payload = encode_value(&PrettyJsonCodec, &profile).unwrap();
        assert!(payload.contains('\n'));
        assert_eq!(decode_value::<Profile>(&JsonCodec, &payload).unwrap(), profile);
    }
}
