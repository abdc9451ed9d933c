//! Envelope payload encoding.
//!
//! Resolves spec.md §9 Open Question (a): the source's `toBytes` has a bug
//! where the raw-bytes branch never assigns its output. Here the raw-bytes
//! and string branches pass the payload through unchanged; everything else
//! is canonically JSON-encoded.

use serde::Serialize;

/// Something that can be turned into an outbound envelope payload.
pub enum Payload<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
    Value(&'a serde_json::Value),
}

/// Encodes a payload to bytes for transport.
///
/// Bytes and strings pass through unchanged (strings as their UTF-8
/// representation); anything else is canonically JSON-encoded.
pub fn to_bytes(payload: Payload<'_>) -> anyhow::Result<Vec<u8>> {
    match payload {
        Payload::Bytes(b) => Ok(b.to_vec()),
        Payload::Text(s) => Ok(s.as_bytes().to_vec()),
        Payload::Value(v) => Ok(serde_json::to_vec(v)?),
    }
}

/// Encodes any serializable value as a canonical JSON payload, the
/// fallback used when a caller hands the route something other than raw
/// bytes or a string.
pub fn encode_value<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bytes_pass_through_unchanged() {
        let raw = [1u8, 2, 3, 255];
        let out = to_bytes(Payload::Bytes(&raw)).unwrap();
        assert_eq!(out, raw.to_vec());
    }

    #[test]
    fn text_passes_through_as_utf8() {
        let out = to_bytes(Payload::Text("hello")).unwrap();
        assert_eq!(out, b"hello".to_vec());
    }

    #[test]
    fn value_is_canonically_json_encoded() {
        let v = json!({"a": 1});
        let out = to_bytes(Payload::Value(&v)).unwrap();
        assert_eq!(out, serde_json::to_vec(&v).unwrap());
    }
}
