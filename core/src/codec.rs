//! Newline-delimited JSON framing for DDX-RPC.
//!
//! Decoding runs in two passes. The first pass walks the raw document only to
//! refuse duplicate keys in the envelope and in an error object; the second
//! pass builds the [`Message`] from a single parsed map. Everything downstream
//! reads that `Message` and never re-scans the raw bytes, so two readers can
//! never disagree about which of two same-named keys was meant.

use crate::rpc_types::{Message, RpcError};
use serde::de::{self, Deserialize, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },

    #[error("empty frame")]
    Empty,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unverifiable error object: {0}")]
    UnverifiedError(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One encoded message, terminated by a single `\n`.
///
/// Frames are move-only; handing one to a writer gives it away.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Serializes `msg` into a newline-terminated frame.
pub fn encode(msg: &Message) -> Result<Frame, CodecError> {
    let mut obj = Map::new();
    match msg {
        Message::Request { id, method, params } => {
            obj.insert("method".to_string(), Value::String(method.clone()));
            obj.insert("id".to_string(), id.clone());
            if let Some(params) = params {
                obj.insert("params".to_string(), params.clone());
            }
        }
        Message::Notification { method, params } => {
            obj.insert("method".to_string(), Value::String(method.clone()));
            if let Some(params) = params {
                obj.insert("params".to_string(), params.clone());
            }
        }
        Message::Response { id, result } => {
            obj.insert("id".to_string(), id.clone());
            obj.insert("result".to_string(), result.clone());
        }
        Message::Error { id, error } => {
            obj.insert("id".to_string(), id.clone());
            obj.insert("error".to_string(), error.to_value());
        }
    }
    let mut bytes = serde_json::to_vec(&Value::Object(obj))?;
    bytes.push(b'\n');
    Ok(Frame(bytes))
}

/// Parses one raw line (terminator optional) into a [`Message`].
pub fn decode(raw: &[u8], max_frame_size: usize) -> Result<Message, CodecError> {
    if raw.len() > max_frame_size {
        return Err(CodecError::Oversized {
            size: raw.len(),
            max: max_frame_size,
        });
    }
    let line = trim_terminator(raw);
    if line.iter().all(u8::is_ascii_whitespace) {
        return Err(CodecError::Empty);
    }

    let mut de = serde_json::Deserializer::from_slice(line);
    EnvelopeKeys::deserialize(&mut de).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let value: Value =
        serde_json::from_slice(line).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(CodecError::Malformed("frame is not an object".to_string()));
    };
    build_message(obj)
}

fn trim_terminator(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &raw[..end]
}

fn build_message(mut obj: Map<String, Value>) -> Result<Message, CodecError> {
    let method = match obj.remove("method") {
        Some(Value::String(m)) => Some(m),
        Some(other) => {
            return Err(CodecError::Malformed(format!(
                "method must be a string, got {}",
                other
            )))
        }
        None => None,
    };
    let id = obj.remove("id");
    let params = obj.remove("params");
    let result = obj.remove("result");
    let error = obj.remove("error");

    if let Some(method) = method {
        if result.is_some() || error.is_some() {
            return Err(CodecError::Malformed(
                "a message with a method cannot carry a result or error".to_string(),
            ));
        }
        if let Some(p) = &params {
            if !p.is_object() {
                return Err(CodecError::Malformed("params must be an object".to_string()));
            }
        }
        return match id {
            Some(Value::Null) => Err(CodecError::Malformed("request id cannot be null".to_string())),
            Some(id) => Ok(Message::Request { id, method, params }),
            None => Ok(Message::Notification { method, params }),
        };
    }

    let Some(id) = id else {
        return Err(CodecError::Malformed(
            "message has neither a method nor an id".to_string(),
        ));
    };
    if params.is_some() {
        return Err(CodecError::Malformed("a response cannot carry params".to_string()));
    }
    match (result, error) {
        (Some(_), Some(_)) => Err(CodecError::Malformed(
            "a response cannot carry both result and error".to_string(),
        )),
        (_, Some(error)) => Ok(Message::Error {
            id,
            error: verify_error(error)?,
        }),
        (result, None) => {
            if id.is_null() {
                return Err(CodecError::Malformed(
                    "a successful response needs a non-null id".to_string(),
                ));
            }
            Ok(Message::Response {
                id,
                result: result.unwrap_or(Value::Bool(true)),
            })
        }
    }
}

fn verify_error(error: Value) -> Result<RpcError, CodecError> {
    let Value::Object(mut obj) = error else {
        return Err(CodecError::UnverifiedError("error is not an object".to_string()));
    };
    let code = obj
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| CodecError::UnverifiedError("code is missing or not an integer".to_string()))?;
    let message = match obj.remove("message") {
        Some(Value::String(m)) => m,
        _ => {
            return Err(CodecError::UnverifiedError(
                "message is missing or not a string".to_string(),
            ))
        }
    };
    Ok(RpcError {
        code,
        message,
        data: obj.remove("data"),
    })
}

// Duplicate-key scan of the top-level object; values are skipped except for
// `error`, whose own keys are scanned as well.
struct EnvelopeKeys;

impl<'de> Deserialize<'de> for EnvelopeKeys {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(EnvelopeKeysVisitor)
    }
}

struct EnvelopeKeysVisitor;

impl<'de> Visitor<'de> for EnvelopeKeysVisitor {
    type Value = EnvelopeKeys;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut seen = HashSet::new();
        while let Some(key) = map.next_key::<String>()? {
            if key == "error" {
                map.next_value::<ErrorKeys>()?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
            if !seen.insert(key.clone()) {
                return Err(de::Error::custom(format!("duplicate key `{}`", key)));
            }
        }
        Ok(EnvelopeKeys)
    }
}

// Accepts any JSON value; only objects are inspected.
struct ErrorKeys;

impl<'de> Deserialize<'de> for ErrorKeys {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ErrorKeysVisitor)
    }
}

struct ErrorKeysVisitor;

impl<'de> Visitor<'de> for ErrorKeysVisitor {
    type Value = ErrorKeys;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<Self::Value, E> {
        Ok(ErrorKeys)
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<Self::Value, E> {
        Ok(ErrorKeys)
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<Self::Value, E> {
        Ok(ErrorKeys)
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<Self::Value, E> {
        Ok(ErrorKeys)
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<Self::Value, E> {
        Ok(ErrorKeys)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(ErrorKeys)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(ErrorKeys)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut seen = HashSet::new();
        while let Some(key) = map.next_key::<String>()? {
            map.next_value::<IgnoredAny>()?;
            if !seen.insert(key.clone()) {
                return Err(de::Error::custom(format!(
                    "duplicate key `{}` in error object",
                    key
                )));
            }
        }
        Ok(ErrorKeys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_types::ErrorCode;
    use serde_json::json;

    const MAX: usize = 1024;

    fn decode_str(s: &str) -> Result<Message, CodecError> {
        decode(s.as_bytes(), MAX)
    }

    #[test]
    fn test_encode_ends_with_single_newline() {
        let frame = encode(&Message::request(7, "ping", None)).unwrap();
        let bytes = frame.as_bytes();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_encode_escapes_embedded_newlines() {
        let msg = Message::notification("log", Some(json!({"line": "a\nb"})));
        let frame = encode(&msg).unwrap();
        assert_eq!(frame.as_bytes().iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(decode(frame.as_bytes(), MAX).unwrap(), msg);
    }

    #[test]
    fn test_default_result_on_wire() {
        let frame = encode(&Message::response(json!(1), None)).unwrap();
        let value: Value = serde_json::from_slice(frame.as_bytes()).unwrap();
        assert_eq!(value, json!({"id": 1, "result": true}));
    }

    #[test]
    fn test_round_trip() {
        let messages = vec![
            Message::request("abc", "listDevices", Some(json!({"verbose": true}))),
            Message::notification("disconnect", Some(json!({"reason": "restarting"}))),
            Message::response(json!(12), Some(json!([1, 2, 3]))),
            Message::error(
                Value::Null,
                RpcError::new(-32602, "Invalid params", Some(json!({"field": "cid"}))),
            ),
        ];
        for msg in messages {
            let frame = encode(&msg).unwrap();
            assert_eq!(decode(frame.as_bytes(), MAX).unwrap(), msg);
        }
    }

    #[test]
    fn test_notification_has_no_id() {
        let msg = decode_str("{\"method\":\"alert\"}\n").unwrap();
        assert_eq!(msg, Message::notification("alert", None));
    }

    #[test]
    fn test_response_without_result_is_true() {
        let msg = decode_str("{\"id\":3}\r\n").unwrap();
        assert_eq!(msg, Message::response(json!(3), None));
    }

    #[test]
    fn test_verified_error() {
        let msg = decode_str(r#"{"id":2,"error":{"code":-32003,"message":"Request timed out"}}"#)
            .unwrap();
        match msg {
            Message::Error { id, error } => {
                assert_eq!(id, json!(2));
                assert_eq!(ErrorCode::from_code(error.code), Some(ErrorCode::RequestTimedOut));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_unverified_errors_rejected() {
        for raw in [
            r#"{"id":2,"error":"boom"}"#,
            r#"{"id":2,"error":{"code":"1","message":"x"}}"#,
            r#"{"id":2,"error":{"code":1.5,"message":"x"}}"#,
            r#"{"id":2,"error":{"code":1,"message":5}}"#,
            r#"{"id":2,"error":{"message":"x"}}"#,
        ] {
            assert!(
                matches!(decode_str(raw), Err(CodecError::UnverifiedError(_))),
                "accepted {}",
                raw
            );
        }
    }

    #[test]
    fn test_duplicate_envelope_keys_rejected() {
        let raw = r#"{"id":1,"result":true,"result":{"code":1}}"#;
        assert!(matches!(decode_str(raw), Err(CodecError::Malformed(_))));
        let raw = r#"{"method":"ping","method":"shutdown","id":1}"#;
        assert!(matches!(decode_str(raw), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_duplicate_error_keys_rejected() {
        let raw = r#"{"id":1,"error":{"code":1,"message":"a","code":"x"}}"#;
        assert!(matches!(decode_str(raw), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_duplicate_keys_inside_params_last_wins() {
        let msg = decode_str(r#"{"method":"set","params":{"a":1,"a":2}}"#).unwrap();
        assert_eq!(msg, Message::notification("set", Some(json!({"a": 2}))));
    }

    #[test]
    fn test_oversized_rejected() {
        let raw = format!("{{\"method\":\"x\",\"params\":{{\"p\":\"{}\"}}}}\n", "a".repeat(MAX));
        assert!(matches!(
            decode(raw.as_bytes(), MAX),
            Err(CodecError::Oversized { max: MAX, .. })
        ));
    }

    #[test]
    fn test_structural_violations_rejected() {
        for raw in [
            "[1,2]",
            "not json",
            r#"{"method":"x","id":null}"#,
            r#"{"method":"x","id":1,"result":1}"#,
            r#"{"method":7}"#,
            r#"{"method":"x","params":[1]}"#,
            r#"{"id":1,"result":1,"error":{"code":1,"message":"m"}}"#,
            r#"{"id":1,"params":{}}"#,
            r#"{"id":null,"result":1}"#,
            r#"{"params":{}}"#,
        ] {
            assert!(
                matches!(decode_str(raw), Err(CodecError::Malformed(_))),
                "accepted {}",
                raw
            );
        }
        assert!(matches!(decode_str("  \n"), Err(CodecError::Empty)));
    }
}
