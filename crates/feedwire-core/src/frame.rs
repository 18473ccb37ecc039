//! Wire frames and the JSON text codec.
//!
//! One frame type travels in both directions. Requests carry `method`,
//! `value` and an optional `messageId`; data pushes add the cache hashes and
//! the `inserted`/`updated`/`deleted` sets of a diff. Absent fields are
//! omitted from the encoded text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FrameError;

/// Prefix of every reply to a routed request (`"m." + path`).
pub const REPLY_PREFIX: &str = "m.";
/// Method of error frames.
pub const ERROR_METHOD: &str = "m.error";
/// Cache-probe round trip.
pub const CACHE_METHOD: &str = "___cache";
/// Prefix of lazy-load triggers (`"request." + outbound method`).
pub const REQUEST_PREFIX: &str = "request.";
/// Client browser metadata exchange.
pub const BROWSER_METHOD: &str = "___browser";
/// Client IP exchange.
pub const IP_METHOD: &str = "___ip";
/// Method carried by `data_group` envelopes.
pub const GROUP_METHOD: &str = "___group";
/// `messageId` echoed when the request carried none.
pub const NO_MESSAGE_ID: i64 = -1;

const UNAUTHORIZED_MARKERS: [&str; 2] = ["auth:unauthorized", "error:auth:unauthorized"];

/// Reserved `value` strings that give a frame its semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sentinel {
    /// Frame carries `inserted`/`updated`/`deleted`.
    DataDiff,
    /// Client cache for the method is still valid.
    CacheRestore,
    /// Client must discard its cache for the method.
    CacheDelete,
    /// Client must discard the data for the method.
    DataDelete,
    /// Frame wraps several frames in `inserted`.
    DataGroup,
}

impl Sentinel {
    /// Wire spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DataDiff => "data_diff",
            Self::CacheRestore => "cache_restore",
            Self::CacheDelete => "cache_delete",
            Self::DataDelete => "data_delete",
            Self::DataGroup => "data_group",
        }
    }

    /// Parse a wire spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "data_diff" => Some(Self::DataDiff),
            "cache_restore" => Some(Self::CacheRestore),
            "cache_delete" => Some(Self::CacheDelete),
            "data_delete" => Some(Self::DataDelete),
            "data_group" => Some(Self::DataGroup),
            _ => None,
        }
    }

    fn value(self) -> Option<Value> {
        Some(Value::String(self.as_str().to_owned()))
    }
}

/// A protocol frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Route path, reply method, outbound method or reserved method.
    pub method: String,
    /// Payload, data collection or [`Sentinel`] string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Request/reply correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    /// Coarse invalidation fingerprint of the outbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_hash: Option<String>,
    /// Content hash of the delivered payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_hash: Option<String>,
    /// Items new to the client (or nested frames of a group).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted: Option<Vec<Value>>,
    /// Items whose content changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<Vec<Value>>,
    /// Items the client must remove.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<Vec<Value>>,
    /// Total length of the underlying collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl Frame {
    /// A bare frame for `method`.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    /// Reply to a routed request on `"m." + path`.
    pub fn reply(path: &str, value: Value, message_id: Option<i64>) -> Self {
        Self {
            method: format!("{REPLY_PREFIX}{path}"),
            value: Some(value),
            message_id: Some(message_id.unwrap_or(NO_MESSAGE_ID)),
            ..Self::default()
        }
    }

    /// Error frame correlated with a request.
    pub fn error(message: impl Into<String>, message_id: Option<i64>) -> Self {
        Self {
            method: ERROR_METHOD.to_owned(),
            value: Some(Value::String(message.into())),
            message_id: Some(message_id.unwrap_or(NO_MESSAGE_ID)),
            ..Self::default()
        }
    }

    /// Full data delivery.
    pub fn data(method: &str, items: Vec<Value>) -> Self {
        Self {
            method: method.to_owned(),
            value: Some(Value::Array(items)),
            ..Self::default()
        }
    }

    /// Differential delivery.
    pub fn diff(
        method: &str,
        inserted: Vec<Value>,
        updated: Vec<Value>,
        deleted: Vec<Value>,
    ) -> Self {
        Self {
            method: method.to_owned(),
            value: Sentinel::DataDiff.value(),
            inserted: Some(inserted),
            updated: Some(updated),
            deleted: Some(deleted),
            ..Self::default()
        }
    }

    /// Ask the client for its stored hashes of `outbound`.
    pub fn cache_probe(outbound: &str) -> Self {
        Self {
            method: CACHE_METHOD.to_owned(),
            value: Some(Value::String(outbound.to_owned())),
            ..Self::default()
        }
    }

    /// Tell the client its cached copy of `method` is current.
    pub fn cache_restore(method: &str) -> Self {
        Self::sentinel_frame(method, Sentinel::CacheRestore)
    }

    /// Tell the client to discard its cached copy of `method`.
    pub fn cache_delete(method: &str) -> Self {
        Self::sentinel_frame(method, Sentinel::CacheDelete)
    }

    /// Tell the client to discard its data for `method`.
    pub fn data_delete(method: &str) -> Self {
        Self::sentinel_frame(method, Sentinel::DataDelete)
    }

    fn sentinel_frame(method: &str, sentinel: Sentinel) -> Self {
        Self {
            method: method.to_owned(),
            value: sentinel.value(),
            ..Self::default()
        }
    }

    /// Attach cache hashes.
    #[must_use]
    pub fn with_hashes(mut self, global: Option<String>, specific: Option<String>) -> Self {
        self.global_hash = global;
        self.specific_hash = specific;
        self
    }

    /// Attach the total collection length.
    #[must_use]
    pub fn with_length(mut self, length: Option<u64>) -> Self {
        self.length = length;
        self
    }

    /// The sentinel carried in `value`, if any.
    pub fn sentinel(&self) -> Option<Sentinel> {
        self.value.as_ref().and_then(Value::as_str).and_then(Sentinel::parse)
    }

    /// Whether this frame is a `data_group` envelope.
    pub fn is_group(&self) -> bool {
        self.sentinel() == Some(Sentinel::DataGroup)
    }
}

/// Whether a handler return value is one of the legacy unauthorized markers.
pub fn is_unauthorized_marker(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| UNAUTHORIZED_MARKERS.iter().any(|m| s.starts_with(m)))
}

/// Encode one frame as JSON text.
pub fn encode(frame: &Frame) -> Result<String, FrameError> {
    if frame.method.is_empty() {
        return Err(FrameError::MissingMethod);
    }
    Ok(serde_json::to_string(frame)?)
}

/// Encode several frames into a single `data_group` envelope.
pub fn encode_group(frames: &[Frame]) -> Result<String, FrameError> {
    if frames.is_empty() {
        return Err(FrameError::EmptyGroup);
    }
    let mut nested = Vec::with_capacity(frames.len());
    for frame in frames {
        if frame.is_group() {
            return Err(FrameError::NestedGroup);
        }
        if frame.method.is_empty() {
            return Err(FrameError::MissingMethod);
        }
        nested.push(serde_json::to_value(frame)?);
    }
    let envelope = Frame {
        method: GROUP_METHOD.to_owned(),
        value: Sentinel::DataGroup.value(),
        inserted: Some(nested),
        ..Frame::default()
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode JSON text into frames, flattening a `data_group` envelope.
pub fn decode(text: &str) -> Result<Vec<Frame>, FrameError> {
    let frame: Frame = serde_json::from_str(text)?;
    if frame.method.is_empty() {
        return Err(FrameError::MissingMethod);
    }
    if !frame.is_group() {
        return Ok(vec![frame]);
    }

    let nested = frame.inserted.unwrap_or_default();
    if nested.is_empty() {
        return Err(FrameError::EmptyGroup);
    }
    nested
        .into_iter()
        .map(|value| {
            let inner: Frame = serde_json::from_value(value)?;
            if inner.is_group() {
                Err(FrameError::NestedGroup)
            } else if inner.method.is_empty() {
                Err(FrameError::MissingMethod)
            } else {
                Ok(inner)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn sentinel_spellings() {
        for s in [
            Sentinel::DataDiff,
            Sentinel::CacheRestore,
            Sentinel::CacheDelete,
            Sentinel::DataDelete,
            Sentinel::DataGroup,
        ] {
            assert_eq!(Sentinel::parse(s.as_str()), Some(s));
        }
        assert_eq!(Sentinel::parse("data"), None);
    }

    #[test]
    fn reply_uses_prefixed_method_and_default_id() {
        let frame = Frame::reply("users.get", json!({"id": 1}), None);
        assert_eq!(frame.method, "m.users.get");
        assert_eq!(frame.message_id, Some(NO_MESSAGE_ID));

        let frame = Frame::reply("users.get", json!(null), Some(7));
        assert_eq!(frame.message_id, Some(7));
    }

    #[test]
    fn encode_omits_absent_fields() {
        let text = encode(&Frame::cache_restore("todos")).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, json!({"method": "todos", "value": "cache_restore"}));
    }

    #[test]
    fn diff_frame_uses_camel_case() {
        let frame = Frame::diff("todos", vec![json!({"id": 3})], vec![], vec![])
            .with_hashes(Some("g".into()), Some("s".into()))
            .with_length(Some(10));
        let parsed: Value = serde_json::from_str(&encode(&frame).unwrap()).unwrap();
        assert_eq!(parsed["value"], "data_diff");
        assert_eq!(parsed["globalHash"], "g");
        assert_eq!(parsed["specificHash"], "s");
        assert_eq!(parsed["inserted"], json!([{"id": 3}]));
        assert_eq!(parsed["updated"], json!([]));
        assert_eq!(parsed["length"], 10);
    }

    #[test]
    fn cache_probe_carries_outbound_in_value() {
        let frame = Frame::cache_probe("todos");
        assert_eq!(frame.method, CACHE_METHOD);
        assert_eq!(frame.value, Some(json!("todos")));
    }

    #[test]
    fn decode_request_frame() {
        let frames = decode(r#"{"method":"users.get","value":{"id":1},"messageId":4}"#).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].method, "users.get");
        assert_eq!(frames[0].message_id, Some(4));
        assert_eq!(frames[0].value, Some(json!({"id": 1})));
    }

    #[test]
    fn decode_rejects_missing_method() {
        assert_matches!(decode(r#"{"value":1}"#), Err(FrameError::Json(_)));
        assert_matches!(decode(r#"{"method":""}"#), Err(FrameError::MissingMethod));
        assert_matches!(decode("not json"), Err(FrameError::Json(_)));
    }

    #[test]
    fn group_is_flattened_on_decode() {
        let text = encode_group(&[
            Frame::new("a"),
            Frame::reply("b", json!(1), Some(2)),
        ])
        .unwrap();
        let frames = decode(&text).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].method, "a");
        assert_eq!(frames[1].method, "m.b");
    }

    #[test]
    fn nested_and_empty_groups_are_rejected() {
        assert_matches!(encode_group(&[]), Err(FrameError::EmptyGroup));

        let nested = r#"{"method":"___group","value":"data_group","inserted":[
            {"method":"___group","value":"data_group","inserted":[{"method":"x"}]}
        ]}"#;
        assert_matches!(decode(nested), Err(FrameError::NestedGroup));

        let empty = r#"{"method":"___group","value":"data_group","inserted":[]}"#;
        assert_matches!(decode(empty), Err(FrameError::EmptyGroup));
    }

    #[test]
    fn unauthorized_markers() {
        assert!(is_unauthorized_marker(&json!("auth:unauthorized")));
        assert!(is_unauthorized_marker(&json!("error:auth:unauthorized: token expired")));
        assert!(!is_unauthorized_marker(&json!("authorized")));
        assert!(!is_unauthorized_marker(&json!({"auth": "unauthorized"})));
    }
}
