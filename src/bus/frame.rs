//! The wire frame (spec.md §4.3, §6): every `postMessage`-equivalent
//! payload is a JSON object wrapped under the fixed key `__postRobot__`
//! (here, transmitted over the native IPC channel instead of the DOM
//! `message` event, see [`crate::platform`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const WRAPPER_KEY: &str = "__postRobot__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    Request,
    Ack,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowType {
    Popup,
    SubFrame,
    TopLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub id: String,
    pub hash: String,
    pub name: String,
    pub source_domain: String,
    pub window_type: WindowType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<AckStatus>,
}

/// The `{"__postRobot__": {...}}` envelope that actually crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "__postRobot__")]
    pub frame: Frame,
}

impl Frame {
    pub fn to_wire(&self) -> Result<String, String> {
        serde_json::to_string(&Envelope { frame: self.clone() }).map_err(|e| e.to_string())
    }

    /// Parse a raw IPC payload. Malformed or non-protocol frames yield
    /// `None`, to be silently discarded per spec.md §4.3 "Receive".
    pub fn from_wire(raw: &str) -> Option<Frame> {
        let envelope: Envelope = serde_json::from_str(raw).ok()?;
        Some(envelope.frame)
    }
}

/// `{__type__: METHOD, __id__, __name__}` — a method-handle marker
/// embedded in a request/response payload in place of a callable.
pub const METHOD_MARKER: &str = "METHOD";
/// `{__type__: ERROR, __message__}` — a serialized error value.
pub const ERROR_MARKER: &str = "ERROR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodMarker {
    #[serde(rename = "__type__")]
    pub marker_type: String,
    #[serde(rename = "__id__")]
    pub id: String,
    #[serde(rename = "__name__")]
    pub name: String,
}

impl MethodMarker {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        MethodMarker { marker_type: METHOD_MARKER.to_string(), id: id.into(), name: name.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMarker {
    #[serde(rename = "__type__")]
    pub marker_type: String,
    #[serde(rename = "__message__")]
    pub message: String,
}

impl ErrorMarker {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorMarker { marker_type: ERROR_MARKER.to_string(), message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_wire_format() {
        let frame = Frame {
            frame_type: FrameType::Request,
            id: "id1".into(),
            hash: "hash1".into(),
            name: "init".into(),
            source_domain: "https://a.example".into(),
            window_type: WindowType::Popup,
            data: Some(serde_json::json!({"a": 1})),
            error: None,
            ack: None,
        };
        let wire = frame.to_wire().unwrap();
        assert!(wire.contains(WRAPPER_KEY));
        let back = Frame::from_wire(&wire).unwrap();
        assert_eq!(back.name, "init");
        assert_eq!(back.hash, "hash1");
    }

    #[test]
    fn from_wire_rejects_non_protocol_json() {
        assert!(Frame::from_wire(r#"{"not":"a frame"}"#).is_none());
        assert!(Frame::from_wire("not even json").is_none());
    }
}
