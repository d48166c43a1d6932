//! Wire format for the membership feed.
//!
//! The feed speaks channel frames (Phoenix-style, object form):
//! ```text
//! ┌─────────┬──────────────┬──────────────────────────────┬────────┐
//! │ topic   │ event        │ payload                      │ ref    │
//! │ string  │ string       │ { nodes: [{id, kind|type}] } │ string │
//! └─────────┴──────────────┴──────────────────────────────┴────────┘
//! ```
//!
//! Text frames carry JSON. Binary frames carry the bincode encoding of the
//! same [`FeedFrame`], for feeds that prefer a compact transport.
//!
//! Decoding here is purely structural: a frame with a node missing its `id`,
//! or carrying a number where a string belongs, still decodes. Required-field
//! validation belongs to the normalizer.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Full membership replacement.
pub const EVENT_ACTIVE_NODES: &str = "active_nodes";
/// A single node became active.
pub const EVENT_NODE_JOINED: &str = "node_joined";
/// A single node went away.
pub const EVENT_NODE_LEFT: &str = "node_left";

/// Channel join request sent by the client.
pub const EVENT_JOIN: &str = "phx_join";
/// Channel leave request sent by the client.
pub const EVENT_LEAVE: &str = "phx_leave";
/// Server reply to a client request.
pub const EVENT_REPLY: &str = "phx_reply";
/// Channel crashed on the server side.
pub const EVENT_ERROR: &str = "phx_error";
/// Channel closed by the server.
pub const EVENT_CLOSE: &str = "phx_close";
/// Socket keep-alive.
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// Topic used by socket-level heartbeats.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// A string field that arrived as some other JSON type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTypeError {
    pub field: &'static str,
    /// JSON type actually received, e.g. `number`.
    pub found: &'static str,
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Keep a string, record anything else. `null` counts as absent.
fn loose_text(
    field: &'static str,
    value: Option<Value>,
    type_error: &mut Option<FieldTypeError>,
) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            type_error.get_or_insert(FieldTypeError {
                field,
                found: json_type(&other),
            });
            None
        }
    }
}

/// One node descriptor as it arrives from the feed.
///
/// Both fields are optional on the wire so that a malformed descriptor can be
/// reported with its position instead of failing the whole frame decode.
/// Unknown descriptor fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawNode {
    pub id: Option<String>,
    /// Accepted as `kind` or, as older feeds send it, `type`.
    pub kind: Option<String>,
    /// First field that held a non-string value (JSON frames only).
    #[serde(skip)]
    pub type_error: Option<FieldTypeError>,
}

// JSON descriptors are read loosely so wrong types reach the normalizer.
// Binary frames are produced by our own encoder and read strictly.
#[derive(Deserialize)]
struct LooseNode {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "type")]
    kind: Option<Value>,
}

#[derive(Deserialize)]
struct StrictNode {
    id: Option<String>,
    kind: Option<String>,
}

impl<'de> Deserialize<'de> for RawNode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let loose = LooseNode::deserialize(deserializer)?;
            let mut type_error = None;
            let id = loose_text("id", loose.id, &mut type_error);
            let kind = loose_text("kind", loose.kind, &mut type_error);
            Ok(Self { id, kind, type_error })
        } else {
            let strict = StrictNode::deserialize(deserializer)?;
            Ok(Self {
                id: strict.id,
                kind: strict.kind,
                type_error: None,
            })
        }
    }
}

impl RawNode {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            kind: Some(kind.into()),
            type_error: None,
        }
    }
}

/// Frame payload. Which fields are meaningful depends on the frame event:
/// `nodes` for `active_nodes`, `id`/`kind` for `node_joined` and `node_left`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FramePayload {
    pub nodes: Option<Vec<RawNode>>,
    pub id: Option<String>,
    pub kind: Option<String>,
    /// First of `id`/`kind` that held a non-string value (JSON frames only).
    #[serde(skip)]
    pub type_error: Option<FieldTypeError>,
}

#[derive(Deserialize)]
struct LoosePayload {
    #[serde(default)]
    nodes: Option<Vec<RawNode>>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "type")]
    kind: Option<Value>,
}

#[derive(Deserialize)]
struct StrictPayload {
    nodes: Option<Vec<RawNode>>,
    id: Option<String>,
    kind: Option<String>,
}

impl<'de> Deserialize<'de> for FramePayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let loose = LoosePayload::deserialize(deserializer)?;
            let mut type_error = None;
            let id = loose_text("id", loose.id, &mut type_error);
            let kind = loose_text("kind", loose.kind, &mut type_error);
            Ok(Self {
                nodes: loose.nodes,
                id,
                kind,
                type_error,
            })
        } else {
            let strict = StrictPayload::deserialize(deserializer)?;
            Ok(Self {
                nodes: strict.nodes,
                id: strict.id,
                kind: strict.kind,
                type_error: None,
            })
        }
    }
}

impl FramePayload {
    /// Payload of an `active_nodes` frame.
    pub fn nodes(nodes: Vec<RawNode>) -> Self {
        Self {
            nodes: Some(nodes),
            ..Self::default()
        }
    }

    /// Payload of a single-node frame.
    pub fn node(node: RawNode) -> Self {
        Self {
            nodes: None,
            id: node.id,
            kind: node.kind,
            type_error: node.type_error,
        }
    }
}

/// A single channel frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: FramePayload,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl FeedFrame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: FramePayload) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
        }
    }

    /// Full membership replacement frame.
    pub fn active_nodes(topic: impl Into<String>, nodes: Vec<RawNode>) -> Self {
        Self::new(topic, EVENT_ACTIVE_NODES, FramePayload::nodes(nodes))
    }

    /// Single node join frame.
    pub fn node_joined(topic: impl Into<String>, node: RawNode) -> Self {
        Self::new(topic, EVENT_NODE_JOINED, FramePayload::node(node))
    }

    /// Single node leave frame.
    pub fn node_left(topic: impl Into<String>, id: impl Into<String>) -> Self {
        let payload = FramePayload {
            id: Some(id.into()),
            ..FramePayload::default()
        };
        Self::new(topic, EVENT_NODE_LEFT, payload)
    }

    /// Channel join request.
    pub fn join(topic: impl Into<String>, reference: u64) -> Self {
        Self::new(topic, EVENT_JOIN, FramePayload::default()).with_ref(reference)
    }

    /// Channel leave request.
    pub fn leave(topic: impl Into<String>, reference: u64) -> Self {
        Self::new(topic, EVENT_LEAVE, FramePayload::default()).with_ref(reference)
    }

    /// Socket heartbeat.
    pub fn heartbeat(reference: u64) -> Self {
        Self::new(HEARTBEAT_TOPIC, EVENT_HEARTBEAT, FramePayload::default()).with_ref(reference)
    }

    pub fn with_ref(mut self, reference: u64) -> Self {
        self.reference = Some(reference.to_string());
        self
    }

    /// Whether this frame is channel housekeeping rather than membership data.
    pub fn is_control(&self) -> bool {
        matches!(
            self.event.as_str(),
            EVENT_JOIN | EVENT_LEAVE | EVENT_REPLY | EVENT_ERROR | EVENT_CLOSE | EVENT_HEARTBEAT
        )
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_active_nodes_frame() {
        let text = r#"{
            "topic": "nodes:lobby",
            "event": "active_nodes",
            "payload": {"nodes": [
                {"id": "n1", "type": "worker"},
                {"id": "n2", "kind": "gateway", "region": "eu-west"}
            ]},
            "ref": null
        }"#;

        let frame = FeedFrame::from_json(text).unwrap();
        assert_eq!(frame.topic, "nodes:lobby");
        assert_eq!(frame.event, EVENT_ACTIVE_NODES);
        assert!(frame.reference.is_none());

        let nodes = frame.payload.nodes.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0], RawNode::new("n1", "worker"));
        // Extra descriptor fields are ignored.
        assert_eq!(nodes[1], RawNode::new("n2", "gateway"));
    }

    #[test]
    fn test_missing_id_still_decodes() {
        let text = r#"{"topic":"t","event":"active_nodes","payload":{"nodes":[{"kind":"x"}]}}"#;
        let frame = FeedFrame::from_json(text).unwrap();
        let nodes = frame.payload.nodes.unwrap();
        assert_eq!(nodes[0].id, None);
        assert_eq!(nodes[0].kind.as_deref(), Some("x"));
    }

    #[test]
    fn test_reply_payload_ignored_fields() {
        let text = r#"{"topic":"t","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#;
        let frame = FeedFrame::from_json(text).unwrap();
        assert!(frame.is_control());
        assert_eq!(frame.payload, FramePayload::default());
        assert_eq!(frame.reference.as_deref(), Some("1"));
    }

    #[test]
    fn test_missing_payload_defaults() {
        let frame = FeedFrame::from_json(r#"{"topic":"phoenix","event":"heartbeat"}"#).unwrap();
        assert_eq!(frame.payload, FramePayload::default());
        assert!(frame.is_control());
    }

    #[test]
    fn test_join_frame_json_shape() {
        let frame = FeedFrame::join("nodes:lobby", 1);
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["topic"], "nodes:lobby");
        assert_eq!(value["event"], "phx_join");
        assert_eq!(value["ref"], "1");
    }

    #[test]
    fn test_binary_frame() {
        let frame = FeedFrame::active_nodes(
            "nodes:lobby",
            vec![
                RawNode::new("a", "db"),
                RawNode {
                    id: None,
                    kind: Some("x".into()),
                    ..RawNode::default()
                },
            ],
        );
        let bytes = frame.encode().unwrap();
        assert_eq!(FeedFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(FeedFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_decode_invalid_json() {
        let err = FeedFrame::from_json("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::DeserializationError(_)));
    }

    #[test]
    fn test_non_string_id_is_recorded() {
        let text = r#"{"topic":"t","event":"active_nodes","payload":{"nodes":[{"id":7,"kind":"x"},{"id":"b","type":true}]}}"#;
        let frame = FeedFrame::from_json(text).unwrap();
        let nodes = frame.payload.nodes.unwrap();

        assert_eq!(nodes[0].id, None);
        assert_eq!(
            nodes[0].type_error,
            Some(FieldTypeError { field: "id", found: "number" })
        );
        assert_eq!(nodes[1].id.as_deref(), Some("b"));
        assert_eq!(
            nodes[1].type_error,
            Some(FieldTypeError { field: "kind", found: "boolean" })
        );
    }

    #[test]
    fn test_null_id_is_absent_not_wrong_type() {
        let text = r#"{"topic":"t","event":"active_nodes","payload":{"nodes":[{"id":null,"kind":"x"}]}}"#;
        let nodes = FeedFrame::from_json(text).unwrap().payload.nodes.unwrap();
        assert_eq!(nodes[0].id, None);
        assert_eq!(nodes[0].type_error, None);
    }

    #[test]
    fn test_single_node_payload_type_error() {
        let text = r#"{"topic":"t","event":"node_left","payload":{"id":["n1"]}}"#;
        let frame = FeedFrame::from_json(text).unwrap();
        assert_eq!(
            frame.payload.type_error,
            Some(FieldTypeError { field: "id", found: "array" })
        );
    }

    #[test]
    fn test_non_object_descriptor_is_decode_error() {
        let text = r#"{"topic":"t","event":"active_nodes","payload":{"nodes":[7]}}"#;
        assert!(FeedFrame::from_json(text).is_err());
    }

    #[test]
    fn test_control_events() {
        assert!(FeedFrame::heartbeat(3).is_control());
        assert!(FeedFrame::leave("t", 4).is_control());
        assert!(!FeedFrame::active_nodes("t", vec![]).is_control());
        assert!(!FeedFrame::node_left("t", "n1").is_control());
    }
}
