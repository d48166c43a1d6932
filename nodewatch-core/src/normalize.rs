//! Feed frames → typed [`PresenceEvent`]s.
//!
//! Validation is all-or-nothing: one bad descriptor rejects the whole
//! payload, so a partially corrupt membership view never reaches the store.

use thiserror::Error;

use crate::presence::{Node, NodeId, PresenceEvent};
use crate::protocol::{
    FeedFrame, FieldTypeError, FramePayload, ProtocolError, RawNode, EVENT_ACTIVE_NODES,
    EVENT_NODE_JOINED, EVENT_NODE_LEFT,
};

/// Normalizer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// A required field is missing, empty or not a string. `index` is the
    /// position of the offending descriptor, when the payload is a list.
    #[error("Malformed payload{}: {reason}", at_node(.index))]
    MalformedPayload { index: Option<usize>, reason: String },
    /// The frame carries an event name this feed contract does not define.
    #[error("Unknown feed event: {0}")]
    UnknownEvent(String),
    /// The frame text or bytes could not be decoded.
    #[error("Undecodable frame: {0}")]
    Decode(#[from] ProtocolError),
}

fn at_node(index: &Option<usize>) -> String {
    index.map(|i| format!(" at node {i}")).unwrap_or_default()
}

impl NormalizeError {
    fn malformed(index: Option<usize>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            index,
            reason: reason.into(),
        }
    }

    fn wrong_type(index: Option<usize>, err: &FieldTypeError) -> Self {
        Self::malformed(index, format!("`{}` must be a string, found {}", err.field, err.found))
    }
}

fn required(value: Option<&str>, index: Option<usize>, field: &str) -> Result<String, NormalizeError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        Some(_) => Err(NormalizeError::malformed(index, format!("empty `{field}`"))),
        None => Err(NormalizeError::malformed(index, format!("missing `{field}`"))),
    }
}

fn to_node(raw: &RawNode, index: Option<usize>) -> Result<Node, NormalizeError> {
    if let Some(err) = &raw.type_error {
        return Err(NormalizeError::wrong_type(index, err));
    }
    let id = required(raw.id.as_deref(), index, "id")?;
    let kind = required(raw.kind.as_deref(), index, "kind")?;
    Ok(Node::new(id, kind))
}

/// Turn an ordered list of descriptors into a `ReplaceActiveSet` event.
///
/// Feed order is preserved, duplicates included; the store resolves them.
pub fn normalize_nodes(nodes: &[RawNode]) -> Result<PresenceEvent, NormalizeError> {
    let nodes = nodes
        .iter()
        .enumerate()
        .map(|(i, raw)| to_node(raw, Some(i)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PresenceEvent::ReplaceActiveSet { nodes })
}

fn normalize_active_nodes(payload: &FramePayload) -> Result<PresenceEvent, NormalizeError> {
    match &payload.nodes {
        Some(nodes) => normalize_nodes(nodes),
        None => Err(NormalizeError::malformed(None, "missing `nodes` list")),
    }
}

fn normalize_joined(payload: &FramePayload) -> Result<PresenceEvent, NormalizeError> {
    let raw = RawNode {
        id: payload.id.clone(),
        kind: payload.kind.clone(),
        type_error: payload.type_error.clone(),
    };
    Ok(PresenceEvent::NodeJoined(to_node(&raw, None)?))
}

fn normalize_left(payload: &FramePayload) -> Result<PresenceEvent, NormalizeError> {
    // Only `id` matters here; a stray `kind` is ignored.
    if let Some(err) = payload.type_error.as_ref().filter(|e| e.field == "id") {
        return Err(NormalizeError::wrong_type(None, err));
    }
    let id = required(payload.id.as_deref(), None, "id")?;
    Ok(PresenceEvent::NodeLeft(NodeId::new(id)))
}

/// Route a frame by event name.
///
/// Returns `Ok(None)` for channel housekeeping frames (replies, heartbeats,
/// close notices) that carry no membership information.
pub fn normalize_frame(frame: &FeedFrame) -> Result<Option<PresenceEvent>, NormalizeError> {
    if frame.is_control() {
        return Ok(None);
    }
    let event = match frame.event.as_str() {
        EVENT_ACTIVE_NODES => normalize_active_nodes(&frame.payload)?,
        EVENT_NODE_JOINED => normalize_joined(&frame.payload)?,
        EVENT_NODE_LEFT => normalize_left(&frame.payload)?,
        other => return Err(NormalizeError::UnknownEvent(other.to_string())),
    };
    Ok(Some(event))
}

/// Decode a JSON text frame and normalize it.
pub fn normalize_text(text: &str) -> Result<Option<PresenceEvent>, NormalizeError> {
    let frame = FeedFrame::from_json(text)?;
    normalize_frame(&frame)
}
