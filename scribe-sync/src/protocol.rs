//! Wire types exchanged over the transport.
//!
//! Edit operations travel as JSON so that browser peers running the same
//! editor can read them directly:
//!
//! ```text
//! {
//!   "originId":    "7f0c…",        stable per session, survives reconnects
//!   "operationId": "a41e…",        unique per edit, used for de-duplication
//!   "revision":    12,             author's local revision after the edit
//!   "delta":       {"ops":[…]}
//! }
//! ```
//!
//! Channel layout per document:
//!
//! | Channel | Carries |
//! |---------|---------|
//! | `text-change:{doc}` | [`EditOperation`]s |
//! | `cursor:{doc}` | presence entries |
//! | `Document:History:{doc}` | checkpoints |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

use crate::delta::{Delta, DeltaError};

/// Opaque document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel carrying edit operations for this document.
    pub fn edit_channel(&self) -> String {
        format!("text-change:{}", self.0)
    }

    /// Presence channel for cursors in this document.
    pub fn presence_channel(&self) -> String {
        format!("cursor:{}", self.0)
    }

    /// Stream name the history store files checkpoints under.
    pub fn history_channel(&self) -> String {
        format!("Document:History:{}", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Logical identity of a session, independent of the transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginId(Uuid);

impl OriginId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OriginId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identity of one published edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection-scoped participant identifier assigned by the transport.
///
/// Changes whenever the underlying connection is re-established.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A delta tagged with the identity of the session that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOperation {
    pub origin_id: OriginId,
    pub operation_id: OperationId,
    #[serde(default)]
    pub revision: u64,
    pub delta: Delta,
}

impl EditOperation {
    pub fn new(origin_id: OriginId, revision: u64, delta: Delta) -> Self {
        Self {
            origin_id,
            operation_id: OperationId::new(),
            revision,
            delta,
        }
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize and structurally validate an incoming operation.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let op: Self = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        op.delta.validate()?;
        Ok(op)
    }
}

/// Ephemeral key/value state a participant broadcasts (cursor, name, ...).
pub type PresenceState = Map<String, Value>;

/// One participant's presence in a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub participant_id: ParticipantId,
    #[serde(default)]
    pub state: PresenceState,
    /// Milliseconds since the Unix epoch of the last change.
    #[serde(default)]
    pub updated_at: u64,
}

impl PresenceEntry {
    pub fn new(participant_id: ParticipantId, state: PresenceState) -> Self {
        Self {
            participant_id,
            state,
            updated_at: now_millis(),
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidDelta(DeltaError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidDelta(e) => write!(f, "Invalid delta: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DeltaError> for ProtocolError {
    fn from(e: DeltaError) -> Self {
        ProtocolError::InvalidDelta(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edit_operation_wire_shape() {
        let origin = OriginId::new();
        let op = EditOperation::new(origin, 1, Delta::new().insert("hello"));
        let value: Value = serde_json::from_slice(&op.encode().unwrap()).unwrap();

        assert_eq!(value["originId"], json!(origin.as_uuid().to_string()));
        assert_eq!(value["revision"], json!(1));
        assert_eq!(value["delta"], json!({"ops": [{"insert": "hello"}]}));
        assert!(value["operationId"].is_string());
    }

    #[test]
    fn test_edit_operation_decode() {
        let op = EditOperation::new(OriginId::new(), 3, Delta::new().retain(2).delete(1));
        let decoded = EditOperation::decode(&op.encode().unwrap()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            EditOperation::decode(b"not json"),
            Err(ProtocolError::DeserializationError(_))
        ));
        assert!(EditOperation::decode(br#"{"delta": {"ops": []}}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_zero_length_ops() {
        let raw = json!({
            "originId": Uuid::new_v4().to_string(),
            "operationId": Uuid::new_v4().to_string(),
            "delta": {"ops": [{"retain": 0}]}
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        assert!(matches!(
            EditOperation::decode(&bytes),
            Err(ProtocolError::InvalidDelta(DeltaError::EmptyOp { index: 0 }))
        ));
    }

    #[test]
    fn test_revision_defaults_when_missing() {
        let raw = json!({
            "originId": Uuid::new_v4().to_string(),
            "operationId": Uuid::new_v4().to_string(),
            "delta": {"ops": [{"insert": "x"}]}
        });
        let decoded = EditOperation::decode(&serde_json::to_vec(&raw).unwrap()).unwrap();
        assert_eq!(decoded.revision, 0);
    }

    #[test]
    fn test_operation_ids_are_unique() {
        let origin = OriginId::new();
        let a = EditOperation::new(origin, 1, Delta::new().insert("a"));
        let b = EditOperation::new(origin, 1, Delta::new().insert("a"));
        assert_ne!(a.operation_id, b.operation_id);
    }

    #[test]
    fn test_channel_names() {
        let doc = DocumentId::new("doc-1");
        assert_eq!(doc.edit_channel(), "text-change:doc-1");
        assert_eq!(doc.presence_channel(), "cursor:doc-1");
        assert_eq!(doc.history_channel(), "Document:History:doc-1");
    }

    #[test]
    fn test_presence_entry_json() {
        let mut state = PresenceState::new();
        state.insert("x".into(), json!(10));
        let entry = PresenceEntry {
            participant_id: ParticipantId::new("conn-1"),
            state,
            updated_at: 42,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            value,
            json!({"participantId": "conn-1", "state": {"x": 10}, "updatedAt": 42})
        );
    }
}
