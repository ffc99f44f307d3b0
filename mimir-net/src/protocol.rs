//! Wire protocol for the state-mirror stream.
//!
//! Control-plane messages are JSON arrays tagged by their first
//! element. Server-to-client messages arrive batched: one text frame
//! holds an array of message arrays, applied strictly in order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use mimir_types::{EnumRow, ObjectId, TypeDecodeError, ValueType};

/// Identifier correlating a client request with the server's `done`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure to interpret one incoming message. The message is logged and
/// dropped; the batch and the connection continue.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message tag {0:?}")]
    UnknownTag(String),
    #[error("unknown object id {0}")]
    UnknownId(ObjectId),
    #[error("object {0} is not writable")]
    NotWritable(ObjectId),
    #[error("unexpected payload for object {id}: {reason}")]
    BadPayload { id: ObjectId, reason: String },
    #[error("bad binary frame: {0}")]
    BadFrame(String),
    #[error("unmatched request id {0}")]
    UnmatchedRequest(RequestId),
    #[error(transparent)]
    Type(#[from] TypeDecodeError),
}

/// Decoded `register_cell` payload.
#[derive(Debug, Clone)]
pub struct CellDescriptor {
    /// True for command cells (invoked, not valued).
    pub command: bool,
    pub value_type: ValueType,
    /// Human-readable naming metadata (label, description, sort key).
    pub naming: EnumRow,
    /// Whether the server considers the value part of persistent state.
    pub persists: bool,
    pub writable: bool,
    /// Value at registration time, when the server knows one.
    pub current: Option<Value>,
}

impl CellDescriptor {
    pub fn parse(descriptor: &Value) -> Result<Self, ProtocolError> {
        let fields = descriptor
            .as_object()
            .ok_or_else(|| ProtocolError::Malformed(format!("cell descriptor: {descriptor}")))?;
        let command = match fields.get("type").and_then(Value::as_str) {
            Some("value_cell") => false,
            Some("command_cell") => true,
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "cell descriptor kind: {other:?}"
                )))
            }
        };

        let metadata = match fields.get("metadata") {
            Some(Value::Object(m)) => m,
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "cell metadata: {other:?}"
                )))
            }
        };
        let value_type = ValueType::decode(metadata.get("value_type").unwrap_or(&Value::Null))?;
        let naming = EnumRow::from_descriptor("", metadata.get("naming").unwrap_or(&Value::Null))
            .map_err(ProtocolError::Type)?;
        let persists = metadata
            .get("persists")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        Ok(Self {
            command,
            value_type,
            naming,
            persists,
            writable: fields.get("writable").and_then(Value::as_bool).unwrap_or(false),
            current: fields.get("current").cloned(),
        })
    }
}

/// One server-to-client control message.
#[derive(Debug, Clone)]
pub enum ServerMsg {
    RegisterBlock {
        id: ObjectId,
        url: String,
        interfaces: Vec<String>,
    },
    RegisterCell {
        id: ObjectId,
        url: String,
        descriptor: CellDescriptor,
    },
    Value {
        id: ObjectId,
        payload: Value,
    },
    Delete {
        id: ObjectId,
    },
    Done {
        request_id: RequestId,
    },
}

impl ServerMsg {
    /// Parse one element of a message batch.
    pub fn parse(raw: &Value) -> Result<Self, ProtocolError> {
        let parts = raw
            .as_array()
            .ok_or_else(|| ProtocolError::Malformed(format!("message is not an array: {raw}")))?;
        let tag = parts
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed(format!("missing message tag: {raw}")))?;

        match tag {
            "register_block" => {
                let (id, url) = id_and_url(parts)?;
                let interfaces = match parts.get(3) {
                    Some(Value::Array(tags)) => tags
                        .iter()
                        .map(|t| {
                            t.as_str().map(str::to_string).ok_or_else(|| {
                                ProtocolError::Malformed(format!("interface tag: {t}"))
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    None => Vec::new(),
                    Some(other) => {
                        return Err(ProtocolError::Malformed(format!(
                            "interface tags: {other}"
                        )))
                    }
                };
                Ok(ServerMsg::RegisterBlock { id, url, interfaces })
            }
            "register_cell" => {
                let (id, url) = id_and_url(parts)?;
                let descriptor = CellDescriptor::parse(parts.get(3).unwrap_or(&Value::Null))?;
                Ok(ServerMsg::RegisterCell { id, url, descriptor })
            }
            "value" => Ok(ServerMsg::Value {
                id: object_id(parts.get(1))?,
                payload: parts.get(2).cloned().unwrap_or(Value::Null),
            }),
            "delete" => Ok(ServerMsg::Delete {
                id: object_id(parts.get(1))?,
            }),
            "done" => {
                let id = parts.get(1).and_then(Value::as_u64).ok_or_else(|| {
                    ProtocolError::Malformed(format!("done request id: {raw}"))
                })?;
                Ok(ServerMsg::Done {
                    request_id: RequestId::new(id),
                })
            }
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

fn object_id(v: Option<&Value>) -> Result<ObjectId, ProtocolError> {
    v.and_then(Value::as_u64)
        .map(ObjectId::new)
        .ok_or_else(|| ProtocolError::Malformed(format!("object id: {v:?}")))
}

fn id_and_url(parts: &[Value]) -> Result<(ObjectId, String), ProtocolError> {
    let id = object_id(parts.get(1))?;
    let url = parts
        .get(2)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed(format!("url for object {id}")))?
        .to_string();
    Ok((id, url))
}

/// Split one incoming text frame into its ordered message batch.
pub fn parse_batch(text: &str) -> Result<Vec<Value>, ProtocolError> {
    let batch: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::Malformed(format!("batch JSON: {e}")))?;
    match batch {
        Value::Array(messages) => Ok(messages),
        other => Err(ProtocolError::Malformed(format!(
            "batch is not an array: {other}"
        ))),
    }
}

/// One client-to-server control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    /// Write a value to a writable cell, or trigger a command cell
    /// (value null).
    Set {
        id: ObjectId,
        value: Value,
        request_id: RequestId,
    },
    /// Ask a writable collection to create a member.
    Create {
        id: ObjectId,
        description: Value,
        request_id: RequestId,
    },
    /// Ask a writable collection to delete a member.
    DeleteMember {
        id: ObjectId,
        key: String,
        request_id: RequestId,
    },
}

impl ClientMsg {
    pub fn request_id(&self) -> RequestId {
        match self {
            ClientMsg::Set { request_id, .. }
            | ClientMsg::Create { request_id, .. }
            | ClientMsg::DeleteMember { request_id, .. } => *request_id,
        }
    }

    /// Encode as one outgoing text frame.
    pub fn encode(&self) -> String {
        let array = match self {
            ClientMsg::Set {
                id,
                value,
                request_id,
            } => serde_json::json!(["set", id, value, request_id]),
            ClientMsg::Create {
                id,
                description,
                request_id,
            } => serde_json::json!(["create", id, description, request_id]),
            ClientMsg::DeleteMember {
                id,
                key,
                request_id,
            } => serde_json::json!(["delete_member", id, key, request_id]),
        };
        array.to_string()
    }
}
