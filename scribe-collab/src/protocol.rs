//! JSON event protocol spoken over the WebSocket.
//!
//! Every text frame is an envelope:
//! ```text
//! { "name": "<event>", "data": <payload> }
//! ```
//!
//! | Direction | name         | data                                   |
//! |-----------|--------------|----------------------------------------|
//! | C → S     | `join`       | `{"username": string}`                 |
//! | C → S     | `op`         | `[revision, ops, selection?]`          |
//! | C → S     | `sel`        | `{"ranges": [...]}`                    |
//! | S → C     | `doc`        | `{document, revision, clients}`        |
//! | S → C     | `registered` | client id                              |
//! | S → C     | `ok`         | `null`                                 |
//! | S → C     | `join`       | `{client_id, username}`                |
//! | S → C     | `quit`       | client id                              |
//! | S → C     | `op`         | `[client_id, ops, selection \| null]`  |
//! | S → C     | `sel`        | `[client_id, selection]`               |
//! | S → C     | `error`      | `{"message": string}`                  |
//!
//! Operations travel in their compact array form (positive = retain,
//! negative = delete, string = insert). Operation lengths are measured in the
//! server's text encoding, so decoding needs to know it.

use std::collections::HashMap;

use scribe_core::{Client, ClientId, Operation, OtError, Selection, TextEncoding};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Raw `{name, data}` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Snapshot sent to every connection before anything else.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocSnapshot {
    pub document: String,
    pub revision: usize,
    pub clients: HashMap<ClientId, Client>,
}

/// Events a client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Join { username: String },
    /// `revision` is kept signed so that a negative claim can be rejected
    /// as an invalid revision rather than a malformed frame. The operation's
    /// meta carries the optional selection.
    Operation { revision: i64, operation: Operation },
    Selection(Selection),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join { .. } => "join",
            ClientEvent::Operation { .. } => "op",
            ClientEvent::Selection(_) => "sel",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = match self {
            ClientEvent::Join { username } => json!({ "username": username }),
            ClientEvent::Operation {
                revision,
                operation,
            } => {
                let mut data = vec![json!(revision), Value::Array(operation.marshal())];
                if let Some(selection) = operation.meta() {
                    data.push(selection.marshal());
                }
                Value::Array(data)
            }
            ClientEvent::Selection(selection) => selection.marshal(),
        };
        Envelope::new(self.name(), data).encode()
    }

    /// Parse a frame, measuring operation lengths in `encoding`.
    pub fn decode(text: &str, encoding: TextEncoding) -> Result<Self, ProtocolError> {
        let Envelope { name, data } = Envelope::decode(text)?;
        match name.as_str() {
            "join" => {
                let username = data
                    .get("username")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProtocolError::malformed("join", "missing 'username'"))?;
                Ok(ClientEvent::Join {
                    username: username.to_owned(),
                })
            }
            "op" => {
                let parts = data
                    .as_array()
                    .ok_or_else(|| ProtocolError::malformed("op", "expected an array"))?;
                if !(2..=3).contains(&parts.len()) {
                    return Err(ProtocolError::malformed(
                        "op",
                        format!("expected 2 or 3 elements, got {}", parts.len()),
                    ));
                }
                let revision = parts[0]
                    .as_i64()
                    .ok_or_else(|| ProtocolError::malformed("op", "revision must be an integer"))?;
                let ops = parts[1]
                    .as_array()
                    .ok_or_else(|| ProtocolError::malformed("op", "ops must be an array"))?;
                let mut operation = Operation::unmarshal_with(ops, encoding)?;
                if let Some(selection) = parts.get(2).filter(|v| !v.is_null()) {
                    operation.set_meta(Some(Selection::unmarshal(selection)?));
                }
                Ok(ClientEvent::Operation {
                    revision,
                    operation,
                })
            }
            "sel" => Ok(ClientEvent::Selection(Selection::unmarshal(&data)?)),
            _ => Err(ProtocolError::UnknownEvent(name)),
        }
    }
}

/// Events the server sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Doc(DocSnapshot),
    Registered(ClientId),
    Ok,
    Join { client_id: ClientId, username: String },
    Quit(ClientId),
    /// A committed operation; its meta is the author's rebased selection.
    Operation { client_id: ClientId, operation: Operation },
    Selection { client_id: ClientId, selection: Selection },
    Error { message: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Doc(_) => "doc",
            ServerEvent::Registered(_) => "registered",
            ServerEvent::Ok => "ok",
            ServerEvent::Join { .. } => "join",
            ServerEvent::Quit(_) => "quit",
            ServerEvent::Operation { .. } => "op",
            ServerEvent::Selection { .. } => "sel",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn error(err: &impl std::fmt::Display) -> Self {
        ServerEvent::Error {
            message: err.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = match self {
            ServerEvent::Doc(snapshot) => serde_json::to_value(snapshot)
                .map_err(|e| ProtocolError::SerializationError(e.to_string()))?,
            ServerEvent::Registered(client_id) | ServerEvent::Quit(client_id) => {
                json!(client_id)
            }
            ServerEvent::Ok => Value::Null,
            ServerEvent::Join {
                client_id,
                username,
            } => json!({ "client_id": client_id, "username": username }),
            ServerEvent::Operation {
                client_id,
                operation,
            } => json!([
                client_id,
                operation.marshal(),
                operation.meta().map(Selection::marshal),
            ]),
            ServerEvent::Selection {
                client_id,
                selection,
            } => json!([client_id, selection.marshal()]),
            ServerEvent::Error { message } => json!({ "message": message }),
        };
        Envelope::new(self.name(), data).encode()
    }

    pub fn decode(text: &str, encoding: TextEncoding) -> Result<Self, ProtocolError> {
        let Envelope { name, data } = Envelope::decode(text)?;
        let event = match name.as_str() {
            "doc" => ServerEvent::Doc(
                serde_json::from_value(data)
                    .map_err(|e| ProtocolError::malformed("doc", e.to_string()))?,
            ),
            "registered" => ServerEvent::Registered(client_id("registered", &data)?),
            "ok" => ServerEvent::Ok,
            "join" => ServerEvent::Join {
                client_id: client_id("join", &data["client_id"])?,
                username: data["username"]
                    .as_str()
                    .ok_or_else(|| ProtocolError::malformed("join", "missing 'username'"))?
                    .to_owned(),
            },
            "quit" => ServerEvent::Quit(client_id("quit", &data)?),
            "op" => {
                let ops = data[1]
                    .as_array()
                    .ok_or_else(|| ProtocolError::malformed("op", "ops must be an array"))?;
                let mut operation = Operation::unmarshal_with(ops, encoding)?;
                if !data[2].is_null() {
                    operation.set_meta(Some(Selection::unmarshal(&data[2])?));
                }
                ServerEvent::Operation {
                    client_id: client_id("op", &data[0])?,
                    operation,
                }
            }
            "sel" => ServerEvent::Selection {
                client_id: client_id("sel", &data[0])?,
                selection: Selection::unmarshal(&data[1])?,
            },
            "error" => ServerEvent::Error {
                message: data["message"].as_str().unwrap_or_default().to_owned(),
            },
            _ => return Err(ProtocolError::UnknownEvent(name)),
        };
        Ok(event)
    }
}

fn client_id(event: &'static str, value: &Value) -> Result<ClientId, ProtocolError> {
    value
        .as_str()
        .and_then(|s| ClientId::parse_str(s).ok())
        .ok_or_else(|| ProtocolError::malformed(event, "invalid client id"))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("malformed '{event}' event: {reason}")]
    Malformed { event: &'static str, reason: String },
    #[error("'{0}' is not allowed before joining")]
    NotJoined(&'static str),
    #[error("acknowledgement received with no operation in flight")]
    UnexpectedAck,
    #[error("room is full ({0} peers)")]
    RoomFull(usize),
    #[error("room is unavailable")]
    RoomUnavailable,
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Ot(#[from] OtError),
}

impl ProtocolError {
    pub(crate) fn malformed(event: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            event,
            reason: reason.into(),
        }
    }
}
