//! Wire protocol for record synchronization.
//!
//! Every message is a JSON object tagged by a `type` field and carried in a
//! single binary WebSocket frame:
//! ```text
//! client ──► server   {"type":"add","text":"b"}
//!                     {"type":"update","id":"<uuid>","text":"z"}
//!                     {"type":"delete","id":"<uuid>"}
//!
//! server ──► client   {"type":"snapshot","records":[{"id":"<uuid>","text":"a"}]}
//!                     {"type":"added","record":{..}}
//!                     {"type":"updated","record":{..}}
//!                     {"type":"deleted","record":{..}}
//! ```
//!
//! Non-snapshot notifications always carry the full post-mutation record,
//! so each one can be applied without replaying history.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A single entry in the shared list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub text: String,
}

impl Record {
    pub fn new(id: Uuid, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }
}

/// Client → server mutation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    Add { text: String },
    Update { id: Uuid, text: String },
    Delete { id: Uuid },
}

impl Intent {
    pub fn add(text: impl Into<String>) -> Self {
        Self::Add { text: text.into() }
    }

    pub fn update(id: Uuid, text: impl Into<String>) -> Self {
        Self::Update {
            id,
            text: text.into(),
        }
    }

    pub fn delete(id: Uuid) -> Self {
        Self::Delete { id }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Server → client change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Full ordered contents of the store.
    Snapshot { records: Vec<Record> },
    Added { record: Record },
    Updated { record: Record },
    Deleted { record: Record },
}

impl Notification {
    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// The record a non-snapshot notification refers to.
    pub fn record(&self) -> Option<&Record> {
        match self {
            Self::Snapshot { .. } => None,
            Self::Added { record } | Self::Updated { record } | Self::Deleted { record } => {
                Some(record)
            }
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::Added { .. } => "added",
            Self::Updated { .. } => "updated",
            Self::Deleted { .. } => "deleted",
        }
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(msg).map_err(ProtocolError::Encode)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
}

/// Codec errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Deserialization error: {0}")]
    Decode(#[source] serde_json::Error),
    /// A frame of the wrong kind arrived (e.g. text where binary is required).
    #[error("Unexpected {0} frame")]
    UnexpectedFrame(&'static str),
}
