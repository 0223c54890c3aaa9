use std::fmt;

use serde::{Deserialize, Serialize};

use super::node::NodeId;
use crate::common::error::{Error, Result};

/*
    The wire unit for both application transfers and control traffic.
    Payload is algorithm-specific text: the amount for TRANSFER, the
    initiator id for checkpoint control messages, the round number for
    markers.
    On the wire every message is one JSON object terminated by a newline.
*/

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Transfer,
    SnapshotMarker,
    CheckpointRequest,
    CheckpointAck,
    Unknown(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Transfer => "TRANSFER",
            MessageKind::SnapshotMarker => "SNAPSHOT_MARKER",
            MessageKind::CheckpointRequest => "CHECKPOINT_REQUEST",
            MessageKind::CheckpointAck => "CHECKPOINT_ACK",
            MessageKind::Unknown(tag) => tag,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageKind::SnapshotMarker | MessageKind::CheckpointRequest | MessageKind::CheckpointAck
        )
    }
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "TRANSFER" => MessageKind::Transfer,
            "SNAPSHOT_MARKER" => MessageKind::SnapshotMarker,
            "CHECKPOINT_REQUEST" => MessageKind::CheckpointRequest,
            "CHECKPOINT_ACK" => MessageKind::CheckpointAck,
            _ => MessageKind::Unknown(tag),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    #[serde(rename = "senderId")]
    pub sender_id: NodeId,
    pub payload: String,
}

impl Message {
    pub fn new(kind: MessageKind, sender_id: NodeId, payload: impl Into<String>) -> Self {
        Message {
            kind,
            sender_id,
            payload: payload.into(),
        }
    }

    pub fn transfer(sender_id: NodeId, amount: u64) -> Self {
        Message::new(MessageKind::Transfer, sender_id, amount.to_string())
    }

    pub fn marker(sender_id: NodeId, round: u64) -> Self {
        Message::new(MessageKind::SnapshotMarker, sender_id, round.to_string())
    }

    pub fn checkpoint_request(sender_id: NodeId, initiator: NodeId) -> Self {
        Message::new(MessageKind::CheckpointRequest, sender_id, initiator.to_string())
    }

    pub fn checkpoint_ack(sender_id: NodeId, initiator: NodeId) -> Self {
        Message::new(MessageKind::CheckpointAck, sender_id, initiator.to_string())
    }

    /// Transferred amount carried by a TRANSFER payload.
    pub fn amount(&self) -> Result<u64> {
        self.payload.trim().parse().map_err(|_| Error::MalformedPayload {
            kind: "amount",
            payload: self.payload.clone(),
        })
    }

    /// Initiator id carried by a checkpoint control payload.
    pub fn initiator(&self) -> Result<NodeId> {
        self.payload.trim().parse().map_err(|_| Error::MalformedPayload {
            kind: "initiator",
            payload: self.payload.clone(),
        })
    }

    /// Snapshot round carried by a marker payload.
    pub fn round(&self) -> Result<u64> {
        self.payload.trim().parse().map_err(|_| Error::MalformedPayload {
            kind: "round",
            payload: self.payload.clone(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(b'\n');
        Ok(buf)
    }

    pub fn decode(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame.trim_end())?)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] from Node {}: {}", self.kind, self.sender_id, self.payload)
    }
}

/// A message addressed to one neighbor, as produced by a runtime.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Envelope {
    pub to: NodeId,
    pub message: Message,
}
