use std::io;

use thiserror::Error;

use crate::network::node::NodeId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed {kind} payload: {payload:?}")]
    MalformedPayload { kind: &'static str, payload: String },
    #[error("node {0} is declared more than once")]
    DuplicateNode(NodeId),
    #[error("node {node} lists unknown neighbor {neighbor}")]
    UnknownNeighbor { node: NodeId, neighbor: NodeId },
    #[error("node {0} lists itself as a neighbor")]
    SelfNeighbor(NodeId),
    #[error("no node with id {0}")]
    UnknownNode(NodeId),
    #[error("unknown snapshot type: {0}")]
    UnknownSnapshotKind(String),
    #[error("script line {line}: {reason}")]
    Script { line: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
