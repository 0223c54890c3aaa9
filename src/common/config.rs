use std::{
    collections::{HashMap, HashSet},
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use super::error::{Error, Result};
use crate::{
    network::node::{Node, NodeId},
    snapshot::SnapshotKind,
};

pub const DEFAULT_OUTPUT_PATH: &str = "output/output.txt";

/// Node-graph descriptor.
///
/// ```json
/// {
///   "snapshotType": "ab",
///   "nodeList": [
///     { "id": 0, "port": 5000, "bitcake": 10, "neighbors": [1] },
///     { "id": 1, "port": 5001, "bitcake": 10, "neighbors": [0] }
///   ]
/// }
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub snapshot_type: SnapshotKind,
    pub node_list: Vec<NodeConfig>,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    #[serde(default = "default_host")]
    pub host: IpAddr,
    pub port: u16,
    pub bitcake: u64,
    #[serde(default)]
    pub neighbors: Vec<NodeId>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

impl NodeConfig {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: ClusterConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.node_list {
            if !ids.insert(node.id) {
                return Err(Error::DuplicateNode(node.id));
            }
        }
        for node in &self.node_list {
            for &neighbor in &node.neighbors {
                if neighbor == node.id {
                    return Err(Error::SelfNeighbor(node.id));
                }
                if !ids.contains(&neighbor) {
                    return Err(Error::UnknownNeighbor { node: node.id, neighbor });
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeConfig> {
        self.node_list
            .iter()
            .find(|n| n.id == id)
            .ok_or(Error::UnknownNode(id))
    }

    pub fn build_node(&self, id: NodeId) -> Result<Node> {
        let cfg = self.node(id)?;
        Ok(Node::new(cfg.id, cfg.address(), cfg.bitcake, cfg.neighbors.iter().copied()))
    }

    pub fn neighbor_addresses(&self, id: NodeId) -> Result<HashMap<NodeId, SocketAddr>> {
        self.node(id)?
            .neighbors
            .iter()
            .map(|&neighbor| Ok((neighbor, self.node(neighbor)?.address())))
            .collect()
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_PATH))
    }

    pub fn total_balance(&self) -> u64 {
        self.node_list.iter().map(|n| n.bitcake).sum()
    }
}

/// One line of an instruction script.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command {
    Send { from: NodeId, to: NodeId, amount: u64 },
    Snapshot { initiator: NodeId },
    Wait(Duration),
}

/// Parses `send <from> <to> <amount>`, `snapshot <initiator>` and
/// `wait <millis>` lines. Blank lines and `#` comments are skipped.
pub fn parse_script(text: &str) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let script_error = |reason: &str| Error::Script {
            line: index + 1,
            reason: reason.to_owned(),
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        let number = |i: usize| -> Result<u64> {
            parts
                .get(i)
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| script_error(&format!("expected a number in position {i}")))
        };
        let id = |i: usize| -> Result<NodeId> {
            parts
                .get(i)
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| script_error(&format!("expected a node id in position {i}")))
        };

        let command = match (parts[0].to_ascii_lowercase().as_str(), parts.len()) {
            ("send", 4) => Command::Send {
                from: id(1)?,
                to: id(2)?,
                amount: number(3)?,
            },
            ("snapshot", 2) => Command::Snapshot { initiator: id(1)? },
            ("wait", 2) => Command::Wait(Duration::from_millis(number(1)?)),
            ("send" | "snapshot" | "wait", _) => return Err(script_error("wrong number of arguments")),
            (other, _) => return Err(script_error(&format!("unknown command {other:?}"))),
        };
        commands.push(command);
    }
    Ok(commands)
}

pub fn load_script(path: impl AsRef<Path>) -> Result<Vec<Command>> {
    parse_script(&fs::read_to_string(path)?)
}
