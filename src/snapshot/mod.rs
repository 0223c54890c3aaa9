pub mod acharya_badrinath;
pub mod alagar_venkatesan;
pub mod coordinated;
pub mod output;

pub use acharya_badrinath::*;
pub use alagar_venkatesan::*;
pub use coordinated::*;
pub use output::*;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::{
    common::error::Error,
    network::{
        message::{Envelope, Message},
        node::{Availability, Node, NodeId},
    },
};

/// A global snapshot protocol attached to one `NodeRuntime`.
///
/// Every call happens with the runtime's lock held, so implementations own
/// their state outright and never synchronize internally.
pub trait Snapshot: Send {
    fn kind(&self) -> SnapshotKind;

    /// Whether `try_send` may move tokens while this node is snapshotting.
    fn allow_transfer_during_snapshot(&self) -> bool;

    /// True while any instance still has local work to finish.
    fn is_active(&self) -> bool;

    /// Starts a local recording. Calling it again while one is active is a no-op.
    fn initiate(&mut self, ctx: &mut SnapshotContext<'_>);

    /// Reacts to a control message, or to a TRANSFER before it is credited.
    fn handle_message(&mut self, ctx: &mut SnapshotContext<'_>, message: &Message);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
#[serde(try_from = "String")]
pub enum SnapshotKind {
    AcharyaBadrinath,
    AlagarVenkatesan,
    CoordinatedCheckpoint,
}

impl SnapshotKind {
    pub fn build(self) -> Box<dyn Snapshot> {
        match self {
            SnapshotKind::AcharyaBadrinath => Box::new(AcharyaBadrinath::new()),
            SnapshotKind::AlagarVenkatesan => Box::new(AlagarVenkatesan::new()),
            SnapshotKind::CoordinatedCheckpoint => Box::new(CoordinatedCheckpoint::new()),
        }
    }
}

impl FromStr for SnapshotKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ab" | "acharya" => Ok(SnapshotKind::AcharyaBadrinath),
            "av" | "alagar" => Ok(SnapshotKind::AlagarVenkatesan),
            "kc" | "cc" | "checkpoint" => Ok(SnapshotKind::CoordinatedCheckpoint),
            _ => Err(Error::UnknownSnapshotKind(s.to_owned())),
        }
    }
}

impl TryFrom<String> for SnapshotKind {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SnapshotKind::AcharyaBadrinath => "acharya-badrinath",
            SnapshotKind::AlagarVenkatesan => "alagar-venkatesan",
            SnapshotKind::CoordinatedCheckpoint => "coordinated-checkpoint",
        })
    }
}

/// What a snapshot may touch while the runtime lock is held: the node, the
/// node's outgoing queue and the shared output log.
pub struct SnapshotContext<'a> {
    node: &'a mut Node,
    outgoing: &'a UnboundedSender<Envelope>,
    output: &'a OutputLog,
}

impl<'a> SnapshotContext<'a> {
    pub fn new(node: &'a mut Node, outgoing: &'a UnboundedSender<Envelope>, output: &'a OutputLog) -> Self {
        SnapshotContext { node, outgoing, output }
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id
    }

    pub fn neighbors(&self) -> &BTreeSet<NodeId> {
        self.node.neighbors()
    }

    pub fn record_local_state(&self) -> u64 {
        self.node.balance()
    }

    /// Queues `message` for `to`. Queue order is delivery order.
    pub fn send(&self, to: NodeId, message: Message) -> bool {
        let sent = self.outgoing.send(Envelope { to, message }).is_ok();
        if !sent {
            warn!(node = self.node.id, to, "outgoing queue closed, message dropped");
        }
        sent
    }

    pub fn broadcast(&self, message: &Message) {
        for &neighbor in self.node.neighbors() {
            self.send(neighbor, message.clone());
        }
    }

    /// True once `tracked` covers every neighbor.
    pub fn is_complete(&self, tracked: &BTreeSet<NodeId>) -> bool {
        self.node.neighbors().is_subset(tracked)
    }

    pub fn set_recording(&mut self, active: bool) {
        self.node.set_availability(if active {
            Availability::Snapshotting
        } else {
            Availability::Available
        });
    }

    pub fn write(&self, event: SnapshotEvent) {
        self.output.append(event);
    }

    /// Writes the closed local part of a marker cut.
    pub fn write_cut(&self, round: u64, recorded: u64, channels: &BTreeMap<NodeId, u64>) {
        let node = self.node.id;
        for (&from, &total) in channels {
            self.write(SnapshotEvent::ChannelState { node, from, total });
        }
        self.write(SnapshotEvent::Complete {
            node,
            round,
            recorded,
            in_channel: channels.values().fold(0, |sum, &t| sum.saturating_add(t)),
        });
    }
}
