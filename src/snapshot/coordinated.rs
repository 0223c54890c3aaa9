use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use super::{output::SnapshotEvent, Snapshot, SnapshotContext, SnapshotKind};
use crate::network::{
    message::{Message, MessageKind},
    node::NodeId,
};

/*
    Two-phase request/ack checkpointing. Every initiator gets its own
    instance, so several checkpoints can be in progress at once.

    A node that sees a request for an initiator for the first time records
    its balance, remembers who asked (first request wins, which builds a
    spanning tree rooted at the initiator) and forwards the request to all
    other neighbors. It acks its parent once every neighbor it forwarded to
    has acked. Later requests for the same initiator leave the instance
    untouched and are answered with an ack straight away, so that cycles in
    the graph cannot leave a forwarder waiting forever.

    Only process state is recorded; in-flight transfers are not.
*/

#[derive(Clone, Debug)]
struct Instance {
    /// Neighbor whose request reached us first. None at the initiator.
    parent: Option<NodeId>,
    recorded_balance: u64,
    expected: BTreeSet<NodeId>,
    acks: BTreeSet<NodeId>,
}

impl Instance {
    fn is_acked(&self) -> bool {
        self.acks.is_superset(&self.expected)
    }
}

/// A checkpoint instance this node has finalized.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CompletedCheckpoint {
    pub initiator: NodeId,
    pub parent: Option<NodeId>,
    pub recorded_balance: u64,
}

#[derive(Default)]
pub struct CoordinatedCheckpoint {
    active: BTreeMap<NodeId, Instance>,
    completed: Vec<CompletedCheckpoint>,
}

impl CoordinatedCheckpoint {
    pub fn new() -> Self {
        CoordinatedCheckpoint {
            active: BTreeMap::new(),
            completed: Vec::new(),
        }
    }

    pub fn is_tracking(&self, initiator: NodeId) -> bool {
        self.active.contains_key(&initiator)
    }

    pub fn completed(&self) -> &[CompletedCheckpoint] {
        &self.completed
    }

    fn on_request(&mut self, ctx: &mut SnapshotContext<'_>, from: NodeId, initiator: NodeId) {
        let me = ctx.node_id();
        if self.active.contains_key(&initiator) {
            debug!(node = me, from, initiator, "duplicate checkpoint request, acking without state change");
            ctx.send(from, Message::checkpoint_ack(me, initiator));
            return;
        }
        if initiator == me {
            warn!(node = me, from, "request for a checkpoint this node is not running, dropping");
            return;
        }

        let balance = ctx.record_local_state();
        ctx.write(SnapshotEvent::CheckpointAccepted {
            node: me,
            initiator,
            from,
            balance,
        });
        info!(node = me, initiator, parent = from, balance, "checkpoint recorded");

        let children: BTreeSet<NodeId> = ctx.neighbors().iter().copied().filter(|&n| n != from).collect();
        for &child in &children {
            ctx.send(child, Message::checkpoint_request(me, initiator));
        }

        ctx.set_recording(true);
        self.active.insert(
            initiator,
            Instance {
                parent: Some(from),
                recorded_balance: balance,
                expected: children,
                acks: BTreeSet::new(),
            },
        );
        self.finalize_if_acked(ctx, initiator);
    }

    fn on_ack(&mut self, ctx: &mut SnapshotContext<'_>, from: NodeId, initiator: NodeId) {
        let me = ctx.node_id();
        let Some(instance) = self.active.get_mut(&initiator) else {
            warn!(node = me, from, initiator, "ack for no active checkpoint, dropping");
            return;
        };
        if !instance.expected.contains(&from) {
            warn!(node = me, from, initiator, "ack from a neighbor that was not asked, dropping");
            return;
        }

        instance.acks.insert(from);
        debug!(node = me, from, initiator, acks = instance.acks.len(), expected = instance.expected.len(), "checkpoint ack");
        self.finalize_if_acked(ctx, initiator);
    }

    fn finalize_if_acked(&mut self, ctx: &mut SnapshotContext<'_>, initiator: NodeId) {
        if !self.active.get(&initiator).is_some_and(Instance::is_acked) {
            return;
        }
        let Some(instance) = self.active.remove(&initiator) else {
            return;
        };

        let me = ctx.node_id();
        ctx.write(SnapshotEvent::CheckpointComplete { node: me, initiator });
        match instance.parent {
            Some(parent) => {
                ctx.send(parent, Message::checkpoint_ack(me, initiator));
            }
            None => info!(node = me, "coordinated checkpoint complete"),
        }

        self.completed.push(CompletedCheckpoint {
            initiator,
            parent: instance.parent,
            recorded_balance: instance.recorded_balance,
        });
        if self.active.is_empty() {
            ctx.set_recording(false);
        }
    }
}

impl Snapshot for CoordinatedCheckpoint {
    fn kind(&self) -> SnapshotKind {
        SnapshotKind::CoordinatedCheckpoint
    }

    fn allow_transfer_during_snapshot(&self) -> bool {
        false
    }

    fn is_active(&self) -> bool {
        !self.active.is_empty()
    }

    fn initiate(&mut self, ctx: &mut SnapshotContext<'_>) {
        let me = ctx.node_id();
        if self.active.contains_key(&me) {
            info!(node = me, "checkpoint already in progress, ignoring initiate");
            return;
        }

        let balance = ctx.record_local_state();
        ctx.write(SnapshotEvent::CheckpointStarted {
            node: me,
            initiator: me,
            balance,
        });
        info!(node = me, balance, "initiating coordinated checkpoint");

        ctx.broadcast(&Message::checkpoint_request(me, me));
        ctx.set_recording(true);
        self.active.insert(
            me,
            Instance {
                parent: None,
                recorded_balance: balance,
                expected: ctx.neighbors().clone(),
                acks: BTreeSet::new(),
            },
        );
        self.finalize_if_acked(ctx, me);
    }

    fn handle_message(&mut self, ctx: &mut SnapshotContext<'_>, message: &Message) {
        let initiator = match message.kind {
            MessageKind::Transfer => {
                debug!(node = ctx.node_id(), from = message.sender_id, "transfer not recorded by checkpointing");
                return;
            }
            MessageKind::CheckpointRequest | MessageKind::CheckpointAck => match message.initiator() {
                Ok(initiator) => initiator,
                Err(e) => {
                    warn!(node = ctx.node_id(), error = %e, "dropping checkpoint message");
                    return;
                }
            },
            _ => {
                warn!(node = ctx.node_id(), kind = %message.kind, "unexpected message for checkpointing");
                return;
            }
        };

        if message.kind == MessageKind::CheckpointRequest {
            self.on_request(ctx, message.sender_id, initiator);
        } else {
            self.on_ack(ctx, message.sender_id, initiator);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        network::{
            message::Envelope,
            node::{Availability, Node},
        },
        snapshot::output::OutputLog,
    };

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_leaf_acks_its_parent_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = OutputLog::in_memory();
        let mut leaf = Node::new(1, "127.0.0.1:5001".parse().unwrap(), 7, [0]);
        let mut snapshot = CoordinatedCheckpoint::new();

        snapshot.handle_message(&mut SnapshotContext::new(&mut leaf, &tx, &output), &Message::checkpoint_request(0, 0));

        assert_eq!(
            drain(&mut rx),
            vec![Envelope { to: 0, message: Message::checkpoint_ack(1, 0) }]
        );
        assert!(!snapshot.is_tracking(0));
        assert!(leaf.is_available());
        assert_eq!(
            snapshot.completed(),
            &[CompletedCheckpoint { initiator: 0, parent: Some(0), recorded_balance: 7 }]
        );
    }

    #[test]
    fn test_forwarder_waits_for_children() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = OutputLog::in_memory();
        let mut node = Node::new(1, "127.0.0.1:5001".parse().unwrap(), 7, [0, 2, 3]);
        let mut snapshot = CoordinatedCheckpoint::new();

        snapshot.handle_message(&mut SnapshotContext::new(&mut node, &tx, &output), &Message::checkpoint_request(0, 0));
        let forwarded: Vec<_> = drain(&mut rx).into_iter().map(|e| e.to).collect();
        assert_eq!(forwarded, vec![2, 3]);
        assert!(!node.is_available());

        // Duplicate request: answered, nothing forwarded again.
        snapshot.handle_message(&mut SnapshotContext::new(&mut node, &tx, &output), &Message::checkpoint_request(2, 0));
        assert_eq!(drain(&mut rx), vec![Envelope { to: 2, message: Message::checkpoint_ack(1, 0) }]);

        snapshot.handle_message(&mut SnapshotContext::new(&mut node, &tx, &output), &Message::checkpoint_ack(2, 0));
        assert!(drain(&mut rx).is_empty());
        snapshot.handle_message(&mut SnapshotContext::new(&mut node, &tx, &output), &Message::checkpoint_ack(3, 0));
        assert_eq!(drain(&mut rx), vec![Envelope { to: 0, message: Message::checkpoint_ack(1, 0) }]);
        assert!(node.is_available());
    }

    #[test]
    fn test_stray_and_malformed_acks_are_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = OutputLog::in_memory();
        let mut node = Node::new(0, "127.0.0.1:5000".parse().unwrap(), 7, [1]);
        let mut snapshot = CoordinatedCheckpoint::new();

        snapshot.handle_message(&mut SnapshotContext::new(&mut node, &tx, &output), &Message::checkpoint_ack(1, 4));
        snapshot.handle_message(
            &mut SnapshotContext::new(&mut node, &tx, &output),
            &Message::new(MessageKind::CheckpointAck, 1, "x"),
        );
        assert!(drain(&mut rx).is_empty());
        assert!(output.events().is_empty());
        assert!(node.is_available());
    }

    #[test]
    fn test_isolated_initiator_finalizes_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = OutputLog::in_memory();
        let mut node = Node::new(4, "127.0.0.1:5004".parse().unwrap(), 9, []);
        let mut snapshot = CoordinatedCheckpoint::new();

        snapshot.initiate(&mut SnapshotContext::new(&mut node, &tx, &output));

        assert!(drain(&mut rx).is_empty());
        assert!(!snapshot.is_active());
        assert_eq!(node.availability(), Availability::Available);
        assert_eq!(
            output.events(),
            vec![
                SnapshotEvent::CheckpointStarted { node: 4, initiator: 4, balance: 9 },
                SnapshotEvent::CheckpointComplete { node: 4, initiator: 4 },
            ]
        );
        assert_eq!(
            snapshot.completed(),
            &[CompletedCheckpoint { initiator: 4, parent: None, recorded_balance: 9 }]
        );
    }

    #[test]
    fn test_initiate_while_own_checkpoint_runs_is_a_no_op() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = OutputLog::in_memory();
        let mut node = Node::new(0, "127.0.0.1:5000".parse().unwrap(), 6, [1]);
        let mut snapshot = CoordinatedCheckpoint::new();

        snapshot.initiate(&mut SnapshotContext::new(&mut node, &tx, &output));
        snapshot.initiate(&mut SnapshotContext::new(&mut node, &tx, &output));
        assert_eq!(drain(&mut rx), vec![Envelope { to: 1, message: Message::checkpoint_request(0, 0) }]);
        assert_eq!(output.events(), vec![SnapshotEvent::CheckpointStarted { node: 0, initiator: 0, balance: 6 }]);
        assert_eq!(node.availability(), Availability::Snapshotting);

        snapshot.handle_message(&mut SnapshotContext::new(&mut node, &tx, &output), &Message::checkpoint_ack(1, 0));
        assert_eq!(node.availability(), Availability::Available);
        assert_eq!(
            output.events().last(),
            Some(&SnapshotEvent::CheckpointComplete { node: 0, initiator: 0 })
        );
        assert_eq!(snapshot.completed().len(), 1);
    }

    #[test]
    fn test_concurrent_initiators_are_tracked_separately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = OutputLog::in_memory();
        let mut node = Node::new(1, "127.0.0.1:5001".parse().unwrap(), 5, [0, 2]);
        let mut snapshot = CoordinatedCheckpoint::new();

        snapshot.initiate(&mut SnapshotContext::new(&mut node, &tx, &output));
        snapshot.handle_message(&mut SnapshotContext::new(&mut node, &tx, &output), &Message::checkpoint_request(0, 0));
        assert!(snapshot.is_tracking(1));
        assert!(snapshot.is_tracking(0));
        drain(&mut rx);

        // Own instance finishes; the flag stays up for initiator 0.
        snapshot.handle_message(&mut SnapshotContext::new(&mut node, &tx, &output), &Message::checkpoint_ack(0, 1));
        snapshot.handle_message(&mut SnapshotContext::new(&mut node, &tx, &output), &Message::checkpoint_ack(2, 1));
        assert!(!snapshot.is_tracking(1));
        assert!(!node.is_available());
        assert!(drain(&mut rx).is_empty());

        snapshot.handle_message(&mut SnapshotContext::new(&mut node, &tx, &output), &Message::checkpoint_ack(2, 0));
        assert!(node.is_available());
        assert_eq!(drain(&mut rx), vec![Envelope { to: 0, message: Message::checkpoint_ack(1, 0) }]);
        assert_eq!(snapshot.completed().len(), 2);
    }
}
