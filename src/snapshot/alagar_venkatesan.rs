use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use super::{output::SnapshotEvent, Snapshot, SnapshotContext, SnapshotKind};
use crate::network::{
    message::{Message, MessageKind},
    node::NodeId,
};

/// Local part of a cut that is still being recorded.
#[derive(Debug)]
struct Recording {
    balance: u64,
    /// Neighbors whose marker has not arrived yet.
    expecting: BTreeSet<NodeId>,
    in_channel: BTreeMap<NodeId, u64>,
}

/// Marker snapshot that tracks the neighbors it is still waiting on. The
/// cut closes when that set drains.
///
/// Rounds are numbered and may overlap: a marker for a round newer than any
/// this node has joined opens a second recording next to the current one.
#[derive(Default)]
pub struct AlagarVenkatesan {
    recordings: BTreeMap<u64, Recording>,
    last_round: u64,
}

impl AlagarVenkatesan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expecting(&self, round: u64) -> Option<&BTreeSet<NodeId>> {
        self.recordings.get(&round).map(|r| &r.expecting)
    }

    fn begin(&mut self, ctx: &mut SnapshotContext<'_>, round: u64) {
        let balance = ctx.record_local_state();
        ctx.set_recording(true);
        ctx.write(SnapshotEvent::NodeState {
            node: ctx.node_id(),
            balance,
        });
        info!(node = ctx.node_id(), round, balance, "recorded local state");
        ctx.broadcast(&Message::marker(ctx.node_id(), round));

        self.last_round = round;
        self.recordings.insert(
            round,
            Recording {
                balance,
                expecting: ctx.neighbors().clone(),
                in_channel: BTreeMap::new(),
            },
        );
    }

    fn on_marker(&mut self, ctx: &mut SnapshotContext<'_>, message: &Message) {
        let (me, from) = (ctx.node_id(), message.sender_id);
        if !ctx.neighbors().contains(&from) {
            warn!(node = me, from, "marker from a non-neighbor, dropping");
            return;
        }
        let Ok(round) = message.round() else {
            warn!(node = me, from, payload = %message.payload, "marker without a round, dropping");
            return;
        };
        debug!(node = me, from, round, "received marker");

        if round > self.last_round {
            self.begin(ctx, round);
        }
        let Some(recording) = self.recordings.get_mut(&round) else {
            warn!(node = me, from, round, "marker for a finished round, dropping");
            return;
        };
        if !recording.expecting.remove(&from) {
            warn!(node = me, from, round, "marker from a channel that is not pending, dropping");
            return;
        }

        self.finish_if_drained(ctx, round);
    }

    fn on_transfer(&mut self, ctx: &SnapshotContext<'_>, message: &Message) {
        let Ok(amount) = message.amount() else {
            return;
        };
        let from = message.sender_id;
        for (&round, recording) in self.recordings.iter_mut() {
            if recording.expecting.contains(&from) {
                let total = recording.in_channel.entry(from).or_default();
                *total = total.saturating_add(amount);
                debug!(node = ctx.node_id(), from, round, amount, "recorded in-channel transfer");
            }
        }
    }

    fn finish_if_drained(&mut self, ctx: &mut SnapshotContext<'_>, round: u64) {
        if !self.recordings.get(&round).is_some_and(|r| r.expecting.is_empty()) {
            return;
        }
        if let Some(done) = self.recordings.remove(&round) {
            ctx.write_cut(round, done.balance, &done.in_channel);
            info!(node = ctx.node_id(), round, "snapshot complete");
        }
        if self.recordings.is_empty() {
            ctx.set_recording(false);
        }
    }
}

impl Snapshot for AlagarVenkatesan {
    fn kind(&self) -> SnapshotKind {
        SnapshotKind::AlagarVenkatesan
    }

    fn allow_transfer_during_snapshot(&self) -> bool {
        true
    }

    fn is_active(&self) -> bool {
        !self.recordings.is_empty()
    }

    fn initiate(&mut self, ctx: &mut SnapshotContext<'_>) {
        if self.is_active() {
            info!(node = ctx.node_id(), "snapshot already recording, ignoring initiate");
            return;
        }
        let Some(round) = self.last_round.checked_add(1) else {
            warn!(node = ctx.node_id(), "round numbers exhausted, ignoring initiate");
            return;
        };
        info!(node = ctx.node_id(), round, "initiating Alagar-Venkatesan snapshot");
        self.begin(ctx, round);
        self.finish_if_drained(ctx, round);
    }

    fn handle_message(&mut self, ctx: &mut SnapshotContext<'_>, message: &Message) {
        match message.kind {
            MessageKind::SnapshotMarker => self.on_marker(ctx, message),
            MessageKind::Transfer => self.on_transfer(ctx, message),
            _ => warn!(node = ctx.node_id(), kind = %message.kind, "unexpected message for marker snapshot"),
        }
    }
}
