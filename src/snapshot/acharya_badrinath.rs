use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use super::{output::SnapshotEvent, Snapshot, SnapshotContext, SnapshotKind};
use crate::network::{
    message::{Message, MessageKind},
    node::NodeId,
};

/*
    Marker propagation with a growing "received marker from" set.

    The first marker of a round (or a local initiate) records the balance
    and floods a marker for that round to every neighbor. From then on every
    TRANSFER arriving on a channel whose marker has not been seen yet was in
    flight at the cut, so its amount is added to that channel's total. Once a
    marker has arrived from every neighbor the local part of the cut is
    closed.

    An initiator numbers its round one past the highest round it has joined.
    Markers travel in round order on every channel, so each node joins rounds
    in increasing order and a marker for an older round that is no longer
    open is stale. A neighbor may start the next round before this node has
    closed the current one; both rounds are then recorded side by side.
*/

#[derive(Debug, Default)]
struct Round {
    recorded_balance: u64,
    channel_totals: BTreeMap<NodeId, u64>,
    received_from: BTreeSet<NodeId>,
}

#[derive(Default)]
pub struct AcharyaBadrinath {
    open: BTreeMap<u64, Round>,
    last_round: u64,
}

impl AcharyaBadrinath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rounds this node has joined but not closed yet.
    pub fn open_rounds(&self) -> Vec<u64> {
        self.open.keys().copied().collect()
    }

    pub fn last_round(&self) -> u64 {
        self.last_round
    }

    pub fn channel_totals(&self, round: u64) -> Option<&BTreeMap<NodeId, u64>> {
        self.open.get(&round).map(|r| &r.channel_totals)
    }

    fn start_recording(&mut self, ctx: &mut SnapshotContext<'_>, round: u64) {
        let recorded_balance = ctx.record_local_state();
        ctx.set_recording(true);
        ctx.write(SnapshotEvent::NodeState {
            node: ctx.node_id(),
            balance: recorded_balance,
        });
        info!(node = ctx.node_id(), round, balance = recorded_balance, "recorded local state");
        ctx.broadcast(&Message::marker(ctx.node_id(), round));

        self.last_round = round;
        self.open.insert(
            round,
            Round {
                recorded_balance,
                ..Round::default()
            },
        );
    }

    fn handle_marker(&mut self, ctx: &mut SnapshotContext<'_>, message: &Message) {
        let (me, from) = (ctx.node_id(), message.sender_id);
        if !ctx.neighbors().contains(&from) {
            warn!(node = me, from, "marker from a non-neighbor, dropping");
            return;
        }
        let round = match message.round() {
            Ok(round) => round,
            Err(e) => {
                warn!(node = me, from, error = %e, "dropping marker");
                return;
            }
        };
        debug!(node = me, from, round, "received marker");

        if round > self.last_round {
            self.start_recording(ctx, round);
        }
        let Some(state) = self.open.get_mut(&round) else {
            warn!(node = me, from, round, "marker for a closed round, dropping");
            return;
        };
        if !state.received_from.insert(from) {
            warn!(node = me, from, round, "duplicate marker, dropping");
            return;
        }

        self.close_if_complete(ctx, round);
    }

    fn handle_transfer(&mut self, ctx: &SnapshotContext<'_>, message: &Message) {
        let Ok(amount) = message.amount() else {
            return;
        };
        let from = message.sender_id;
        for (&round, state) in self.open.iter_mut() {
            if state.received_from.contains(&from) {
                continue;
            }
            let total = state.channel_totals.entry(from).or_default();
            *total = total.saturating_add(amount);
            debug!(node = ctx.node_id(), from, round, amount, "recorded in-channel transfer");
        }
    }

    fn close_if_complete(&mut self, ctx: &mut SnapshotContext<'_>, round: u64) {
        if !self.open.get(&round).is_some_and(|r| ctx.is_complete(&r.received_from)) {
            return;
        }
        let Some(state) = self.open.remove(&round) else {
            return;
        };

        ctx.write_cut(round, state.recorded_balance, &state.channel_totals);
        info!(node = ctx.node_id(), round, "snapshot complete");
        if self.open.is_empty() {
            ctx.set_recording(false);
        }
    }
}

impl Snapshot for AcharyaBadrinath {
    fn kind(&self) -> SnapshotKind {
        SnapshotKind::AcharyaBadrinath
    }

    fn allow_transfer_during_snapshot(&self) -> bool {
        true
    }

    fn is_active(&self) -> bool {
        !self.open.is_empty()
    }

    fn initiate(&mut self, ctx: &mut SnapshotContext<'_>) {
        if !self.open.is_empty() {
            info!(node = ctx.node_id(), "snapshot already recording, ignoring initiate");
            return;
        }
        let Some(round) = self.last_round.checked_add(1) else {
            warn!(node = ctx.node_id(), "round numbers exhausted, ignoring initiate");
            return;
        };
        info!(node = ctx.node_id(), round, "initiating Acharya-Badrinath snapshot");
        self.start_recording(ctx, round);
        // A node without neighbors closes its cut immediately.
        self.close_if_complete(ctx, round);
    }

    fn handle_message(&mut self, ctx: &mut SnapshotContext<'_>, message: &Message) {
        match message.kind {
            MessageKind::SnapshotMarker => self.handle_marker(ctx, message),
            MessageKind::Transfer => self.handle_transfer(ctx, message),
            _ => warn!(node = ctx.node_id(), kind = %message.kind, "unexpected message for marker snapshot"),
        }
    }
}
