use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use super::{
    message::{Envelope, Message, MessageKind},
    node::{Availability, Node, NodeId},
    transport::{Listener, Outbox},
};
use crate::{
    common::error::Result,
    snapshot::{OutputLog, Snapshot, SnapshotContext},
};

/*
    A node actor. Everything that mutates the node or its attached
    snapshot runs inside one critical section guarded by `core`, whether it
    comes from the local driver (try_send, start_snapshot) or from any of
    the connection handlers calling dispatch.

    Outgoing messages are queued while the lock is still held, so the queue
    order matches the order in which the node changed state. The transport
    keeps that order per destination.
*/

struct NodeCore {
    node: Node,
    snapshot: Option<Box<dyn Snapshot>>,
}

struct Shared {
    id: NodeId,
    address: SocketAddr,
    neighbor_addrs: HashMap<NodeId, SocketAddr>,
    core: Mutex<NodeCore>,
    outgoing: UnboundedSender<Envelope>,
    outbox: Mutex<Option<UnboundedReceiver<Envelope>>>,
    output: OutputLog,
}

/// Cloneable handle to one node's runtime.
#[derive(Clone)]
pub struct NodeRuntime {
    shared: Arc<Shared>,
}

impl NodeRuntime {
    pub fn new(node: Node, neighbor_addrs: HashMap<NodeId, SocketAddr>, output: OutputLog) -> Self {
        let (outgoing, outbox) = mpsc::unbounded_channel();
        NodeRuntime {
            shared: Arc::new(Shared {
                id: node.id,
                address: node.address,
                neighbor_addrs,
                core: Mutex::new(NodeCore { node, snapshot: None }),
                outgoing,
                outbox: Mutex::new(Some(outbox)),
                output,
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    pub fn attach(&self, snapshot: Box<dyn Snapshot>) {
        info!(node = self.id(), kind = %snapshot.kind(), "attached snapshot algorithm");
        self.lock().snapshot = Some(snapshot);
    }

    /// Binds the listener and starts delivering queued messages to
    /// neighbors. Returns the address actually bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = Listener::bind(self.clone(), self.shared.address).await?;
        let bound = listener.local_addr()?;
        tokio::spawn(listener.run());

        match self.take_outbox() {
            Some(queue) => {
                let outbox = Outbox::new(self.id(), &self.shared.neighbor_addrs);
                tokio::spawn(outbox.run(queue));
            }
            None => warn!(node = self.id(), "outgoing queue already taken, not starting sender"),
        }

        info!(node = self.id(), %bound, "node started");
        Ok(bound)
    }

    /// Hands out the queue of messages this node emits. Available once;
    /// `start` takes it to feed the transport.
    pub fn take_outbox(&self) -> Option<UnboundedReceiver<Envelope>> {
        self.shared.outbox.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn balance(&self) -> u64 {
        self.lock().node.balance()
    }

    pub fn availability(&self) -> Availability {
        self.lock().node.availability()
    }

    pub fn try_send(&self, to: NodeId, amount: u64) -> bool {
        let mut core = self.lock();
        let NodeCore { node, snapshot } = &mut *core;

        if !node.is_neighbor(to) {
            warn!(node = node.id, to, "cannot send: not a neighbor");
            return false;
        }
        if snapshot.as_ref().is_some_and(|s| s.is_active() && !s.allow_transfer_during_snapshot()) {
            warn!(node = node.id, to, "cannot send while snapshotting");
            return false;
        }
        if !node.debit(amount) {
            warn!(node = node.id, to, amount, balance = node.balance(), "not enough bitcakes");
            return false;
        }

        let envelope = Envelope {
            to,
            message: Message::transfer(node.id, amount),
        };
        if self.shared.outgoing.send(envelope).is_err() {
            node.credit(amount);
            warn!(node = node.id, to, "outgoing queue closed, transfer cancelled");
            return false;
        }

        info!(node = node.id, to, amount, "sent bitcakes");
        true
    }

    /// Credits `amount` from `from`, showing it to the attached snapshot first.
    pub fn receive(&self, amount: u64, from: NodeId) {
        let mut core = self.lock();
        self.receive_locked(&mut core, amount, from);
    }

    pub fn dispatch(&self, message: Message) {
        debug!(node = self.id(), %message, "dispatching");
        let mut core = self.lock();

        match message.kind {
            MessageKind::Transfer => {
                if !core.node.is_neighbor(message.sender_id) {
                    warn!(node = self.id(), from = message.sender_id, "transfer from a non-neighbor, dropping");
                    return;
                }
                match message.amount() {
                    Ok(amount) => self.receive_locked(&mut core, amount, message.sender_id),
                    Err(e) => warn!(node = self.id(), error = %e, "dropping transfer"),
                }
            }
            ref kind if kind.is_control() => {
                let NodeCore { node, snapshot } = &mut *core;
                match snapshot {
                    Some(snapshot) => {
                        let mut ctx = SnapshotContext::new(node, &self.shared.outgoing, &self.shared.output);
                        snapshot.handle_message(&mut ctx, &message);
                    }
                    None => warn!(node = self.id(), %message, "no snapshot attached, dropping"),
                }
            }
            ref kind => warn!(node = self.id(), %kind, "unknown message kind, dropping"),
        }
    }

    pub fn start_snapshot(&self) {
        let mut core = self.lock();
        let NodeCore { node, snapshot } = &mut *core;
        match snapshot {
            Some(snapshot) => {
                let mut ctx = SnapshotContext::new(node, &self.shared.outgoing, &self.shared.output);
                snapshot.initiate(&mut ctx);
            }
            None => info!(node = self.id(), "no snapshot algorithm attached"),
        }
    }

    fn receive_locked(&self, core: &mut NodeCore, amount: u64, from: NodeId) {
        let NodeCore { node, snapshot } = core;
        if node.balance().checked_add(amount).is_none() {
            warn!(node = node.id, from, amount, balance = node.balance(), "transfer would overflow balance, dropping");
            return;
        }
        if let Some(snapshot) = snapshot {
            let mut ctx = SnapshotContext::new(node, &self.shared.outgoing, &self.shared.output);
            snapshot.handle_message(&mut ctx, &Message::transfer(from, amount));
        }
        node.credit(amount);
        info!(node = node.id, from, amount, balance = node.balance(), "received bitcakes");
    }

    fn lock(&self) -> MutexGuard<'_, NodeCore> {
        self.shared.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
