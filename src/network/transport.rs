use std::{collections::HashMap, net::SocketAddr};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{
    message::{Envelope, Message},
    node::NodeId,
    runtime::NodeRuntime,
};
use crate::common::error::Result;

/*
    Channels must be FIFO per sender/receiver pair: every marker rule
    assumes that what arrives after a marker was sent after it.

    Sending side: the runtime queues envelopes in state-change order, the
    outbox fans them out to one link per destination, and each link writes
    them in order on a single persistent stream.

    Receiving side: one task per accepted connection reads frames in order
    and dispatches each before reading the next.
*/

pub struct Listener {
    inner: TcpListener,
    runtime: NodeRuntime,
}

impl Listener {
    pub async fn bind(runtime: NodeRuntime, address: SocketAddr) -> Result<Self> {
        let inner = TcpListener::bind(address).await?;
        Ok(Listener { inner, runtime })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(self) {
        let node = self.runtime.id();
        loop {
            match self.inner.accept().await {
                Ok((stream, peer)) => {
                    let runtime = self.runtime.clone();
                    let span = debug_span!("connection", node, %peer);
                    tokio::spawn(handle_connection(runtime, stream).instrument(span));
                }
                Err(e) => warn!(node, error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_connection(runtime: NodeRuntime, stream: TcpStream) {
    let mut frames = BufReader::new(stream).lines();
    loop {
        match frames.next_line().await {
            Ok(Some(frame)) if frame.trim().is_empty() => continue,
            Ok(Some(frame)) => match Message::decode(&frame) {
                Ok(message) => runtime.dispatch(message),
                Err(e) => {
                    warn!(error = %e, "undecodable frame, closing connection");
                    return;
                }
            },
            Ok(None) => {
                debug!("peer closed connection");
                return;
            }
            Err(e) => {
                warn!(error = %e, "read failed, closing connection");
                return;
            }
        }
    }
}

/// Routes a runtime's outgoing queue to one ordered link per neighbor.
pub struct Outbox {
    node: NodeId,
    links: HashMap<NodeId, UnboundedSender<Message>>,
}

impl Outbox {
    /// Spawns a link task for every neighbor address.
    pub fn new(node: NodeId, neighbor_addrs: &HashMap<NodeId, SocketAddr>) -> Self {
        let links = neighbor_addrs
            .iter()
            .map(|(&to, &address)| {
                let (tx, rx) = mpsc::unbounded_channel();
                let link = Link {
                    from: node,
                    to,
                    address,
                    stream: None,
                };
                tokio::spawn(link.run(rx));
                (to, tx)
            })
            .collect();
        Outbox { node, links }
    }

    pub async fn run(self, mut queue: UnboundedReceiver<Envelope>) {
        while let Some(envelope) = queue.recv().await {
            self.route(envelope);
        }
        info!(node = self.node, "outgoing queue closed");
    }

    fn route(&self, envelope: Envelope) {
        let Envelope { to, message } = envelope;
        match self.links.get(&to) {
            Some(link) => {
                if link.send(message).is_err() {
                    warn!(node = self.node, to, "link to neighbor is gone, message dropped");
                }
            }
            None => warn!(node = self.node, to, %message, "no address for destination, message dropped"),
        }
    }
}

struct Link {
    from: NodeId,
    to: NodeId,
    address: SocketAddr,
    stream: Option<TcpStream>,
}

impl Link {
    async fn run(mut self, mut rx: UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            match self.deliver(&message).await {
                Ok(()) => debug!(node = self.from, to = self.to, %message, "sent"),
                Err(e) => {
                    warn!(node = self.from, to = self.to, address = %self.address, error = %e, %message, "send failed")
                }
            }
        }
    }

    async fn deliver(&mut self, message: &Message) -> Result<()> {
        let frame = message.encode()?;
        // A failed write drops the stream; the next message reconnects.
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect(self.address).await?;
                stream.set_nodelay(true)?;
                stream
            }
        };
        stream.write_all(&frame).await?;
        self.stream = Some(stream);
        Ok(())
    }
}
