use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::warn;

use crate::{common::error::Result, network::node::NodeId};

/// One line of the snapshot output log.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SnapshotEvent {
    NodeState { node: NodeId, balance: u64 },
    ChannelState { node: NodeId, from: NodeId, total: u64 },
    Complete { node: NodeId, round: u64, recorded: u64, in_channel: u64 },
    CheckpointStarted { node: NodeId, initiator: NodeId, balance: u64 },
    CheckpointAccepted { node: NodeId, initiator: NodeId, from: NodeId, balance: u64 },
    CheckpointComplete { node: NodeId, initiator: NodeId },
}

impl fmt::Display for SnapshotEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotEvent::NodeState { node, balance } => {
                write!(f, "SNAPSHOT NODE_STATE: Node {node} | Bitcakes: {balance}")
            }
            SnapshotEvent::ChannelState { node, from, total } => {
                write!(f, "CHANNEL_STATE at Node {node} from Node {from}: {total} bitcakes")
            }
            SnapshotEvent::Complete { node, round, recorded, in_channel } => write!(
                f,
                "SNAPSHOT COMPLETE: Node {node} | round {round} | recorded {recorded} | in-channel {in_channel}"
            ),
            SnapshotEvent::CheckpointStarted { node, initiator, balance } => {
                write!(f, "CHECKPOINT STARTED: Node {node} | initiator {initiator} | Bitcakes: {balance}")
            }
            SnapshotEvent::CheckpointAccepted { node, initiator, from, balance } => write!(
                f,
                "CHECKPOINT ACCEPTED: Node {node} | initiator {initiator} | from {from} | Bitcakes: {balance}"
            ),
            SnapshotEvent::CheckpointComplete { node, initiator } => {
                write!(f, "CHECKPOINT COMPLETE: Node {node} | initiator {initiator}")
            }
        }
    }
}

enum Sink {
    File(File),
    Memory(Vec<SnapshotEvent>),
}

/// Process-wide, append-only snapshot log shared by every runtime.
///
/// Each append takes the sink lock for exactly one line, so lines written by
/// concurrently running nodes never interleave.
#[derive(Clone)]
pub struct OutputLog {
    sink: Arc<Mutex<Sink>>,
}

impl OutputLog {
    /// Opens `path` for appending, creating it and its parent directory if needed.
    pub fn file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(OutputLog {
            sink: Arc::new(Mutex::new(Sink::File(file))),
        })
    }

    pub fn in_memory() -> Self {
        OutputLog {
            sink: Arc::new(Mutex::new(Sink::Memory(Vec::new()))),
        }
    }

    pub fn append(&self, event: SnapshotEvent) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *sink {
            Sink::File(file) => {
                if let Err(e) = writeln!(file, "{event}") {
                    warn!(error = %e, line = %event, "failed to append to snapshot output");
                }
            }
            Sink::Memory(events) => events.push(event),
        }
    }

    /// Everything appended so far. Always empty for a file-backed log.
    pub fn events(&self) -> Vec<SnapshotEvent> {
        match &*self.sink.lock().unwrap_or_else(PoisonError::into_inner) {
            Sink::File(_) => Vec::new(),
            Sink::Memory(events) => events.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_event_lines() {
        let line = SnapshotEvent::NodeState { node: 1, balance: 14 }.to_string();
        assert_eq!(line, "SNAPSHOT NODE_STATE: Node 1 | Bitcakes: 14");
        let line = SnapshotEvent::ChannelState { node: 0, from: 2, total: 3 }.to_string();
        assert_eq!(line, "CHANNEL_STATE at Node 0 from Node 2: 3 bitcakes");
        let line = SnapshotEvent::Complete { node: 2, round: 4, recorded: 7, in_channel: 3 }.to_string();
        assert_eq!(line, "SNAPSHOT COMPLETE: Node 2 | round 4 | recorded 7 | in-channel 3");
    }

    #[test]
    fn test_file_log_appends_whole_lines() {
        let path = std::env::temp_dir()
            .join(format!("token-snapshot-{}", std::process::id()))
            .join("output.txt");
        let _ = fs::remove_file(&path);

        let log = OutputLog::file(&path).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|node| {
                let log = log.clone();
                thread::spawn(move || {
                    for balance in 0..25 {
                        log.append(SnapshotEvent::NodeState { node, balance });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 100);
        assert!(text.lines().all(|l| l.starts_with("SNAPSHOT NODE_STATE: Node ")));

        // A second handle appends rather than truncating.
        OutputLog::file(&path)
            .unwrap()
            .append(SnapshotEvent::CheckpointComplete { node: 0, initiator: 0 });
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 101);
        let _ = fs::remove_file(&path);
    }
}
