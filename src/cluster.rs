use std::{collections::BTreeMap, time::Duration};

use tracing::{info, info_span, warn, Instrument};

use crate::{
    common::{
        config::{ClusterConfig, Command},
        error::{Error, Result},
    },
    network::{node::NodeId, runtime::NodeRuntime},
    snapshot::OutputLog,
};

/// Builds one node from the descriptor, attaches the configured snapshot
/// algorithm and starts its listener and links.
pub async fn spawn_node(config: &ClusterConfig, id: NodeId, output: OutputLog) -> Result<NodeRuntime> {
    let node = config.build_node(id)?;
    let runtime = NodeRuntime::new(node, config.neighbor_addresses(id)?, output);
    runtime.attach(config.snapshot_type.build());
    runtime.start().await?;
    Ok(runtime)
}

/// Every node of a descriptor running inside one process.
pub struct Cluster {
    runtimes: BTreeMap<NodeId, NodeRuntime>,
}

impl Cluster {
    /// Starts all nodes. Listeners are bound before this returns, so a
    /// script can start sending immediately.
    pub async fn launch(config: &ClusterConfig, output: OutputLog) -> Result<Self> {
        let mut runtimes = BTreeMap::new();
        for node in &config.node_list {
            let runtime = spawn_node(config, node.id, output.clone())
                .instrument(info_span!("launch", node = node.id))
                .await?;
            runtimes.insert(node.id, runtime);
        }
        info!(nodes = runtimes.len(), kind = %config.snapshot_type, "cluster running");
        Ok(Cluster { runtimes })
    }

    pub fn runtime(&self, id: NodeId) -> Result<&NodeRuntime> {
        self.runtimes.get(&id).ok_or(Error::UnknownNode(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.runtimes.keys().copied()
    }

    /// Runs script commands in order, sleeping `pause` after each one.
    /// A refused transfer is logged and the script goes on.
    pub async fn execute(&self, commands: &[Command], pause: Duration) -> Result<()> {
        for command in commands {
            match *command {
                Command::Send { from, to, amount } => {
                    if !self.runtime(from)?.try_send(to, amount) {
                        warn!(from, to, amount, "scripted transfer refused");
                    }
                }
                Command::Snapshot { initiator } => {
                    info!(initiator, "scripted snapshot");
                    self.runtime(initiator)?.start_snapshot();
                }
                Command::Wait(duration) => tokio::time::sleep(duration).await,
            }
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
        Ok(())
    }

    pub fn balances(&self) -> BTreeMap<NodeId, u64> {
        self.runtimes.iter().map(|(&id, runtime)| (id, runtime.balance())).collect()
    }

    /// Tokens currently held by nodes. Excludes anything still in flight.
    pub fn total(&self) -> u64 {
        self.runtimes.values().map(NodeRuntime::balance).sum()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::{common::config::parse_script, snapshot::SnapshotEvent};

    async fn free_ports(n: usize) -> Vec<u16> {
        let mut listeners = Vec::new();
        for _ in 0..n {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        listeners.iter().map(|l| l.local_addr().unwrap().port()).collect()
    }

    async fn triangle(kind: &str) -> ClusterConfig {
        let ports = free_ports(3).await;
        ClusterConfig::from_json(&format!(
            r#"{{
                "snapshotType": "{kind}",
                "nodeList": [
                    {{ "id": 0, "port": {}, "bitcake": 10, "neighbors": [1, 2] }},
                    {{ "id": 1, "port": {}, "bitcake": 10, "neighbors": [0, 2] }},
                    {{ "id": 2, "port": {}, "bitcake": 10, "neighbors": [0, 1] }}
                ]
            }}"#,
            ports[0], ports[1], ports[2]
        ))
        .unwrap()
    }

    async fn settle(cluster: &Cluster, output: &OutputLog, completes: usize, total: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = output
                    .events()
                    .iter()
                    .filter(|e| matches!(e, SnapshotEvent::Complete { .. } | SnapshotEvent::CheckpointComplete { .. }))
                    .count();
                if done >= completes && cluster.total() == total {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cluster did not settle");
    }

    #[tokio::test]
    async fn test_scripted_marker_snapshot_is_consistent() {
        for kind in ["ab", "av"] {
            let config = triangle(kind).await;
            let output = OutputLog::in_memory();
            let cluster = Cluster::launch(&config, output.clone()).await.unwrap();

            let script = parse_script("send 0 1 4\nsend 1 2 7\nsnapshot 0\nsend 2 0 3\nsend 1 0 2").unwrap();
            cluster.execute(&script, Duration::ZERO).await.unwrap();
            settle(&cluster, &output, 3, 30).await;

            let recorded: u64 = output
                .events()
                .iter()
                .map(|e| match e {
                    SnapshotEvent::NodeState { balance, .. } => *balance,
                    SnapshotEvent::ChannelState { total, .. } => *total,
                    _ => 0,
                })
                .sum();
            assert_eq!(recorded, 30, "{kind}");
        }
    }

    #[tokio::test]
    async fn test_scripted_checkpoint_completes_everywhere() {
        let config = triangle("kc").await;
        let output = OutputLog::in_memory();
        let cluster = Cluster::launch(&config, output.clone()).await.unwrap();

        let script = parse_script("snapshot 2").unwrap();
        cluster.execute(&script, Duration::ZERO).await.unwrap();
        settle(&cluster, &output, 3, 30).await;

        let mut completed: Vec<NodeId> = output
            .events()
            .iter()
            .filter_map(|e| match e {
                SnapshotEvent::CheckpointComplete { node, initiator: 2 } => Some(*node),
                _ => None,
            })
            .collect();
        completed.sort_unstable();
        assert_eq!(completed, vec![0, 1, 2]);
        assert_eq!(cluster.balances().values().sum::<u64>(), 30);
    }

    #[tokio::test]
    async fn test_script_with_unknown_node_fails() {
        let config = triangle("ab").await;
        let cluster = Cluster::launch(&config, OutputLog::in_memory()).await.unwrap();
        let script = parse_script("snapshot 9").unwrap();
        assert!(matches!(
            cluster.execute(&script, Duration::ZERO).await,
            Err(Error::UnknownNode(9))
        ));
        assert_eq!(cluster.ids().collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
