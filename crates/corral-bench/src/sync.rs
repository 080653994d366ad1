//! Push benchmark binaries to every node, skipping unchanged copies.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

use corral_common::util::sha256_hex;
use corral_common::Node;
use corral_exec::{remote_path, Dispatcher, Transport, TransportError, WriteOptions};

const HASH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Unchanged,
    Transferred,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSync {
    pub node: String,
    pub ip: IpAddr,
    pub binary: String,
    pub outcome: SyncOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub entries: Vec<NodeSync>,
}

impl SyncReport {
    pub fn ok(&self) -> bool {
        self.entries
            .iter()
            .all(|e| !matches!(e.outcome, SyncOutcome::Failed { .. }))
    }

    pub fn failed(&self) -> Vec<&NodeSync> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, SyncOutcome::Failed { .. }))
            .collect()
    }

    pub fn transferred(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome == SyncOutcome::Transferred)
            .count()
    }
}

struct LocalBinary {
    path: String,
    bytes: Vec<u8>,
    checksum: String,
}

/// Copy each binary to the same path on every node. A binary missing locally
/// is an error for the whole sync; a node failing is recorded and the rest
/// carry on.
pub async fn sync_binaries(dispatcher: &Dispatcher, binaries: &[String], nodes: &[Node]) -> anyhow::Result<SyncReport> {
    let mut local = Vec::with_capacity(binaries.len());
    for path in binaries {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading benchmark binary {path}"))?;
        local.push(LocalBinary {
            path: path.clone(),
            checksum: sha256_hex(&bytes),
            bytes,
        });
    }
    let local = Arc::new(local);
    let transport = dispatcher.transport().clone();

    let per_node = dispatcher
        .for_each_node(nodes, |node| {
            let transport = transport.clone();
            let local = local.clone();
            async move {
                let mut entries = Vec::with_capacity(local.len());
                for bin in local.iter() {
                    let outcome = match sync_one(transport.as_ref(), &node, bin).await {
                        Ok(o) => o,
                        Err(e) => {
                            warn!(node=%node.ip, binary=%bin.path, error=%e, "sync failed");
                            SyncOutcome::Failed { reason: e.to_string() }
                        }
                    };
                    entries.push(NodeSync {
                        node: node.hostname.clone(),
                        ip: node.ip,
                        binary: bin.path.clone(),
                        outcome,
                    });
                }
                entries
            }
        })
        .await;

    let report = SyncReport {
        entries: per_node.into_iter().flatten().collect(),
    };
    info!(
        binaries = binaries.len(),
        nodes = nodes.len(),
        transferred = report.transferred(),
        failed = report.failed().len(),
        "sync finished"
    );
    Ok(report)
}

async fn remote_checksum(transport: &dyn Transport, node: &Node, path: &str) -> Result<Option<String>, TransportError> {
    let out = transport
        .exec(node, &format!("sha256sum {}", remote_path(path)), HASH_TIMEOUT)
        .await?;
    if !out.success() {
        return Ok(None);
    }
    Ok(out.stdout.split_whitespace().next().map(|s| s.to_string()))
}

async fn sync_one(transport: &dyn Transport, node: &Node, bin: &LocalBinary) -> Result<SyncOutcome, TransportError> {
    if remote_checksum(transport, node, &bin.path).await?.as_deref() == Some(bin.checksum.as_str()) {
        return Ok(SyncOutcome::Unchanged);
    }
    transport
        .write_file(node, &bin.path, &bin.bytes, WriteOptions::mode(0o755))
        .await?;
    match remote_checksum(transport, node, &bin.path).await? {
        Some(sum) if sum == bin.checksum => Ok(SyncOutcome::Transferred),
        other => Ok(SyncOutcome::Failed {
            reason: format!(
                "checksum after transfer is {}, expected {}",
                other.as_deref().unwrap_or("missing"),
                bin.checksum
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use corral_common::{ClusterTopology, NodeSpec, TopologyInput};
    use corral_exec::{DispatchOptions, MemoryCluster};

    fn topology() -> ClusterTopology {
        let spec = |ip: &str, name: &str| NodeSpec {
            ip: ip.parse().unwrap(),
            name: name.into(),
            os_hint: None,
            cpus: Some(2),
            extra_addresses: vec![],
        };
        TopologyInput {
            master: spec("10.0.0.1", "a"),
            workers: vec![spec("10.0.0.2", "b"), spec("10.0.0.3", "c")],
            username: "hpc".into(),
        }
        .build(&HashMap::new())
        .unwrap()
    }

    fn local_binary(tag: &str, contents: &[u8]) -> String {
        let path = std::env::temp_dir().join(format!("corral-sync-{tag}-{}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_skips_unchanged_and_isolates_failures() {
        let topo = topology();
        let cluster = MemoryCluster::from_topology(&topo);
        let bin = local_binary("skip", b"\x7fELF fake benchmark");
        cluster
            .update(topo.master.ip, |s| {
                s.files.insert(bin.clone(), b"\x7fELF fake benchmark".to_vec());
            })
            .await;
        cluster.update(topo.workers[1].ip, |s| s.reachable = false).await;

        let dispatcher = Dispatcher::per_node(Arc::new(cluster.clone()), DispatchOptions::default());
        let report = sync_binaries(&dispatcher, &[bin.clone()], &topo.all_nodes()).await.unwrap();

        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.entries[0].outcome, SyncOutcome::Unchanged);
        assert_eq!(report.entries[1].outcome, SyncOutcome::Transferred);
        assert!(matches!(report.entries[2].outcome, SyncOutcome::Failed { .. }));
        assert!(!report.ok());

        let b = cluster.snapshot(topo.workers[0].ip).await.unwrap();
        assert_eq!(b.files.get(&bin).unwrap(), b"\x7fELF fake benchmark");

        // second pass moves nothing
        cluster.update(topo.workers[1].ip, |s| s.reachable = true).await;
        sync_binaries(&dispatcher, &[bin.clone()], &topo.all_nodes()).await.unwrap();
        let again = sync_binaries(&dispatcher, &[bin], &topo.all_nodes()).await.unwrap();
        assert!(again.ok());
        assert_eq!(again.transferred(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_copy_is_reported() {
        let topo = topology();
        let cluster = MemoryCluster::from_topology(&topo);
        cluster.update(topo.workers[0].ip, |s| s.corrupt_writes = 1).await;
        let bin = local_binary("corrupt", b"payload");
        let dispatcher = Dispatcher::per_node(Arc::new(cluster), DispatchOptions::default());
        let report = sync_binaries(&dispatcher, &[bin], &topo.all_nodes()).await.unwrap();
        assert_eq!(report.failed().len(), 1);
        assert_eq!(report.failed()[0].ip, topo.workers[0].ip);
    }

    #[tokio::test]
    async fn test_missing_local_binary_is_an_error() {
        let topo = topology();
        let dispatcher = Dispatcher::per_node(
            Arc::new(MemoryCluster::from_topology(&topo)),
            DispatchOptions::default(),
        );
        let missing = "/nonexistent/corral/bench".to_string();
        assert!(sync_binaries(&dispatcher, &[missing], &topo.all_nodes()).await.is_err());
    }
}
