//! Write-then-verify distribution of rendered artifacts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use corral_common::util::sha256_hex;
use corral_common::{ClusterError, ClusterTopology, Node};
use corral_exec::{Dispatcher, Transport, TransportError, WriteOptions};

use crate::template::{merge_managed_block, render, TemplateArtifact, TemplateContext, TemplateId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeployOutcome {
    /// Checksum matched on the first transfer.
    Verified,
    /// Matched after the single re-send.
    Repaired,
    /// Still mismatched after the re-send.
    Degraded { error: ClusterError },
    Failed { reason: String },
}

impl DeployOutcome {
    pub fn ok(&self) -> bool {
        matches!(self, DeployOutcome::Verified | DeployOutcome::Repaired)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeDeploy {
    pub node: String,
    pub ip: IpAddr,
    pub checksum: String,
    pub outcome: DeployOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub template: TemplateId,
    pub target_path: String,
    pub nodes: Vec<NodeDeploy>,
}

impl DeployReport {
    pub fn ok(&self) -> bool {
        self.nodes.iter().all(|n| n.outcome.ok())
    }

    pub fn failed_nodes(&self) -> Vec<&NodeDeploy> {
        self.nodes.iter().filter(|n| !n.outcome.ok()).collect()
    }
}

pub struct Deployer {
    dispatcher: Arc<Dispatcher>,
    staging_dir: PathBuf,
    /// Rendered artifacts keyed by (template, node). Append-only for the run.
    cache: Mutex<HashMap<(TemplateId, IpAddr), TemplateArtifact>>,
}

impl Deployer {
    pub fn new(dispatcher: Arc<Dispatcher>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            dispatcher,
            staging_dir: staging_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    fn transport(&self) -> &Arc<dyn Transport> {
        self.dispatcher.transport()
    }

    /// The artifact `node` should hold. Standalone templates are rendered once
    /// per run and cached; the hosts block is merged into the node's current
    /// `/etc/hosts` each time.
    pub async fn artifact_for(
        &self,
        id: TemplateId,
        topology: &ClusterTopology,
        node: &Node,
    ) -> Result<TemplateArtifact, TransportError> {
        if !id.standalone() {
            let block = render(id, &TemplateContext::for_node(topology, node));
            let existing = self
                .transport()
                .read_file(node, id.target_path())
                .await?
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();
            let merged = merge_managed_block(&existing, &block.as_str());
            return Ok(TemplateArtifact::new(id, merged.into_bytes()));
        }
        let mut cache = self.cache.lock().await;
        Ok(cache
            .entry((id, node.ip))
            .or_insert_with(|| render(id, &TemplateContext::for_node(topology, node)))
            .clone())
    }

    /// True when the node already holds exactly this artifact.
    pub async fn matches(&self, node: &Node, artifact: &TemplateArtifact) -> Result<bool, TransportError> {
        Ok(self
            .transport()
            .read_file(node, &artifact.target_path)
            .await?
            .is_some_and(|bytes| sha256_hex(&bytes) == artifact.checksum))
    }

    async fn stage(&self, artifact: &TemplateArtifact, suffix: &str) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .with_context(|| format!("creating staging dir {}", self.staging_dir.display()))?;
        let path = self
            .staging_dir
            .join(format!("{}.{}", artifact.template_id, suffix));
        tokio::fs::write(&path, &artifact.rendered_bytes)
            .await
            .with_context(|| format!("staging {}", path.display()))?;
        Ok(path)
    }

    /// Push one artifact, identical for every node.
    pub async fn deploy(&self, artifact: &TemplateArtifact, nodes: &[Node]) -> anyhow::Result<DeployReport> {
        self.stage(artifact, "shared").await?;
        let transport = self.transport().clone();
        let shared = Arc::new(artifact.clone());
        let results = self
            .dispatcher
            .for_each_node(nodes, |node| {
                let transport = transport.clone();
                let artifact = shared.clone();
                async move { push_and_verify(transport.as_ref(), &node, &artifact).await }
            })
            .await;
        Ok(finish(artifact.template_id, &artifact.target_path, results))
    }

    /// Render an individualized artifact per node and push each to its node.
    pub async fn deploy_template(
        &self,
        id: TemplateId,
        topology: &ClusterTopology,
        nodes: &[Node],
    ) -> anyhow::Result<DeployReport> {
        let mut per_node: HashMap<IpAddr, TemplateArtifact> = HashMap::new();
        let mut unreachable: Vec<NodeDeploy> = Vec::new();
        for node in nodes {
            match self.artifact_for(id, topology, node).await {
                Ok(artifact) => {
                    self.stage(&artifact, &node.ip.to_string()).await?;
                    per_node.insert(node.ip, artifact);
                }
                Err(e) => unreachable.push(NodeDeploy {
                    node: node.hostname.clone(),
                    ip: node.ip,
                    checksum: String::new(),
                    outcome: DeployOutcome::Failed { reason: e.to_string() },
                }),
            }
        }

        let targets: Vec<Node> = nodes
            .iter()
            .filter(|n| per_node.contains_key(&n.ip))
            .cloned()
            .collect();
        let per_node = Arc::new(per_node);
        let transport = self.transport().clone();
        let mut results = self
            .dispatcher
            .for_each_node(&targets, |node| {
                let transport = transport.clone();
                let per_node = per_node.clone();
                async move {
                    match per_node.get(&node.ip) {
                        Some(artifact) => push_and_verify(transport.as_ref(), &node, artifact).await,
                        None => NodeDeploy {
                            node: node.hostname.clone(),
                            ip: node.ip,
                            checksum: String::new(),
                            outcome: DeployOutcome::Failed {
                                reason: "no artifact rendered".into(),
                            },
                        },
                    }
                }
            })
            .await;
        results.extend(unreachable);
        results.sort_by_key(|r| nodes.iter().position(|n| n.ip == r.ip));
        Ok(finish(id, id.target_path(), results))
    }
}

fn finish(template: TemplateId, target_path: &str, nodes: Vec<NodeDeploy>) -> DeployReport {
    let report = DeployReport {
        template,
        target_path: target_path.to_string(),
        nodes,
    };
    info!(
        template=%template,
        nodes = report.nodes.len(),
        failed = report.failed_nodes().len(),
        "deploy finished"
    );
    report
}

async fn write_with_retry(
    transport: &dyn Transport,
    node: &Node,
    artifact: &TemplateArtifact,
) -> Result<(), TransportError> {
    let opts = WriteOptions {
        mode: Some(artifact.mode),
        privileged: artifact.privileged,
    };
    match transport
        .write_file(node, &artifact.target_path, &artifact.rendered_bytes, opts)
        .await
    {
        Err(e) if e.is_connection() => {
            warn!(node=%node.ip, error=%e, "write failed to connect, retrying");
            transport
                .write_file(node, &artifact.target_path, &artifact.rendered_bytes, opts)
                .await
        }
        other => other,
    }
}

/// Write, read back, compare. One re-send on mismatch.
async fn push_and_verify(transport: &dyn Transport, node: &Node, artifact: &TemplateArtifact) -> NodeDeploy {
    let report = |outcome| NodeDeploy {
        node: node.hostname.clone(),
        ip: node.ip,
        checksum: artifact.checksum.clone(),
        outcome,
    };

    let mut found = String::new();
    for attempt in 0..2 {
        if let Err(e) = write_with_retry(transport, node, artifact).await {
            warn!(node=%node.ip, template=%artifact.template_id, error=%e, "transfer failed");
            return report(DeployOutcome::Failed { reason: e.to_string() });
        }
        found = match transport.read_file(node, &artifact.target_path).await {
            Ok(Some(bytes)) => sha256_hex(&bytes),
            Ok(None) => "missing".to_string(),
            Err(e) => return report(DeployOutcome::Failed { reason: e.to_string() }),
        };
        if found == artifact.checksum {
            return report(if attempt == 0 {
                DeployOutcome::Verified
            } else {
                DeployOutcome::Repaired
            });
        }
        warn!(
            node=%node.ip,
            template=%artifact.template_id,
            expected=%artifact.checksum,
            found=%found,
            attempt,
            "checksum mismatch after transfer"
        );
    }

    report(DeployOutcome::Degraded {
        error: ClusterError::TemplateChecksumMismatch {
            node: node.label(),
            template: artifact.template_id.to_string(),
            expected: artifact.checksum.clone(),
            found,
        },
    })
}
