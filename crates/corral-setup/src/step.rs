use std::sync::Arc;

use async_trait::async_trait;

use corral_common::{ClusterError, ClusterTopology, CommandStatus, Node, RemoteCommandResult};
use corral_exec::{Dispatcher, Session};

use crate::deploy::Deployer;

pub const DEFAULT_BENCHMARK_DIR: &str = "~/corral/benchmarks";

/// One idempotent, independently verifiable setup action.
///
/// Steps run in a fixed order and must not rely on a later step's effects.
#[async_trait]
pub trait Step: Send + Sync {
    fn id(&self) -> u32;

    fn name(&self) -> &str;

    /// A fatal step failing on any node halts the whole run.
    fn fatal(&self) -> bool {
        false
    }

    /// True when the post-condition already holds and `apply` can be skipped.
    async fn is_satisfied(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<bool>;

    async fn apply(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<()>;

    async fn verify(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<bool>;
}

/// Shared handles every step reads. Cheap to clone.
#[derive(Clone)]
pub struct StepContext {
    pub topology: Arc<ClusterTopology>,
    pub dispatcher: Arc<Dispatcher>,
    pub deployer: Arc<Deployer>,
    pub session: Option<Arc<Session>>,
    pub benchmark_dir: String,
}

impl StepContext {
    pub fn new(topology: Arc<ClusterTopology>, dispatcher: Arc<Dispatcher>, deployer: Arc<Deployer>) -> Self {
        Self {
            topology,
            dispatcher,
            deployer,
            session: None,
            benchmark_dir: DEFAULT_BENCHMARK_DIR.to_string(),
        }
    }

    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_benchmark_dir(mut self, dir: impl Into<String>) -> Self {
        self.benchmark_dir = dir.into();
        self
    }

    /// Run a command on one node. Unreachable nodes and timeouts are errors;
    /// a non-zero exit is returned for the caller to judge.
    pub async fn run(&self, node: &Node, command: &str) -> anyhow::Result<RemoteCommandResult> {
        let res = self
            .dispatcher
            .dispatch(command, std::slice::from_ref(node))
            .await
            .pop()
            .ok_or_else(|| anyhow::anyhow!("no result from {}", node.label()))?;
        match res.status {
            CommandStatus::Completed => Ok(res),
            CommandStatus::ConnectionFailed => Err(ClusterError::ConnectionFailed {
                node: node.label(),
                reason: res.stderr.trim().to_string(),
            }
            .into()),
            CommandStatus::TimedOut => anyhow::bail!("`{}` timed out on {}", command, node.label()),
        }
    }

    /// Exit status 0.
    pub async fn succeeds(&self, node: &Node, command: &str) -> anyhow::Result<bool> {
        Ok(self.run(node, command).await?.success())
    }
}
