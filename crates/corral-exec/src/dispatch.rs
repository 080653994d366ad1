use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use corral_common::{CommandStatus, Node, RemoteCommandResult};

use crate::fanout::FanOut;
use crate::transport::{ExecOutput, Transport, TransportError};

/// Upper bound on simultaneous per-node calls regardless of cluster size.
pub const MAX_CONCURRENCY_CEILING: usize = 64;

/// Exit code reported for a command cut off by the timeout, as `timeout(1)` does.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// How commands reach the nodes, decided once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// One fan-out tool invocation covers every node.
    ParallelTool,
    /// One transport call per node on a bounded task pool.
    PerNode,
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// `None` means node count, capped at [`MAX_CONCURRENCY_CEILING`].
    pub max_concurrency: Option<usize>,
    pub command_timeout: Duration,
    pub connect_retries: u32,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            command_timeout: Duration::from_secs(300),
            connect_retries: 1,
        }
    }
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    fan_out: Option<Arc<dyn FanOut>>,
    strategy: DispatchStrategy,
    opts: DispatchOptions,
}

impl Dispatcher {
    /// Probe the fan-out tool once against `nodes` and fix the strategy.
    pub async fn detect(
        transport: Arc<dyn Transport>,
        fan_out: Option<Arc<dyn FanOut>>,
        nodes: &[Node],
        opts: DispatchOptions,
    ) -> Self {
        let strategy = match &fan_out {
            Some(tool) if tool.available(nodes).await => DispatchStrategy::ParallelTool,
            _ => DispatchStrategy::PerNode,
        };
        info!(
            strategy=?strategy,
            tool = fan_out.as_ref().map(|t| t.name().to_string()).unwrap_or_default(),
            "dispatch strategy selected"
        );
        Self {
            transport,
            fan_out: if strategy == DispatchStrategy::ParallelTool { fan_out } else { None },
            strategy,
            opts,
        }
    }

    pub fn per_node(transport: Arc<dyn Transport>, opts: DispatchOptions) -> Self {
        Self {
            transport,
            fan_out: None,
            strategy: DispatchStrategy::PerNode,
            opts,
        }
    }

    pub fn strategy(&self) -> DispatchStrategy {
        self.strategy
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.opts
    }

    pub fn concurrency_for(&self, node_count: usize) -> usize {
        self.opts
            .max_concurrency
            .unwrap_or(node_count.min(MAX_CONCURRENCY_CEILING))
            .max(1)
    }

    pub async fn dispatch(&self, command: &str, nodes: &[Node]) -> Vec<RemoteCommandResult> {
        self.dispatch_with_timeout(command, nodes, self.opts.command_timeout)
            .await
    }

    /// Run `command` on every node. One result per node, in input order.
    pub async fn dispatch_with_timeout(
        &self,
        command: &str,
        nodes: &[Node],
        timeout: Duration,
    ) -> Vec<RemoteCommandResult> {
        if nodes.is_empty() {
            return Vec::new();
        }
        debug!(%command, nodes = nodes.len(), strategy=?self.strategy, "dispatch");
        match (&self.strategy, &self.fan_out) {
            (DispatchStrategy::ParallelTool, Some(tool)) => {
                match self.dispatch_fan_out(tool.as_ref(), command, nodes, timeout).await {
                    Ok(results) => results,
                    Err(e) => {
                        warn!(error=%e, tool=%tool.name(), "fan-out invocation failed, using per-node path");
                        self.dispatch_per_node(command, nodes, timeout).await
                    }
                }
            }
            _ => self.dispatch_per_node(command, nodes, timeout).await,
        }
    }

    async fn dispatch_fan_out(
        &self,
        tool: &dyn FanOut,
        command: &str,
        nodes: &[Node],
        timeout: Duration,
    ) -> anyhow::Result<Vec<RemoteCommandResult>> {
        let start = Instant::now();
        let mut outcomes = tool.fan_out(nodes, command, timeout).await?;

        let mut retries_left = self.opts.connect_retries;
        loop {
            let failed: Vec<Node> = nodes
                .iter()
                .filter(|n| matches!(outcomes.get(&n.ip), Some(Err(e)) if e.is_connection()))
                .cloned()
                .collect();
            if failed.is_empty() || retries_left == 0 {
                break;
            }
            retries_left -= 1;
            warn!(nodes = failed.len(), "retrying unreachable nodes through fan-out");
            match tool.fan_out(&failed, command, timeout).await {
                Ok(retried) => outcomes.extend(retried),
                Err(e) => {
                    warn!(error=%e, "fan-out retry failed");
                    break;
                }
            }
        }

        let elapsed = start.elapsed();
        Ok(nodes
            .iter()
            .map(|node| {
                let outcome = outcomes.remove(&node.ip).unwrap_or_else(|| {
                    Err(TransportError::Other("missing from fan-out output".into()))
                });
                to_result(node, outcome, elapsed, true)
            })
            .collect())
    }

    async fn dispatch_per_node(&self, command: &str, nodes: &[Node], timeout: Duration) -> Vec<RemoteCommandResult> {
        let limit = self.concurrency_for(nodes.len());
        let retries = self.opts.connect_retries;
        let transport = self.transport.clone();
        let command = command.to_string();
        bounded_map(nodes, limit, move |node| {
            let transport = transport.clone();
            let command = command.clone();
            async move { exec_with_retry(transport.as_ref(), &node, &command, timeout, retries).await }
        })
        .await
    }

    /// Run an arbitrary per-node task on the dispatcher's bounded pool.
    pub async fn for_each_node<T, F, Fut>(&self, nodes: &[Node], f: F) -> Vec<T>
    where
        F: Fn(Node) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        bounded_map(nodes, self.concurrency_for(nodes.len()), f).await
    }
}

async fn exec_with_retry(
    transport: &dyn Transport,
    node: &Node,
    command: &str,
    timeout: Duration,
    retries: u32,
) -> RemoteCommandResult {
    let start = Instant::now();
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(timeout, transport.exec(node, command, timeout)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::TimedOut(timeout)),
        };
        match outcome {
            Err(e) if e.is_connection() && attempt < retries => {
                attempt += 1;
                warn!(node=%node.ip, error=%e, attempt, "connection failed, retrying");
            }
            other => return to_result(node, other, start.elapsed(), false),
        }
    }
}

fn to_result(
    node: &Node,
    outcome: Result<ExecOutput, TransportError>,
    elapsed: Duration,
    used_parallel_path: bool,
) -> RemoteCommandResult {
    let (status, out) = match outcome {
        Ok(out) => (CommandStatus::Completed, out),
        Err(TransportError::TimedOut(t)) => (
            CommandStatus::TimedOut,
            ExecOutput::failed(TIMEOUT_EXIT_CODE, format!("timed out after {:?}", t)),
        ),
        Err(e) => (CommandStatus::ConnectionFailed, ExecOutput::failed(-1, e.to_string())),
    };
    if status != CommandStatus::Completed {
        warn!(node=%node.ip, status=?status, error=%out.stderr, "node isolated from dispatch");
    }
    RemoteCommandResult {
        node: node.hostname.clone(),
        ip: node.ip,
        status,
        exit_code: out.exit_code,
        stdout: out.stdout,
        stderr: out.stderr,
        duration_ms: elapsed.as_millis() as u64,
        used_parallel_path,
    }
}

/// Run `f` for every node with at most `limit` in flight; results keep input order.
pub async fn bounded_map<T, F, Fut>(nodes: &[Node], limit: usize, f: F) -> Vec<T>
where
    F: Fn(Node) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();
    for (idx, node) in nodes.iter().cloned().enumerate() {
        let sem = sem.clone();
        let fut = f(node);
        set.spawn(async move {
            let _permit = sem.acquire_owned().await;
            (idx, fut.await)
        });
    }

    let mut slots: Vec<Option<T>> = (0..nodes.len()).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, value)) => slots[idx] = Some(value),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => warn!(error=%e, "node task cancelled"),
        }
    }
    slots.into_iter().flatten().collect()
}
