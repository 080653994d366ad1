//! Ordered step execution with a barrier between generations.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use corral_common::{ClusterError, Node};

use crate::step::{Step, StepContext};
use crate::steps::builtin_steps;

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    AlreadySatisfied,
    Verified,
    VerifyFailed,
    Errored,
    TimedOut,
    /// Skipped because an earlier node-fatal error halted this node.
    Blocked,
}

impl StepOutcome {
    pub fn ok(self) -> bool {
        matches!(self, StepOutcome::AlreadySatisfied | StepOutcome::Verified)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepOutcome::AlreadySatisfied => "already-satisfied",
            StepOutcome::Verified => "verified",
            StepOutcome::VerifyFailed => "verify-failed",
            StepOutcome::Errored => "errored",
            StepOutcome::TimedOut => "timed-out",
            StepOutcome::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStepResult {
    pub node: String,
    pub ip: IpAddr,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ClusterError>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub id: u32,
    pub name: String,
    pub fatal: bool,
    pub nodes: Vec<NodeStepResult>,
}

impl StepRecord {
    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.nodes.iter().filter(|n| n.outcome == outcome).count()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StepReport {
    pub steps: Vec<StepRecord>,
    /// Name of the step that halted the run.
    pub aborted_at: Option<String>,
    /// Nodes halted by a node-fatal error, with the reason.
    pub blocked: BTreeMap<IpAddr, String>,
}

impl StepReport {
    pub fn aborted(&self) -> bool {
        self.aborted_at.is_some()
    }

    /// Every step ran and every node ended satisfied or verified.
    pub fn all_ok(&self) -> bool {
        !self.aborted() && self.steps.iter().all(|s| s.nodes.iter().all(|n| n.outcome.ok()))
    }

    pub fn all_already_satisfied(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.nodes.iter().all(|n| n.outcome == StepOutcome::AlreadySatisfied))
    }

    pub fn failures(&self) -> Vec<(&StepRecord, &NodeStepResult)> {
        self.steps
            .iter()
            .flat_map(|s| s.nodes.iter().filter(|n| !n.outcome.ok()).map(move |n| (s, n)))
            .collect()
    }
}

pub struct StepRunner {
    steps: Vec<Arc<dyn Step>>,
    step_timeout: Duration,
}

impl StepRunner {
    pub fn new(steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            steps,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_steps())
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    /// Run every step across every node. Step N+1 starts on no node before
    /// step N is terminal on all of them.
    pub async fn run_all(&self, ctx: &StepContext) -> StepReport {
        let nodes = ctx.topology.all_nodes();
        let mut report = StepReport::default();
        info!(steps = self.steps.len(), nodes = nodes.len(), "setup started");

        for step in &self.steps {
            let active: Vec<Node> = nodes
                .iter()
                .filter(|n| !report.blocked.contains_key(&n.ip))
                .cloned()
                .collect();
            info!(step=%step.name(), id = step.id(), nodes = active.len(), "step started");

            let timeout = self.step_timeout;
            let results = ctx
                .dispatcher
                .for_each_node(&active, |node| {
                    let step = step.clone();
                    let ctx = ctx.clone();
                    async move { drive(step.as_ref(), &ctx, node, timeout).await }
                })
                .await;

            let mut by_ip: BTreeMap<IpAddr, NodeStepResult> = results.into_iter().map(|r| (r.ip, r)).collect();
            let mut record = StepRecord {
                id: step.id(),
                name: step.name().to_string(),
                fatal: step.fatal(),
                nodes: Vec::with_capacity(nodes.len()),
            };
            for node in &nodes {
                let result = match by_ip.remove(&node.ip) {
                    Some(r) => r,
                    None => NodeStepResult {
                        node: node.hostname.clone(),
                        ip: node.ip,
                        outcome: StepOutcome::Blocked,
                        detail: report.blocked.get(&node.ip).cloned(),
                        error: None,
                        duration_ms: 0,
                    },
                };
                if let Some(e) = result.error.as_ref().filter(|e| e.is_node_fatal()) {
                    warn!(node=%node.ip, step=%step.name(), error=%e, "node halted for remaining steps");
                    report.blocked.insert(node.ip, e.to_string());
                }
                record.nodes.push(result);
            }

            let run_fatal = record
                .nodes
                .iter()
                .any(|n| n.error.as_ref().is_some_and(|e| e.is_run_fatal()));
            let fatal_failure = step.fatal()
                && record
                    .nodes
                    .iter()
                    .any(|n| !n.outcome.ok() && n.outcome != StepOutcome::Blocked);

            info!(
                step=%step.name(),
                satisfied = record.count(StepOutcome::AlreadySatisfied),
                verified = record.count(StepOutcome::Verified),
                failed = record.nodes.iter().filter(|n| !n.outcome.ok()).count(),
                "step finished"
            );
            report.steps.push(record);

            if run_fatal || fatal_failure {
                error!(step=%step.name(), "run aborted");
                report.aborted_at = Some(step.name().to_string());
                break;
            }
        }
        report
    }
}

struct Verdict {
    outcome: StepOutcome,
    detail: Option<String>,
    error: Option<ClusterError>,
}

impl Verdict {
    fn of(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            detail: None,
            error: None,
        }
    }

    fn errored(e: anyhow::Error) -> Self {
        Self {
            outcome: StepOutcome::Errored,
            detail: Some(format!("{e:#}")),
            error: e.downcast_ref::<ClusterError>().cloned(),
        }
    }
}

/// Pending → CheckingIdempotency → {AlreadySatisfied | Applying → Verifying → {Verified | VerifyFailed}}
async fn drive(step: &dyn Step, ctx: &StepContext, node: Node, timeout: Duration) -> NodeStepResult {
    let start = Instant::now();
    let work = async {
        match step.is_satisfied(ctx, &node).await {
            Ok(true) => return Verdict::of(StepOutcome::AlreadySatisfied),
            Ok(false) => {}
            Err(e) => return Verdict::errored(e),
        }
        if let Err(e) = step.apply(ctx, &node).await {
            return Verdict::errored(e);
        }
        match step.verify(ctx, &node).await {
            Ok(true) => Verdict::of(StepOutcome::Verified),
            Ok(false) => Verdict {
                outcome: StepOutcome::VerifyFailed,
                detail: Some("post-condition does not hold after apply".into()),
                error: None,
            },
            Err(e) => Verdict::errored(e),
        }
    };

    let verdict = match tokio::time::timeout(timeout, work).await {
        Ok(v) => v,
        Err(_) => Verdict {
            outcome: StepOutcome::TimedOut,
            detail: Some(format!("exceeded the {}s step timeout", timeout.as_secs())),
            error: None,
        },
    };
    if !verdict.outcome.ok() {
        warn!(
            node=%node.ip,
            step=%step.name(),
            outcome=%verdict.outcome.as_str(),
            detail=%verdict.detail.as_deref().unwrap_or_default(),
            "step failed on node"
        );
    }
    NodeStepResult {
        node: node.hostname.clone(),
        ip: node.ip,
        outcome: verdict.outcome,
        detail: verdict.detail,
        error: verdict.error,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}
