use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use corral_common::{BenchmarkConfig, BenchmarkReport, BenchmarkResult, ClusterError, ClusterTopology, Node};
use corral_exec::Dispatcher;

use crate::cleanup::{patterns_for, sweep, CleanupReport};
use crate::launch::{LaunchPlan, LaunchSettings};
use crate::process::run_with_deadline;
use crate::sync::{sync_binaries, SyncReport};

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub launch: LaunchSettings,
    /// Time between SIGTERM and SIGKILL for a group past its deadline.
    pub grace: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            launch: LaunchSettings::default(),
            grace: Duration::from_secs(5),
        }
    }
}

/// Runs benchmarks one at a time against a converged cluster and keeps the
/// results in order.
pub struct BenchmarkRunner {
    run_id: Uuid,
    topology: Arc<ClusterTopology>,
    dispatcher: Arc<Dispatcher>,
    opts: RunnerOptions,
    results: Vec<BenchmarkResult>,
    cleanups: Vec<CleanupReport>,
}

impl BenchmarkRunner {
    pub fn new(topology: Arc<ClusterTopology>, dispatcher: Arc<Dispatcher>, opts: RunnerOptions) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            topology,
            dispatcher,
            opts,
            results: Vec::new(),
            cleanups: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn results(&self) -> &[BenchmarkResult] {
        &self.results
    }

    pub fn last_cleanup(&self) -> Option<&CleanupReport> {
        self.cleanups.last()
    }

    fn nodes(&self) -> Vec<Node> {
        self.topology.all_nodes()
    }

    /// Put every distinct binary on every node before anything runs.
    pub async fn sync(&self, configs: &[BenchmarkConfig]) -> anyhow::Result<SyncReport> {
        let mut binaries: Vec<String> = Vec::new();
        for c in configs {
            if !binaries.contains(&c.binary_path) {
                binaries.push(c.binary_path.clone());
            }
        }
        sync_binaries(&self.dispatcher, &binaries, &self.nodes()).await
    }

    /// Launch one benchmark under its deadline, then sweep for orphans no
    /// matter how it ended.
    pub async fn run(&mut self, config: &BenchmarkConfig) -> BenchmarkResult {
        let plan = LaunchPlan::for_benchmark(config, &self.topology, &self.opts.launch);
        let deadline = Duration::from_secs(config.timeout_sec.max(1));
        info!(
            run_id=%self.run_id,
            benchmark=%config.name,
            command=%plan.display(),
            processes = plan.processes,
            timeout_secs = deadline.as_secs(),
            "benchmark started"
        );

        let timestamp = Utc::now();
        let start = Instant::now();
        let result = match run_with_deadline(&plan, deadline, self.opts.grace).await {
            Ok(out) => {
                let success = out.success();
                let mut stderr = out.stderr;
                if out.timed_out {
                    let err = ClusterError::BenchmarkTimeout {
                        name: config.name.clone(),
                        timeout_sec: deadline.as_secs(),
                    };
                    error!(benchmark=%config.name, error=%err, "benchmark timed out");
                    if !stderr.is_empty() && !stderr.ends_with('\n') {
                        stderr.push('\n');
                    }
                    stderr.push_str(&err.to_string());
                }
                BenchmarkResult {
                    name: config.name.clone(),
                    success,
                    duration_ms: out.duration.as_millis() as u64,
                    exit_code: out.exit_code,
                    stdout: out.stdout,
                    stderr,
                    timestamp,
                    timed_out: out.timed_out,
                    processes: plan.processes,
                    launch_mode: config.launch_mode,
                }
            }
            Err(e) => {
                error!(benchmark=%config.name, error=%format!("{e:#}"), "benchmark failed to start");
                BenchmarkResult {
                    name: config.name.clone(),
                    success: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("{e:#}"),
                    timestamp,
                    timed_out: false,
                    processes: plan.processes,
                    launch_mode: config.launch_mode,
                }
            }
        };

        info!(
            benchmark=%result.name,
            success = result.success,
            exit_code=?result.exit_code,
            duration_ms = result.duration_ms,
            "benchmark finished"
        );

        let patterns = patterns_for(Some(&config.binary_path));
        let report = self.cleanup(&patterns, &self.nodes()).await;
        if !report.clean() {
            warn!(benchmark=%config.name, remaining = report.remaining_total(), "orphaned processes survived cleanup");
        }
        self.cleanups.push(report);
        self.results.push(result.clone());
        result
    }

    pub async fn run_all(&mut self, configs: &[BenchmarkConfig]) -> Vec<BenchmarkResult> {
        let mut out = Vec::with_capacity(configs.len());
        for config in configs {
            out.push(self.run(config).await);
        }
        out
    }

    pub async fn cleanup(&self, patterns: &[String], nodes: &[Node]) -> CleanupReport {
        sweep(&self.dispatcher, patterns, nodes).await
    }

    pub fn report(&self) -> BenchmarkReport {
        BenchmarkReport {
            run_id: self.run_id.to_string(),
            generated_at: Utc::now(),
            master: self.topology.master.hostname.clone(),
            nodes: self.nodes(),
            results: self.results.clone(),
        }
    }

    /// Write the accumulated results as one JSON document.
    pub async fn export(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(&self.report())?;
        tokio::fs::write(path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path=%path.display(), results = self.results.len(), "results exported");
        Ok(())
    }
}

pub fn default_report_path(now: DateTime<Utc>) -> PathBuf {
    PathBuf::from("results").join(format!("benchmarks-{}.json", now.format("%Y%m%d-%H%M%S")))
}
