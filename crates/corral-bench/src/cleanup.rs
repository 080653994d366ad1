//! Post-run sweep for orphaned launcher daemons.

use std::net::IpAddr;

use serde::Serialize;
use tracing::{info, warn};

use corral_common::Node;
use corral_exec::Dispatcher;

/// Launchers and per-node agents left behind by a hung MPI run.
pub const DEFAULT_PATTERNS: &[&str] = &["mpirun", "mpiexec", "orted", "prted", "prterun", "hydra_pmi_proxy"];

#[derive(Debug, Clone, Serialize)]
pub struct NodeCleanup {
    pub node: String,
    pub ip: IpAddr,
    /// Matching processes still alive after the kill; `None` if unknown.
    pub remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub patterns: Vec<String>,
    pub nodes: Vec<NodeCleanup>,
}

impl CleanupReport {
    pub fn remaining_total(&self) -> u32 {
        self.nodes.iter().filter_map(|n| n.remaining).sum()
    }

    /// Every node answered and none has a match left.
    pub fn clean(&self) -> bool {
        self.nodes.iter().all(|n| n.remaining == Some(0))
    }
}

/// Default patterns plus the benchmark's binary.
///
/// A pattern starting with `/` matches processes whose command line begins
/// with that exact path; anything else matches the exact process name.
pub fn patterns_for(binary_path: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect();
    if let Some(path) = binary_path.filter(|n| !n.is_empty()) {
        if !out.iter().any(|p| p == path) {
            out.push(path.to_string());
        }
    }
    out
}

fn escape_ere(s: &str) -> String {
    s.chars()
        .map(|c| {
            if "\\.^$|?*+()[]{}".contains(c) {
                format!("\\{c}")
            } else {
                c.to_string()
            }
        })
        .collect()
}

/// Split into one `-x` alternation over names and one anchored `-f` regex per
/// path. Patterns that cannot be single-quoted are dropped.
fn selectors(patterns: &[String]) -> Vec<String> {
    let usable = patterns.iter().filter(|p| !p.is_empty() && !p.contains('\''));
    let (paths, names): (Vec<&String>, Vec<&String>) = usable.partition(|p| p.starts_with('/'));
    let mut out = Vec::new();
    if !names.is_empty() {
        let alternation: Vec<String> = names.iter().map(|n| escape_ere(n)).collect();
        out.push(format!("-x '{}'", alternation.join("|")));
    }
    for path in paths {
        out.push(format!("-f '^{}( |$)'", escape_ere(path)));
    }
    out
}

pub fn kill_command(patterns: &[String]) -> String {
    let mut parts: Vec<String> = selectors(patterns)
        .into_iter()
        .map(|sel| format!("pkill -9 {sel}"))
        .collect();
    parts.push("true".to_string());
    parts.join("; ")
}

/// One count line per selector; the sweep sums them.
pub fn count_command(patterns: &[String]) -> String {
    let parts: Vec<String> = selectors(patterns)
        .into_iter()
        .map(|sel| format!("pgrep -c {sel} || true"))
        .collect();
    if parts.is_empty() {
        return "echo 0".to_string();
    }
    parts.join("; ")
}

fn sum_counts(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.parse::<u32>().ok())
        .sum()
}

/// Kill every match on every node, then count what is left.
pub async fn sweep(dispatcher: &Dispatcher, patterns: &[String], nodes: &[Node]) -> CleanupReport {
    let kills = dispatcher.dispatch(&kill_command(patterns), nodes).await;
    let counts = dispatcher.dispatch(&count_command(patterns), nodes).await;

    let report = CleanupReport {
        patterns: patterns.to_vec(),
        nodes: kills
            .into_iter()
            .zip(counts)
            .map(|(kill, count)| {
                let remaining = if count.success() {
                    sum_counts(&count.stdout)
                } else {
                    None
                };
                let error = if !kill.success() {
                    Some(kill.stderr.trim().to_string())
                } else if !count.success() {
                    Some(count.stderr.trim().to_string())
                } else {
                    None
                };
                if let Some(e) = &error {
                    warn!(node=%kill.ip, error=%e, "cleanup incomplete on node");
                }
                NodeCleanup {
                    node: kill.node,
                    ip: kill.ip,
                    remaining,
                    error,
                }
            })
            .collect(),
    };
    info!(
        nodes = report.nodes.len(),
        remaining = report.remaining_total(),
        "cleanup sweep finished"
    );
    report
}
