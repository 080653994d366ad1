use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::Node;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// `mpirun` across the generated hostfile.
    Mpi,
    /// One copy per node through the fan-out tool.
    ParallelShell,
    /// A single local process.
    Direct,
}

impl Default for LaunchMode {
    fn default() -> Self {
        Self::Mpi
    }
}

/// A configured benchmark, static for the whole run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BenchmarkConfig {
    pub name: String,
    pub binary_path: String,

    #[serde(default)]
    pub launch_mode: LaunchMode,

    /// 0 means "one per core across the cluster".
    #[serde(default)]
    pub process_count: u32,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_timeout_sec() -> u64 {
    300
}

impl BenchmarkConfig {
    /// File name of the binary, used as an extra cleanup pattern.
    pub fn binary_name(&self) -> &str {
        self.binary_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.binary_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BenchmarkResult {
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub processes: u32,
    pub launch_mode: LaunchMode,
}

/// The exported document: one per `run` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    #[serde(default)]
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub master: String,
    pub nodes: Vec<Node>,
    pub results: Vec<BenchmarkResult>,
}

impl BenchmarkReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}
