use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use corral_common::{BenchmarkConfig, TopologyInput};
use corral_exec::DispatchOptions;

use crate::args::Args;

/// The on-disk cluster file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterFile {
    #[serde(flatten)]
    pub topology: TopologyInput,

    #[serde(default)]
    pub benchmarks: Vec<BenchmarkConfig>,

    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_concurrency: Option<usize>,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub step_timeout_secs: u64,
    /// Use pdsh when it is installed and reaches every node.
    pub parallel_tool: bool,
    pub identity_file: Option<PathBuf>,
    /// Local directory rendered artifacts are written to before transfer.
    pub staging_dir: PathBuf,
    /// Remote directory benchmark binaries live in.
    pub benchmark_dir: String,
    pub results_dir: PathBuf,
    pub kill_grace_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            command_timeout_secs: 300,
            connect_timeout_secs: 10,
            step_timeout_secs: 900,
            parallel_tool: true,
            identity_file: None,
            staging_dir: PathBuf::from(".corral/staging"),
            benchmark_dir: "~/corral/benchmarks".to_string(),
            results_dir: PathBuf::from("results"),
            kill_grace_secs: 5,
        }
    }
}

impl Settings {
    /// Command-line flags win over the file.
    pub fn apply_args(&mut self, args: &Args) {
        if args.concurrency.is_some() {
            self.max_concurrency = args.concurrency;
        }
        if let Some(t) = args.command_timeout {
            self.command_timeout_secs = t;
        }
        if args.no_parallel_tool {
            self.parallel_tool = false;
        }
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            max_concurrency: self.max_concurrency,
            command_timeout: Duration::from_secs(self.command_timeout_secs.max(1)),
            ..DispatchOptions::default()
        }
    }
}

pub fn load(path: &Path) -> anyhow::Result<ClusterFile> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse(&raw, path.extension().and_then(|e| e.to_str()) == Some("json"))
        .with_context(|| format!("parsing {}", path.display()))
}

fn parse(raw: &str, json: bool) -> anyhow::Result<ClusterFile> {
    Ok(if json {
        serde_json::from_str(raw)?
    } else {
        serde_yaml::from_str(raw)?
    })
}
