//! Command lines for the three launch modes.

use std::path::PathBuf;

use corral_common::util::shell_quote;
use corral_common::{BenchmarkConfig, ClusterTopology, LaunchMode};

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// Local hostfile handed to `mpirun`.
    pub hostfile: PathBuf,
    pub mpirun: String,
    pub pdsh: String,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            hostfile: PathBuf::from(home).join(".corral/hostfile-max-core"),
            mpirun: "mpirun".to_string(),
            pdsh: "pdsh".to_string(),
        }
    }
}

/// A resolved local command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub processes: u32,
}

impl LaunchPlan {
    pub fn for_benchmark(config: &BenchmarkConfig, topology: &ClusterTopology, settings: &LaunchSettings) -> Self {
        match config.launch_mode {
            LaunchMode::Mpi => {
                let processes = match config.process_count {
                    0 => topology.total_cpus().max(1),
                    n => n,
                };
                let mut args = vec![
                    "--hostfile".to_string(),
                    settings.hostfile.to_string_lossy().into_owned(),
                    "-np".to_string(),
                    processes.to_string(),
                    config.binary_path.clone(),
                ];
                args.extend(config.args.iter().cloned());
                Self {
                    program: settings.mpirun.clone(),
                    args,
                    processes,
                }
            }
            LaunchMode::ParallelShell => {
                let hosts: Vec<String> = topology.nodes().map(|n| n.ip.to_string()).collect();
                let remote: Vec<String> = std::iter::once(config.binary_path.as_str())
                    .chain(config.args.iter().map(|a| a.as_str()))
                    .map(shell_quote)
                    .collect();
                Self {
                    program: settings.pdsh.clone(),
                    args: vec![
                        "-R".to_string(),
                        "ssh".to_string(),
                        "-l".to_string(),
                        topology.username.clone(),
                        "-w".to_string(),
                        hosts.join(","),
                        remote.join(" "),
                    ],
                    processes: hosts.len() as u32,
                }
            }
            LaunchMode::Direct => Self {
                program: config.binary_path.clone(),
                args: config.args.clone(),
                processes: 1,
            },
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(|a| a.as_str()))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
