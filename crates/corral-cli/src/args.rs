use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use corral_setup::TemplateId;

#[derive(Debug, Parser)]
#[command(name = "corral")]
#[command(about = "Provision and benchmark a heterogeneous cluster", long_about = None)]
pub struct Args {
    /// Cluster file (YAML, or JSON by extension)
    #[arg(long, short = 'c', env = "CORRAL_CONFIG", default_value = "cluster.yaml")]
    pub config: PathBuf,

    /// Login password; only needed to bootstrap keys and sudo
    #[arg(long, env = "CORRAL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Pin this machine to a configured node address instead of detecting it
    #[arg(long, env = "CORRAL_NODE_IP")]
    pub node_ip: Option<IpAddr>,

    /// Max simultaneous per-node calls (default: node count, capped at 64)
    #[arg(long, env = "CORRAL_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Per-command timeout in seconds
    #[arg(long, env = "CORRAL_COMMAND_TIMEOUT")]
    pub command_timeout: Option<u64>,

    /// Never fan out through pdsh, even when it is installed
    #[arg(long)]
    pub no_parallel_tool: bool,

    /// Log level for corral crates when RUST_LOG is unset
    #[arg(long, env = "CORRAL_LOG", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show which configured node this machine is
    Role,
    /// Establish passwordless ssh and sudo across every node
    Mesh,
    /// Probe every node and run the setup sequence
    Setup {
        /// Per-step timeout in seconds
        #[arg(long)]
        step_timeout: Option<u64>,
    },
    /// Render and deploy configuration files
    Deploy {
        /// Template to deploy; every template when omitted
        template: Option<TemplateId>,
    },
    /// Run an ad-hoc command on every node
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// List configured benchmarks
    List,
    /// Copy benchmark binaries to every node
    Sync,
    /// Run one benchmark by name, or `all`
    Run {
        name: String,
        /// Process count (default: per benchmark, 0 = every core)
        #[arg(long)]
        processes: Option<u32>,
        /// Deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Where to write the results document
        #[arg(long)]
        output: Option<PathBuf>,
        /// Skip the binary sync before running
        #[arg(long)]
        skip_sync: bool,
    },
    /// Kill leftover launcher and benchmark processes on every node
    Cleanup,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let args = Args::try_parse_from(["corral", "-c", "c.json", "run", "all", "--processes", "8", "--timeout", "60"]).unwrap();
        assert_eq!(args.config, PathBuf::from("c.json"));
        match args.command {
            Command::Run { name, processes, timeout, .. } => {
                assert_eq!(name, "all");
                assert_eq!(processes, Some(8));
                assert_eq!(timeout, Some(60));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_deploy_and_exec() {
        let args = Args::try_parse_from(["corral", "deploy", "mca-params"]).unwrap();
        assert!(matches!(args.command, Command::Deploy { template: Some(TemplateId::McaParams) }));
        assert!(Args::try_parse_from(["corral", "deploy", "bogus"]).is_err());

        let args = Args::try_parse_from(["corral", "exec", "uname", "-r"]).unwrap();
        match args.command {
            Command::Exec { command } => assert_eq!(command, vec!["uname", "-r"]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
