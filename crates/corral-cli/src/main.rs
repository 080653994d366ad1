mod args;
mod config;
mod output;

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

use corral_bench::{cleanup, default_report_path, BenchmarkRunner, Catalog, RunnerOptions, DEFAULT_PATTERNS};
use corral_common::telemetry::init_tracing;
use corral_common::{BenchmarkResult, ClusterError, ClusterTopology, Node};
use corral_exec::{
    probe_topology, Credentials, DispatchStrategy, Dispatcher, FanOut, PdshFanOut, Session, SshOptions,
    SshTransport, Transport,
};
use corral_setup::{local_addresses, resolve_with_override, Deployer, StepContext, StepRunner, TemplateId};

use crate::args::{Args, Command};
use crate::config::{ClusterFile, Settings};
use crate::output::{
    print_benchmarks, print_cleanup, print_deploy, print_exec, print_mesh, print_results, print_role,
    print_step_report, print_sync,
};

const EXIT_OK: u8 = 0;
/// Some nodes or items failed.
const EXIT_PARTIAL: u8 = 1;
/// A benchmark failed or timed out.
const EXIT_RUN_FAILED: u8 = 2;
/// Halted before or during setup by a run-fatal error.
const EXIT_ABORTED: u8 = 3;

struct App {
    args: Args,
    file: ClusterFile,
    settings: Settings,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing("corral", &args.log_level);

    let failure = failure_code(&args.command);
    let outcome = run(args).await;
    if let Err(e) = &outcome {
        error!(error=%format!("{e:#}"), "corral failed");
        eprintln!("error: {e:#}");
    }
    ExitCode::from(exit_code(outcome, failure))
}

/// Exit code when a command fails outright (bad config, unknown benchmark,
/// unreachable cluster, missing local binary).
fn failure_code(command: &Command) -> u8 {
    match command {
        Command::Run { .. } => EXIT_RUN_FAILED,
        Command::Cleanup => EXIT_OK,
        _ => EXIT_PARTIAL,
    }
}

fn exit_code(outcome: Result<u8>, failure: u8) -> u8 {
    outcome.unwrap_or(failure)
}

/// `run` succeeds only if the binaries synced and every benchmark passed.
fn run_exit_code(synced: bool, results: &[BenchmarkResult]) -> u8 {
    if synced && !results.is_empty() && results.iter().all(|r| r.success) {
        EXIT_OK
    } else {
        EXIT_RUN_FAILED
    }
}

async fn run(args: Args) -> Result<u8> {
    let file = config::load(&args.config)?;
    let mut settings = file.settings.clone();
    settings.apply_args(&args);
    let app = App { args, file, settings };

    match &app.args.command {
        Command::Role => role(&app).await,
        Command::Mesh => mesh(&app).await,
        Command::Setup { step_timeout } => setup(&app, *step_timeout).await,
        Command::Deploy { template } => deploy(&app, *template).await,
        Command::Exec { command } => exec(&app, &command.join(" ")).await,
        Command::List => {
            print_benchmarks(&Catalog::new(app.file.benchmarks.clone())?);
            Ok(EXIT_OK)
        }
        Command::Sync => sync(&app).await,
        Command::Run {
            name,
            processes,
            timeout,
            output,
            skip_sync,
        } => {
            let output = output
                .clone()
                .unwrap_or_else(|| app.settings.results_dir.join(default_report_path(Utc::now()).file_name().unwrap_or_default()));
            run_benchmarks(&app, name, *processes, *timeout, &output, *skip_sync).await
        }
        Command::Cleanup => cleanup_all(&app).await,
    }
}

impl App {
    fn username(&self) -> &str {
        &self.file.topology.username
    }

    fn credentials(&self) -> Option<Credentials> {
        self.args
            .password
            .as_ref()
            .map(|pw| Credentials::new(self.username(), pw.clone()))
    }

    /// Configured topology, with hints standing in for probed facts.
    fn declared_topology(&self) -> Result<ClusterTopology, ClusterError> {
        self.file.topology.build(&HashMap::new())
    }

    fn ssh(&self, credentials: Option<Credentials>) -> Arc<SshTransport> {
        let mut opts = SshOptions::new(self.username());
        opts.connect_timeout = Duration::from_secs(self.settings.connect_timeout_secs.max(1));
        opts.identity_file = self.settings.identity_file.clone();
        Arc::new(match credentials {
            Some(c) => SshTransport::with_credentials(opts, c),
            None => SshTransport::new(opts),
        })
    }

    async fn dispatcher(&self, transport: Arc<SshTransport>, nodes: &[Node]) -> Arc<Dispatcher> {
        let opts = self.settings.dispatch_options();
        let transport: Arc<dyn Transport> = transport;
        if !self.settings.parallel_tool || self.args.password.is_some() {
            return Arc::new(Dispatcher::per_node(transport, opts));
        }
        let mut pdsh = PdshFanOut::new(self.username());
        pdsh.connect_timeout = Duration::from_secs(self.settings.connect_timeout_secs.max(1));
        let tool: Arc<dyn FanOut> = Arc::new(pdsh);
        Arc::new(Dispatcher::detect(transport, Some(tool), nodes, opts).await)
    }

    /// Transport and dispatcher plus a live-probed topology.
    async fn connect(&self) -> Result<(Arc<SshTransport>, Arc<Dispatcher>, Arc<ClusterTopology>)> {
        let declared = self.declared_topology()?;
        let transport = self.ssh(self.credentials());
        let dispatcher = self.dispatcher(transport.clone(), &declared.all_nodes()).await;
        let topology = probe_topology(&self.file.topology, &dispatcher).await?;
        Ok((transport, dispatcher, Arc::new(topology)))
    }
}

async fn resolve_local(app: &App, topology: &ClusterTopology) -> Result<Result<Node, ClusterError>> {
    let local = local_addresses().await?;
    Ok(resolve_with_override(&local, app.args.node_ip, topology))
}

/// Role and topology errors stop the command before anything is changed.
fn role_error(err: &ClusterError) -> u8 {
    error!(error=%err, "cluster precondition failed");
    eprintln!("error: {}", err);
    EXIT_ABORTED
}

async fn role(app: &App) -> Result<u8> {
    let topology = match app.declared_topology() {
        Ok(t) => t,
        Err(e) => return Ok(role_error(&e)),
    };
    match resolve_local(app, &topology).await? {
        Ok(node) => {
            print_role(&node);
            Ok(EXIT_OK)
        }
        Err(e) => Ok(role_error(&e)),
    }
}

async fn mesh(app: &App) -> Result<u8> {
    let credentials = app
        .credentials()
        .context("mesh needs the login password (--password or CORRAL_PASSWORD)")?;
    let topology = match app.declared_topology().and_then(|t| t.require_workers().map(|_| t)) {
        Ok(t) => t,
        Err(e) => return Ok(role_error(&e)),
    };
    if let Err(e) = resolve_local(app, &topology).await? {
        return Ok(role_error(&e));
    }

    let transport = app.ssh(Some(credentials.clone()));
    let dispatcher = Arc::new(Dispatcher::per_node(transport.clone(), app.settings.dispatch_options()));
    let session = Session::new(credentials, dispatcher);
    let report = session.establish_mesh(&topology).await;
    transport.close_all().await;

    print_mesh(&report);
    Ok(if report.complete() { EXIT_OK } else { EXIT_PARTIAL })
}

async fn setup(app: &App, step_timeout: Option<u64>) -> Result<u8> {
    let declared = match app.declared_topology() {
        Ok(t) => t,
        Err(e) => return Ok(role_error(&e)),
    };
    let local = match resolve_local(app, &declared).await? {
        Ok(node) => node,
        Err(e) => return Ok(role_error(&e)),
    };
    info!(node=%local.ip, role=%local.role, "running setup");

    let (transport, dispatcher, topology) = app.connect().await?;
    if let Err(e) = topology.require_workers() {
        transport.close_all().await;
        return Ok(role_error(&e));
    }
    let deployer = Arc::new(Deployer::new(dispatcher.clone(), &app.settings.staging_dir));
    let mut ctx = StepContext::new(topology, dispatcher.clone(), deployer)
        .with_benchmark_dir(app.settings.benchmark_dir.clone());
    if let Some(creds) = app.credentials() {
        ctx = ctx.with_session(Arc::new(Session::new(creds, dispatcher)));
    }

    let timeout = Duration::from_secs(step_timeout.unwrap_or(app.settings.step_timeout_secs).max(1));
    let report = StepRunner::builtin().with_step_timeout(timeout).run_all(&ctx).await;
    transport.close_all().await;

    print_step_report(&report);
    Ok(if report.aborted() {
        EXIT_ABORTED
    } else if report.all_ok() {
        EXIT_OK
    } else {
        EXIT_PARTIAL
    })
}

async fn deploy(app: &App, template: Option<TemplateId>) -> Result<u8> {
    let (transport, dispatcher, topology) = app.connect().await?;
    let deployer = Deployer::new(dispatcher, &app.settings.staging_dir);
    let ids: Vec<TemplateId> = match template {
        Some(id) => vec![id],
        None => TemplateId::ALL.to_vec(),
    };

    let nodes = topology.all_nodes();
    let mut reports = Vec::with_capacity(ids.len());
    for id in ids {
        match deployer.deploy_template(id, &topology, &nodes).await {
            Ok(report) => reports.push(report),
            Err(e) => {
                transport.close_all().await;
                return Err(e.context(format!("deploying {}", id)));
            }
        }
    }
    transport.close_all().await;

    print_deploy(&reports);
    Ok(if reports.iter().all(|r| r.ok()) { EXIT_OK } else { EXIT_PARTIAL })
}

async fn exec(app: &App, command: &str) -> Result<u8> {
    let topology = app.declared_topology()?;
    let nodes = topology.all_nodes();
    let transport = app.ssh(None);
    let dispatcher = app.dispatcher(transport.clone(), &nodes).await;
    info!(strategy=?dispatcher.strategy(), command, "exec");
    let results = dispatcher.dispatch(command, &nodes).await;
    transport.close_all().await;

    print_exec(&results);
    Ok(if results.iter().all(|r| r.success()) { EXIT_OK } else { EXIT_PARTIAL })
}

fn runner_options(app: &App) -> RunnerOptions {
    RunnerOptions {
        grace: Duration::from_secs(app.settings.kill_grace_secs),
        ..RunnerOptions::default()
    }
}

async fn sync(app: &App) -> Result<u8> {
    let catalog = Catalog::new(app.file.benchmarks.clone())?;
    let topology = Arc::new(app.declared_topology()?);
    let transport = app.ssh(None);
    let dispatcher = app.dispatcher(transport.clone(), &topology.all_nodes()).await;
    let runner = BenchmarkRunner::new(topology, dispatcher, runner_options(app));
    let configs: Vec<_> = catalog.iter().cloned().collect();
    let report = runner.sync(&configs).await;
    transport.close_all().await;

    let report = report?;
    print_sync(&report);
    Ok(if report.ok() { EXIT_OK } else { EXIT_PARTIAL })
}

async fn run_benchmarks(
    app: &App,
    name: &str,
    processes: Option<u32>,
    timeout: Option<u64>,
    output: &std::path::Path,
    skip_sync: bool,
) -> Result<u8> {
    let catalog = Catalog::new(app.file.benchmarks.clone())?;
    let selected = catalog.select(name, processes, timeout)?;

    let (transport, dispatcher, topology) = app.connect().await?;
    if dispatcher.strategy() == DispatchStrategy::PerNode
        && selected.iter().any(|b| b.launch_mode == corral_common::LaunchMode::ParallelShell)
    {
        warn!("pdsh is not reachable on every node; parallel-shell benchmarks will likely fail");
    }
    let mut runner = BenchmarkRunner::new(topology, dispatcher, runner_options(app));

    if !skip_sync {
        let report = match runner.sync(&selected).await {
            Ok(r) => r,
            Err(e) => {
                transport.close_all().await;
                return Err(e);
            }
        };
        if !report.ok() {
            print_sync(&report);
            transport.close_all().await;
            error!(failed = report.failed().len(), "binary sync failed; not running");
            return Ok(run_exit_code(false, &[]));
        }
    }

    let results = runner.run_all(&selected).await;
    let exported = runner.export(output).await;
    transport.close_all().await;

    print_results(&results);
    exported?;
    println!("Results written to {}", output.display());
    Ok(run_exit_code(true, &results))
}

async fn cleanup_all(app: &App) -> Result<u8> {
    let topology = app.declared_topology()?;
    let nodes = topology.all_nodes();
    let transport = app.ssh(None);
    let dispatcher = app.dispatcher(transport.clone(), &nodes).await;

    let mut patterns: Vec<String> = DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect();
    for b in &app.file.benchmarks {
        if !patterns.contains(&b.binary_path) {
            patterns.push(b.binary_path.clone());
        }
    }
    let report = cleanup::sweep(&dispatcher, &patterns, &nodes).await;
    transport.close_all().await;

    print_cleanup(&report);
    if !report.clean() {
        warn!(remaining = report.remaining_total(), "processes survived cleanup");
    }
    Ok(EXIT_OK)
}
