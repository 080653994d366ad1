//! The built-in setup sequence.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use corral_common::{ClusterError, Node, PackageManager};
use corral_exec::remote_path;

use crate::deploy::DeployOutcome;
use crate::step::{Step, StepContext};
use crate::template::TemplateId;

/// Fixed order; ids match positions.
pub fn builtin_steps() -> Vec<Arc<dyn Step>> {
    vec![
        Arc::new(PrivilegeEscalation),
        Arc::new(TemplateStep::new(1, "hosts-file", &[TemplateId::HostsBlock])),
        Arc::new(PackageStep::base()),
        Arc::new(PackageStep::mpi()),
        Arc::new(TemplateStep::new(4, "ssh-client-config", &[TemplateId::SshConfig])),
        Arc::new(TemplateStep::new(
            5,
            "hostfiles",
            &[
                TemplateId::HostfileEven,
                TemplateId::HostfileOnePerNode,
                TemplateId::HostfileMaxCore,
            ],
        )),
        Arc::new(TemplateStep::new(6, "mca-params", &[TemplateId::McaParams])),
        Arc::new(TemplateStep::new(7, "workload-manager-config", &[TemplateId::SlurmConf])),
        Arc::new(BenchmarkDir),
    ]
}

/// Passwordless sudo for the allow-list. Everything after depends on it.
pub struct PrivilegeEscalation;

const SUDO_PROBE: &str = "sudo -n true";

#[async_trait]
impl Step for PrivilegeEscalation {
    fn id(&self) -> u32 {
        0
    }

    fn name(&self) -> &str {
        "privilege-escalation"
    }

    fn fatal(&self) -> bool {
        true
    }

    async fn is_satisfied(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<bool> {
        ctx.succeeds(node, SUDO_PROBE).await
    }

    async fn apply(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<()> {
        let Some(session) = &ctx.session else {
            return Err(ClusterError::PrivilegeDenied { node: node.label() }.into());
        };
        if let Err(e) = session.install_sudo_policy(node).await {
            warn!(node=%node.ip, error=%format!("{e:#}"), "installing sudo policy failed");
            return Err(ClusterError::PrivilegeDenied { node: node.label() }.into());
        }
        Ok(())
    }

    async fn verify(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<bool> {
        ctx.succeeds(node, SUDO_PROBE).await
    }
}

/// Deploys one or more templates through the checksum-verified deployer.
pub struct TemplateStep {
    id: u32,
    name: &'static str,
    templates: Vec<TemplateId>,
}

impl TemplateStep {
    pub fn new(id: u32, name: &'static str, templates: &[TemplateId]) -> Self {
        Self {
            id,
            name,
            templates: templates.to_vec(),
        }
    }

    async fn all_current(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<bool> {
        for id in &self.templates {
            let artifact = ctx.deployer.artifact_for(*id, &ctx.topology, node).await?;
            if !ctx.deployer.matches(node, &artifact).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Step for TemplateStep {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        self.name
    }

    async fn is_satisfied(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<bool> {
        self.all_current(ctx, node).await
    }

    async fn apply(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<()> {
        for id in &self.templates {
            let report = ctx
                .deployer
                .deploy_template(*id, &ctx.topology, std::slice::from_ref(node))
                .await?;
            for failed in report.failed_nodes() {
                match &failed.outcome {
                    DeployOutcome::Degraded { error } => return Err(error.clone().into()),
                    DeployOutcome::Failed { reason } => anyhow::bail!("{id}: {reason}"),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn verify(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<bool> {
        self.all_current(ctx, node).await
    }
}

/// Installs a package set with the node's own package manager.
pub struct PackageStep {
    id: u32,
    name: &'static str,
    packages: fn(PackageManager) -> &'static [&'static str],
    /// Packages that must not coexist with this set.
    conflicts: fn(PackageManager) -> &'static [&'static str],
}

impl PackageStep {
    pub fn base() -> Self {
        Self {
            id: 2,
            name: "base-packages",
            packages: base_packages,
            conflicts: |_| &[],
        }
    }

    pub fn mpi() -> Self {
        Self {
            id: 3,
            name: "mpi-runtime",
            packages: mpi_packages,
            conflicts: mpi_conflicts,
        }
    }

    fn query(&self, node: &Node) -> anyhow::Result<String> {
        node.package_manager
            .query_command((self.packages)(node.package_manager))
            .ok_or_else(|| anyhow::anyhow!("no supported package manager on {}", node.label()))
    }

    /// A second runtime is reported, never removed automatically.
    async fn check_conflicts(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<()> {
        let pm = node.package_manager;
        let wanted = (self.packages)(pm);
        for pkg in (self.conflicts)(pm) {
            let Some(cmd) = pm.query_command(&[*pkg]) else {
                continue;
            };
            if ctx.succeeds(node, &cmd).await? {
                return Err(ClusterError::PackageManagerMismatch {
                    node: node.label(),
                    detail: format!("{pkg} is installed alongside {}; remove one before continuing", wanted.join(" ")),
                }
                .into());
            }
        }
        Ok(())
    }
}

fn base_packages(pm: PackageManager) -> &'static [&'static str] {
    match pm {
        PackageManager::Apt => &["build-essential", "openssh-client", "openssh-server", "pdsh"],
        PackageManager::Dnf => &["gcc", "gcc-c++", "make", "openssh-clients", "openssh-server", "pdsh"],
        PackageManager::Unknown => &[],
    }
}

fn mpi_packages(pm: PackageManager) -> &'static [&'static str] {
    match pm {
        PackageManager::Apt => &["openmpi-bin", "libopenmpi-dev"],
        PackageManager::Dnf => &["openmpi", "openmpi-devel"],
        PackageManager::Unknown => &[],
    }
}

fn mpi_conflicts(pm: PackageManager) -> &'static [&'static str] {
    match pm {
        PackageManager::Apt => &["mpich", "libmpich-dev"],
        PackageManager::Dnf => &["mpich", "mpich-devel"],
        PackageManager::Unknown => &[],
    }
}

#[async_trait]
impl Step for PackageStep {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        self.name
    }

    async fn is_satisfied(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<bool> {
        self.check_conflicts(ctx, node).await?;
        let query = self.query(node)?;
        ctx.succeeds(node, &query).await
    }

    async fn apply(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<()> {
        let packages = (self.packages)(node.package_manager);
        let cmd = node
            .package_manager
            .install_command(packages)
            .ok_or_else(|| anyhow::anyhow!("no supported package manager on {}", node.label()))?;
        info!(node=%node.ip, manager=?node.package_manager, packages=%packages.join(" "), "installing packages");
        let res = ctx.run(node, &cmd).await?;
        if !res.success() {
            anyhow::bail!(
                "{} exited {}: {}",
                node.package_manager.binary(),
                res.exit_code,
                res.stderr.trim()
            );
        }
        Ok(())
    }

    async fn verify(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<bool> {
        let query = self.query(node)?;
        ctx.succeeds(node, &query).await
    }
}

/// The directory benchmark binaries are synchronized into.
pub struct BenchmarkDir;

#[async_trait]
impl Step for BenchmarkDir {
    fn id(&self) -> u32 {
        8
    }

    fn name(&self) -> &str {
        "benchmark-dir"
    }

    async fn is_satisfied(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<bool> {
        ctx.succeeds(node, &format!("test -d {}", remote_path(&ctx.benchmark_dir)))
            .await
    }

    async fn apply(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<()> {
        let res = ctx
            .run(node, &format!("mkdir -p {}", remote_path(&ctx.benchmark_dir)))
            .await?;
        if !res.success() {
            anyhow::bail!("mkdir failed: {}", res.stderr.trim());
        }
        Ok(())
    }

    async fn verify(&self, ctx: &StepContext, node: &Node) -> anyhow::Result<bool> {
        self.is_satisfied(ctx, node).await
    }
}
