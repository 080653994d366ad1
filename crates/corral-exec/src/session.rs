//! Passwordless ssh and sudo across the whole node mesh.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use corral_common::{ClusterError, ClusterTopology, Node};

use crate::dispatch::Dispatcher;
use crate::ssh::parent_dir;
use crate::transport::{Transport, TransportError, WriteOptions};

pub const PRIVATE_KEY_PATH: &str = "~/.ssh/id_ed25519";
pub const PUBLIC_KEY_PATH: &str = "~/.ssh/id_ed25519.pub";
pub const AUTHORIZED_KEYS_PATH: &str = "~/.ssh/authorized_keys";
pub const KNOWN_HOSTS_PATH: &str = "~/.ssh/known_hosts";
pub const HOST_KEY_PATH: &str = "/etc/ssh/ssh_host_ed25519_key.pub";
const STAGED_POLICY_PATH: &str = "~/.corral/sudoers.staged";

/// Root-owned files corral writes, with their modes. A privileged write runs
/// exactly `mkdir -p <dir>`, `tee <path>` and `chmod <mode> <path>`, so the
/// sudo policy grants those argument lists and nothing wider.
pub const PRIVILEGED_TARGETS: &[(&str, u32)] = &[("/etc/hosts", 0o644), ("/etc/slurm/slurm.conf", 0o644)];

const PACKAGE_MANAGERS: &[&str] = &["/usr/bin/apt-get", "/usr/bin/dnf"];

/// Both usr-merged and split layouts.
const BIN_DIRS: &[&str] = &["/usr/bin", "/bin"];

/// Commands the operating user may run through `sudo -n`. Everything except
/// the package managers is pinned to its exact arguments.
pub fn sudo_allow_list() -> Vec<String> {
    let mut out: Vec<String> = PACKAGE_MANAGERS.iter().map(|p| p.to_string()).collect();
    for dir in BIN_DIRS {
        // `""` forbids arguments
        out.push(format!("{dir}/true \"\""));
        for (path, mode) in PRIVILEGED_TARGETS {
            if let Some(parent) = parent_dir(path) {
                out.push(format!("{dir}/mkdir -p {parent}"));
            }
            out.push(format!("{dir}/tee {path}"));
            out.push(format!("{dir}/chmod {mode:o} {path}"));
        }
    }
    let mut seen = BTreeSet::new();
    out.retain(|c| seen.insert(c.clone()));
    out
}

/// The operator's login. Built once at startup and passed by reference.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeMeshOutcome {
    pub node: String,
    pub ip: String,
    pub public_key: bool,
    pub authorized_keys: bool,
    pub known_hosts: bool,
    pub sudo_policy: bool,
    pub errors: Vec<String>,
}

impl NodeMeshOutcome {
    pub fn complete(&self) -> bool {
        self.public_key && self.authorized_keys && self.known_hosts && self.sudo_policy
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MeshReport {
    pub nodes: Vec<NodeMeshOutcome>,
}

impl MeshReport {
    pub fn complete(&self) -> bool {
        self.nodes.iter().all(|n| n.complete())
    }

    pub fn failed_nodes(&self) -> Vec<&NodeMeshOutcome> {
        self.nodes.iter().filter(|n| !n.complete()).collect()
    }
}

pub struct Session {
    credentials: Credentials,
    dispatcher: Arc<Dispatcher>,
}

impl Session {
    pub fn new(credentials: Credentials, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            credentials,
            dispatcher,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Sudoers drop-in granting the operating user the allow-list only.
    pub fn sudo_policy(&self) -> String {
        let user = self.credentials.username();
        let mut out = String::new();
        out.push_str("# Managed by corral. Changes are overwritten.\n");
        out.push_str(&format!("Defaults:{user} env_keep += \"DEBIAN_FRONTEND\"\n"));
        out.push_str(&format!("Cmnd_Alias CORRAL_CMDS = {}\n", sudo_allow_list().join(", ")));
        out.push_str(&format!("{user} ALL=(root) NOPASSWD: CORRAL_CMDS\n"));
        out
    }

    pub fn sudo_policy_path(&self) -> String {
        format!("/etc/sudoers.d/corral-{}", self.credentials.username())
    }

    /// Keys, host keys and sudo policy on every node. A node that fails is
    /// recorded and the rest carry on.
    pub async fn establish_mesh(&self, topology: &ClusterTopology) -> MeshReport {
        let nodes = topology.all_nodes();
        let transport = self.dispatcher.transport().clone();
        info!(nodes = nodes.len(), "establishing ssh mesh");

        // Phase 1: every node owns a keypair; collect public and host keys.
        let collected = self
            .dispatcher
            .for_each_node(&nodes, |node| {
                let transport = transport.clone();
                async move {
                    let mut outcome = NodeMeshOutcome {
                        node: node.hostname.clone(),
                        ip: node.ip.to_string(),
                        ..Default::default()
                    };
                    let public_key = match ensure_keypair(transport.as_ref(), &node).await {
                        Ok(key) => {
                            outcome.public_key = true;
                            Some(key)
                        }
                        Err(e) => {
                            outcome.errors.push(format!("keypair: {e}"));
                            None
                        }
                    };
                    let host_key = match transport.read_file(&node, HOST_KEY_PATH).await {
                        Ok(Some(bytes)) => Some(known_hosts_line(&node, &String::from_utf8_lossy(&bytes))),
                        Ok(None) => {
                            outcome.errors.push(format!("host key: {HOST_KEY_PATH} missing"));
                            None
                        }
                        Err(e) => {
                            outcome.errors.push(format!("host key: {e}"));
                            None
                        }
                    };
                    (outcome, public_key, host_key)
                }
            })
            .await;

        let all_keys: Vec<String> = collected.iter().filter_map(|(_, k, _)| k.clone()).collect();
        let all_hosts: Vec<String> = collected.iter().filter_map(|(_, _, h)| h.clone()).collect();
        let mut outcomes: Vec<NodeMeshOutcome> = collected.into_iter().map(|(o, _, _)| o).collect();

        // Phase 2: full mesh of authorized keys and known hosts.
        let all_keys = Arc::new(all_keys);
        let all_hosts = Arc::new(all_hosts);
        let distributed = self
            .dispatcher
            .for_each_node(&nodes, |node| {
                let transport = transport.clone();
                let all_keys = all_keys.clone();
                let all_hosts = all_hosts.clone();
                async move {
                    let keys = merge_lines(transport.as_ref(), &node, AUTHORIZED_KEYS_PATH, &all_keys, 0o600).await;
                    let hosts = merge_lines(transport.as_ref(), &node, KNOWN_HOSTS_PATH, &all_hosts, 0o644).await;
                    (keys, hosts)
                }
            })
            .await;

        // Phase 3: sudo policy, validated before it goes live.
        let policy = Arc::new(self.sudo_policy());
        let policy_path = Arc::new(self.sudo_policy_path());
        let sudo = self
            .dispatcher
            .for_each_node(&nodes, |node| {
                let transport = transport.clone();
                let policy = policy.clone();
                let policy_path = policy_path.clone();
                async move { install_sudo_policy(transport.as_ref(), &node, &policy, &policy_path).await }
            })
            .await;

        for ((outcome, (keys, hosts)), sudo) in outcomes.iter_mut().zip(distributed).zip(sudo) {
            match keys {
                Ok(()) => outcome.authorized_keys = true,
                Err(e) => outcome.errors.push(format!("authorized_keys: {e}")),
            }
            match hosts {
                Ok(()) => outcome.known_hosts = true,
                Err(e) => outcome.errors.push(format!("known_hosts: {e}")),
            }
            match sudo {
                Ok(()) => outcome.sudo_policy = true,
                Err(e) => outcome.errors.push(format!("sudo policy: {e}")),
            }
            if !outcome.complete() {
                warn!(node=%outcome.ip, errors=?outcome.errors, "mesh incomplete on node");
            }
        }

        let report = MeshReport { nodes: outcomes };
        info!(
            complete = report.complete(),
            failed = report.failed_nodes().len(),
            "ssh mesh finished"
        );
        report
    }

    /// Install the sudo policy on one node.
    pub async fn install_sudo_policy(&self, node: &Node) -> anyhow::Result<()> {
        install_sudo_policy(
            self.dispatcher.transport().as_ref(),
            node,
            &self.sudo_policy(),
            &self.sudo_policy_path(),
        )
        .await
    }

    /// Per node: reachable, and able to escalate without a prompt.
    pub async fn check_access(&self, nodes: &[Node]) -> Vec<(Node, Result<(), ClusterError>)> {
        let results = self.dispatcher.dispatch("sudo -n true", nodes).await;
        nodes
            .iter()
            .cloned()
            .zip(results)
            .map(|(node, res)| {
                let outcome = if res.success() {
                    Ok(())
                } else if res.connection_failed() {
                    Err(ClusterError::ConnectionFailed {
                        node: node.label(),
                        reason: res.stderr.trim().to_string(),
                    })
                } else {
                    Err(ClusterError::PrivilegeDenied { node: node.label() })
                };
                (node, outcome)
            })
            .collect()
    }
}

async fn ensure_keypair(transport: &dyn Transport, node: &Node) -> anyhow::Result<String> {
    let cmd = format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && {{ test -f {PRIVATE_KEY_PATH} || ssh-keygen -q -t ed25519 -N '' -C corral@{} -f {PRIVATE_KEY_PATH}; }}",
        node.hostname
    );
    let out = transport
        .exec(node, &cmd, std::time::Duration::from_secs(60))
        .await?;
    if !out.success() {
        anyhow::bail!("ssh-keygen failed: {}", out.stderr.trim());
    }
    match transport.read_file(node, PUBLIC_KEY_PATH).await? {
        Some(bytes) => {
            let key = String::from_utf8_lossy(&bytes).trim().to_string();
            if key.is_empty() {
                anyhow::bail!("{PUBLIC_KEY_PATH} is empty");
            }
            Ok(key)
        }
        None => anyhow::bail!("{PUBLIC_KEY_PATH} missing after keygen"),
    }
}

/// `ip,hostname type key` for a host key file's first line.
fn known_hosts_line(node: &Node, host_key: &str) -> String {
    let mut parts = host_key.split_whitespace();
    let kind = parts.next().unwrap_or_default();
    let key = parts.next().unwrap_or_default();
    format!("{},{} {} {}", node.ip, node.hostname, kind, key)
}

/// Append missing lines to a file, writing only when something changed.
async fn merge_lines(
    transport: &dyn Transport,
    node: &Node,
    path: &str,
    wanted: &[String],
    mode: u32,
) -> Result<(), TransportError> {
    let existing = transport
        .read_file(node, path)
        .await?
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    let merged = merge_line_sets(&existing, wanted);
    if merged == existing {
        return Ok(());
    }
    transport
        .write_file(node, path, merged.as_bytes(), WriteOptions::mode(mode))
        .await
}

pub(crate) fn merge_line_sets(existing: &str, wanted: &[String]) -> String {
    let present: BTreeSet<&str> = existing.lines().map(|l| l.trim()).collect();
    let mut out = existing.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    let mut added = BTreeSet::new();
    for line in wanted {
        let line = line.trim();
        if line.is_empty() || present.contains(line) || !added.insert(line) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

async fn install_sudo_policy(
    transport: &dyn Transport,
    node: &Node,
    policy: &str,
    policy_path: &str,
) -> anyhow::Result<()> {
    transport
        .write_file(node, STAGED_POLICY_PATH, policy.as_bytes(), WriteOptions::mode(0o600))
        .await?;
    let check = transport
        .exec(
            node,
            &format!("visudo -cf {STAGED_POLICY_PATH}"),
            std::time::Duration::from_secs(30),
        )
        .await?;
    if !check.success() {
        anyhow::bail!("policy rejected by visudo: {}", check.stderr.trim());
    }
    transport
        .write_file(node, policy_path, policy.as_bytes(), WriteOptions::privileged(0o440))
        .await?;
    let verify = transport
        .exec(node, "sudo -n true", std::time::Duration::from_secs(30))
        .await?;
    if !verify.success() {
        anyhow::bail!("sudo still prompts after installing {policy_path}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use corral_common::{NodeSpec, TopologyInput};

    use crate::dispatch::DispatchOptions;
    use crate::memory::MemoryCluster;
    use crate::transport::ExecOutput;

    fn topology() -> ClusterTopology {
        let spec = |ip: &str, name: &str| NodeSpec {
            ip: ip.parse().unwrap(),
            name: name.into(),
            os_hint: Some("ubuntu".into()),
            cpus: Some(2),
            extra_addresses: vec![],
        };
        TopologyInput {
            master: spec("10.0.0.1", "a"),
            workers: vec![spec("10.0.0.2", "b"), spec("10.0.0.3", "c")],
            username: "hpc".into(),
        }
        .build(&HashMap::new())
        .unwrap()
    }

    async fn cluster(topo: &ClusterTopology) -> MemoryCluster {
        let c = MemoryCluster::from_topology(topo);
        for n in topo.nodes() {
            let key = format!("ssh-ed25519 HOST{} root@{}\n", n.hostname, n.hostname);
            c.update(n.ip, |s| {
                s.files.insert(HOST_KEY_PATH.to_string(), key.into_bytes());
            })
            .await;
        }
        c.on_command("ssh-keygen", |_, sim| {
            let key = format!("ssh-ed25519 USER{} corral@{}\n", sim.hostname, sim.hostname);
            sim.files.entry(PUBLIC_KEY_PATH.to_string()).or_insert(key.into_bytes());
            ExecOutput::ok("")
        })
        .await;
        c
    }

    fn session(c: &MemoryCluster) -> Session {
        let dispatcher = Dispatcher::per_node(Arc::new(c.clone()), DispatchOptions::default());
        Session::new(Credentials::new("hpc", "secret"), Arc::new(dispatcher))
    }

    #[tokio::test]
    async fn test_full_mesh() {
        let topo = topology();
        let c = cluster(&topo).await;
        let report = session(&c).establish_mesh(&topo).await;
        assert!(report.complete(), "{:?}", report);

        for n in topo.nodes() {
            let sim = c.snapshot(n.ip).await.unwrap();
            let keys = sim.file_string(AUTHORIZED_KEYS_PATH).unwrap();
            assert_eq!(keys.lines().count(), 3);
            for other in topo.nodes() {
                assert!(keys.contains(&format!("USER{}", other.hostname)));
            }
            let hosts = sim.file_string(KNOWN_HOSTS_PATH).unwrap();
            assert!(hosts.contains("10.0.0.2,b ssh-ed25519 HOSTb"));
            let policy = sim.file_string("/etc/sudoers.d/corral-hpc").unwrap();
            assert!(policy.contains("hpc ALL=(root) NOPASSWD: CORRAL_CMDS"));
            assert!(!policy.contains("NOPASSWD: ALL"));
            assert!(policy.contains("/usr/bin/tee /etc/hosts"));
            assert!(policy.contains("/bin/chmod 644 /etc/slurm/slurm.conf"));
        }
    }

    #[test]
    fn test_allow_list_pins_arguments() {
        let list = sudo_allow_list();
        for bare in ["/usr/bin/tee", "/bin/tee", "/usr/bin/chmod", "/usr/bin/mkdir", "/usr/bin/true", "/usr/bin/pkill"] {
            assert!(!list.iter().any(|c| c == bare), "{bare} is granted without arguments");
        }
        assert!(!list.iter().any(|c| c.contains("systemctl") || c.contains("sudoers")));
        assert!(list.contains(&"/usr/bin/mkdir -p /etc/slurm".to_string()));
        assert!(list.contains(&"/usr/bin/true \"\"".to_string()));
        assert_eq!(list.iter().filter(|c| *c == "/usr/bin/mkdir -p /etc").count(), 1);
    }

    #[tokio::test]
    async fn test_mesh_is_idempotent() {
        let topo = topology();
        let c = cluster(&topo).await;
        let s = session(&c);
        s.establish_mesh(&topo).await;
        let writes = c.snapshot(topo.master.ip).await.unwrap().writes;
        let report = s.establish_mesh(&topo).await;
        assert!(report.complete());
        let sim = c.snapshot(topo.master.ip).await.unwrap();
        assert_eq!(sim.file_string(AUTHORIZED_KEYS_PATH).unwrap().lines().count(), 3);
        // only the staged and installed policy are rewritten
        assert_eq!(sim.writes, writes + 2);
    }

    #[tokio::test]
    async fn test_one_unreachable_node_does_not_abort() {
        let topo = topology();
        let c = cluster(&topo).await;
        c.update(topo.workers[1].ip, |s| s.reachable = false).await;
        let report = session(&c).establish_mesh(&topo).await;

        assert!(!report.complete());
        assert_eq!(report.failed_nodes().len(), 1);
        assert_eq!(report.failed_nodes()[0].ip, "10.0.0.3");

        let sim = c.snapshot(topo.master.ip).await.unwrap();
        let keys = sim.file_string(AUTHORIZED_KEYS_PATH).unwrap();
        assert_eq!(keys.lines().count(), 2);
        assert!(report.nodes[0].complete());
    }

    #[tokio::test]
    async fn test_rejected_policy_is_not_installed() {
        let topo = topology();
        let c = cluster(&topo).await;
        c.on_command("visudo", |_, _| ExecOutput::failed(1, "syntax error")).await;
        let report = session(&c).establish_mesh(&topo).await;
        assert!(report.nodes.iter().all(|n| !n.sudo_policy && n.authorized_keys));
        let sim = c.snapshot(topo.master.ip).await.unwrap();
        assert!(sim.file_string("/etc/sudoers.d/corral-hpc").is_none());
    }

    #[tokio::test]
    async fn test_check_access_classifies_failures() {
        let topo = topology();
        let c = cluster(&topo).await;
        c.update(topo.workers[0].ip, |s| s.reachable = false).await;
        c.on_command("sudo -n true", |_, sim| {
            if sim.hostname == "c" {
                ExecOutput::failed(1, "a password is required")
            } else {
                ExecOutput::ok("")
            }
        })
        .await;
        let res = session(&c).check_access(&topo.all_nodes()).await;
        assert!(res[0].1.is_ok());
        assert!(matches!(res[1].1, Err(ClusterError::ConnectionFailed { .. })));
        assert!(matches!(res[2].1, Err(ClusterError::PrivilegeDenied { .. })));
    }

    #[test]
    fn test_merge_line_sets() {
        let merged = merge_line_sets("a\nb", &["b".into(), "c".into(), "c".into(), "".into()]);
        assert_eq!(merged, "a\nb\nc\n");
        assert_eq!(merge_line_sets("", &["x".into()]), "x\n");
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let c = Credentials::new("hpc", "hunter2");
        assert!(!format!("{:?}", c).contains("hunter2"));
    }
}
