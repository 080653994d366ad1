//! Configuration artifacts rendered from the topology.
//!
//! Rendering is a pure function of `(TemplateId, TemplateContext)`. Every node
//! gets the same cluster-wide parameters; the context's `local` entry carries
//! the bindings that differ per node.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use corral_common::util::sha256_hex;
use corral_common::{ClusterTopology, Node};

pub const MANAGED_HEADER: &str = "# Managed by corral. Local edits are overwritten.";
pub const HOSTS_BLOCK_BEGIN: &str = "# BEGIN corral managed block";
pub const HOSTS_BLOCK_END: &str = "# END corral managed block";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateId {
    HostsBlock,
    HostfileEven,
    HostfileOnePerNode,
    HostfileMaxCore,
    McaParams,
    SshConfig,
    SlurmConf,
}

impl TemplateId {
    pub const ALL: [TemplateId; 7] = [
        TemplateId::HostsBlock,
        TemplateId::HostfileEven,
        TemplateId::HostfileOnePerNode,
        TemplateId::HostfileMaxCore,
        TemplateId::McaParams,
        TemplateId::SshConfig,
        TemplateId::SlurmConf,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateId::HostsBlock => "hosts-block",
            TemplateId::HostfileEven => "hostfile-even",
            TemplateId::HostfileOnePerNode => "hostfile-one-per-node",
            TemplateId::HostfileMaxCore => "hostfile-max-core",
            TemplateId::McaParams => "mca-params",
            TemplateId::SshConfig => "ssh-config",
            TemplateId::SlurmConf => "slurm-conf",
        }
    }

    pub fn target_path(self) -> &'static str {
        match self {
            TemplateId::HostsBlock => "/etc/hosts",
            TemplateId::HostfileEven => "~/.corral/hostfile-even",
            TemplateId::HostfileOnePerNode => "~/.corral/hostfile-one-per-node",
            TemplateId::HostfileMaxCore => "~/.corral/hostfile-max-core",
            TemplateId::McaParams => "~/.openmpi/mca-params.conf",
            TemplateId::SshConfig => "~/.ssh/config",
            TemplateId::SlurmConf => "/etc/slurm/slurm.conf",
        }
    }

    pub fn privileged(self) -> bool {
        matches!(self, TemplateId::HostsBlock | TemplateId::SlurmConf)
    }

    pub fn mode(self) -> u32 {
        match self {
            TemplateId::SshConfig => 0o600,
            _ => 0o644,
        }
    }

    /// Templates written whole by the deployer. The hosts block is merged into
    /// an existing file instead.
    pub fn standalone(self) -> bool {
        self != TemplateId::HostsBlock
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TemplateId::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = TemplateId::ALL.iter().map(|t| t.as_str()).collect();
                format!("unknown template '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostEntry {
    pub ip: IpAddr,
    pub hostname: String,
    pub cpus: u32,
    pub master: bool,
}

impl From<&Node> for HostEntry {
    fn from(node: &Node) -> Self {
        Self {
            ip: node.ip,
            hostname: node.hostname.clone(),
            cpus: node.cpu_count,
            master: node.is_master(),
        }
    }
}

/// Everything a template may read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateContext {
    pub cluster_name: String,
    pub username: String,
    /// Master first.
    pub hosts: Vec<HostEntry>,
    pub multi_homed: bool,
    pub local: HostEntry,
    /// The operating user's home on the local node.
    pub home_dir: String,
}

impl TemplateContext {
    pub fn for_node(topology: &ClusterTopology, node: &Node) -> Self {
        Self {
            cluster_name: "corral".to_string(),
            username: topology.username.clone(),
            hosts: topology.nodes().map(HostEntry::from).collect(),
            multi_homed: topology.any_multi_homed(),
            local: HostEntry::from(node),
            home_dir: node
                .home_dir
                .clone()
                .unwrap_or_else(|| default_home(&topology.username)),
        }
    }

    fn master(&self) -> Option<&HostEntry> {
        self.hosts.iter().find(|h| h.master)
    }
}

/// One rendered file bound for one target path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateArtifact {
    pub template_id: TemplateId,
    #[serde(skip)]
    pub rendered_bytes: Vec<u8>,
    pub checksum: String,
    pub target_path: String,
    pub privileged: bool,
    pub mode: u32,
}

impl TemplateArtifact {
    pub fn new(template_id: TemplateId, rendered_bytes: Vec<u8>) -> Self {
        Self {
            checksum: sha256_hex(&rendered_bytes),
            target_path: template_id.target_path().to_string(),
            privileged: template_id.privileged(),
            mode: template_id.mode(),
            template_id,
            rendered_bytes,
        }
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.rendered_bytes)
    }
}

pub fn render(id: TemplateId, ctx: &TemplateContext) -> TemplateArtifact {
    let text = match id {
        TemplateId::HostsBlock => hosts_block(ctx),
        TemplateId::HostfileEven => {
            let slots = ctx.hosts.iter().map(|h| h.cpus).min().unwrap_or(1);
            hostfile(ctx, |_| slots)
        }
        TemplateId::HostfileOnePerNode => hostfile(ctx, |_| 1),
        TemplateId::HostfileMaxCore => hostfile(ctx, |h| h.cpus),
        TemplateId::McaParams => mca_params(ctx),
        TemplateId::SshConfig => ssh_config(ctx),
        TemplateId::SlurmConf => slurm_conf(ctx),
    };
    TemplateArtifact::new(id, text.into_bytes())
}

fn hosts_block(ctx: &TemplateContext) -> String {
    let mut out = format!("{HOSTS_BLOCK_BEGIN}\n");
    for h in &ctx.hosts {
        out.push_str(&format!("{}\t{}\n", h.ip, h.hostname));
    }
    out.push_str(HOSTS_BLOCK_END);
    out.push('\n');
    out
}

fn hostfile(ctx: &TemplateContext, slots: impl Fn(&HostEntry) -> u32) -> String {
    let mut out = format!("{MANAGED_HEADER}\n");
    for h in &ctx.hosts {
        out.push_str(&format!("{} slots={}\n", h.ip, slots(h).max(1)));
    }
    out
}

/// Used when the probe could not read `$HOME`.
fn default_home(username: &str) -> String {
    if username == "root" {
        "/root".to_string()
    } else {
        format!("/home/{username}")
    }
}

fn mca_params(ctx: &TemplateContext) -> String {
    let include = interface_selection(ctx);
    let mut out = format!("{MANAGED_HEADER}\n");
    out.push_str("btl = self,vader,tcp\n");
    out.push_str(&format!("btl_tcp_if_include = {include}\n"));
    out.push_str(&format!("oob_tcp_if_include = {include}\n"));
    out.push_str("plm_rsh_agent = ssh\n");
    out.push_str(&format!(
        "orte_default_hostfile = {}/.corral/hostfile-even\n",
        ctx.home_dir.trim_end_matches('/')
    ));
    out
}

/// Exact host address when any node is multi-homed, else the covering network.
fn interface_selection(ctx: &TemplateContext) -> String {
    if ctx.multi_homed {
        return host_cidr(ctx.local.ip);
    }
    let ips: Vec<IpAddr> = ctx.hosts.iter().map(|h| h.ip).collect();
    covering_cidr(&ips).unwrap_or_else(|| host_cidr(ctx.local.ip))
}

fn host_cidr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(_) => format!("{ip}/32"),
        IpAddr::V6(_) => format!("{ip}/128"),
    }
}

/// Smallest network containing every address. `None` for mixed families.
pub fn covering_cidr(ips: &[IpAddr]) -> Option<String> {
    let first = *ips.first()?;
    match first {
        IpAddr::V4(_) => {
            let mut bits = Vec::with_capacity(ips.len());
            for ip in ips {
                match ip {
                    IpAddr::V4(v4) => bits.push(u32::from(*v4)),
                    IpAddr::V6(_) => return None,
                }
            }
            let diff = bits.iter().fold(0u32, |acc, b| acc | (b ^ bits[0]));
            let prefix = diff.leading_zeros();
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            let net = std::net::Ipv4Addr::from(bits[0] & mask);
            Some(format!("{net}/{prefix}"))
        }
        IpAddr::V6(_) => {
            let mut bits = Vec::with_capacity(ips.len());
            for ip in ips {
                match ip {
                    IpAddr::V6(v6) => bits.push(u128::from(*v6)),
                    IpAddr::V4(_) => return None,
                }
            }
            let diff = bits.iter().fold(0u128, |acc, b| acc | (b ^ bits[0]));
            let prefix = diff.leading_zeros();
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            let net = std::net::Ipv6Addr::from(bits[0] & mask);
            Some(format!("{net}/{prefix}"))
        }
    }
}

fn ssh_config(ctx: &TemplateContext) -> String {
    let mut out = format!("{MANAGED_HEADER}\n");
    for h in &ctx.hosts {
        out.push_str(&format!(
            "\nHost {name} {ip}\n    HostName {ip}\n    User {user}\n    IdentityFile ~/.ssh/id_ed25519\n    StrictHostKeyChecking accept-new\n    ControlMaster auto\n    ControlPath ~/.ssh/cm-%r@%h:%p\n    ControlPersist 10m\n",
            name = h.hostname,
            ip = h.ip,
            user = ctx.username,
        ));
    }
    out
}

fn slurm_conf(ctx: &TemplateContext) -> String {
    let mut out = format!("{MANAGED_HEADER}\n");
    out.push_str(&format!("ClusterName={}\n", ctx.cluster_name));
    if let Some(m) = ctx.master() {
        out.push_str(&format!("SlurmctldHost={}({})\n", m.hostname, m.ip));
    }
    out.push_str(
        "MpiDefault=none\n\
         ProctrackType=proctrack/linuxproc\n\
         ReturnToService=2\n\
         SchedulerType=sched/backfill\n\
         SelectType=select/cons_tres\n\
         SlurmctldPidFile=/run/slurmctld.pid\n\
         SlurmdPidFile=/run/slurmd.pid\n\
         SlurmdSpoolDir=/var/spool/slurmd\n\
         StateSaveLocation=/var/spool/slurmctld\n\
         TaskPlugin=task/none\n",
    );
    for h in &ctx.hosts {
        out.push_str(&format!(
            "NodeName={} NodeAddr={} CPUs={} State=UNKNOWN\n",
            h.hostname, h.ip, h.cpus
        ));
    }
    let names: Vec<&str> = ctx.hosts.iter().map(|h| h.hostname.as_str()).collect();
    out.push_str(&format!(
        "PartitionName=all Nodes={} Default=YES MaxTime=INFINITE State=UP\n",
        names.join(",")
    ));
    out
}

/// Replace (or append) the managed block inside an existing hosts file,
/// leaving every other line as it was.
pub fn merge_managed_block(existing: &str, block: &str) -> String {
    let mut out = String::with_capacity(existing.len() + block.len());
    let mut inside = false;
    let mut replaced = false;
    for line in existing.lines() {
        if line.trim() == HOSTS_BLOCK_BEGIN {
            inside = true;
            if !replaced {
                out.push_str(block);
                replaced = true;
            }
            continue;
        }
        if inside {
            if line.trim() == HOSTS_BLOCK_END {
                inside = false;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !replaced {
        out.push_str(block);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use corral_common::{NodeSpec, TopologyInput};

    fn topology(extra: bool) -> ClusterTopology {
        let spec = |ip: &str, name: &str, cpus: u32| NodeSpec {
            ip: ip.parse().unwrap(),
            name: name.into(),
            os_hint: Some("ubuntu".into()),
            cpus: Some(cpus),
            extra_addresses: vec![],
        };
        let mut b = spec("192.168.1.11", "b", 8);
        if extra {
            b.extra_addresses = vec!["10.8.0.11".parse().unwrap()];
        }
        TopologyInput {
            master: spec("192.168.1.10", "a", 4),
            workers: vec![b, spec("192.168.1.20", "c", 16)],
            username: "hpc".into(),
        }
        .build(&HashMap::new())
        .unwrap()
    }

    fn ctx(topo: &ClusterTopology, idx: usize) -> TemplateContext {
        let node = topo.all_nodes()[idx].clone();
        TemplateContext::for_node(topo, &node)
    }

    #[test]
    fn test_render_is_pure() {
        let topo = topology(false);
        let c = ctx(&topo, 1);
        for id in TemplateId::ALL {
            let a = render(id, &c);
            let b = render(id, &c.clone());
            assert_eq!(a.rendered_bytes, b.rendered_bytes, "{id}");
            assert_eq!(a.checksum, b.checksum);
        }
    }

    #[test]
    fn test_hostfile_variants() {
        let topo = topology(false);
        let c = ctx(&topo, 0);
        assert_eq!(
            render(TemplateId::HostfileEven, &c).as_str(),
            format!("{MANAGED_HEADER}\n192.168.1.10 slots=4\n192.168.1.11 slots=4\n192.168.1.20 slots=4\n")
        );
        assert!(render(TemplateId::HostfileOnePerNode, &c)
            .as_str()
            .contains("192.168.1.20 slots=1\n"));
        let max = render(TemplateId::HostfileMaxCore, &c);
        assert!(max.as_str().contains("192.168.1.11 slots=8\n"));
        assert!(max.as_str().contains("192.168.1.20 slots=16\n"));
    }

    #[test]
    fn test_mca_uses_covering_network_on_single_homed_cluster() {
        let topo = topology(false);
        let a = render(TemplateId::McaParams, &ctx(&topo, 0));
        let b = render(TemplateId::McaParams, &ctx(&topo, 1));
        assert!(a.as_str().contains("btl_tcp_if_include = 192.168.1.0/27\n"));
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn test_mca_hostfile_follows_home_dir() {
        let topo = topology(false);
        let a = render(TemplateId::McaParams, &ctx(&topo, 0));
        assert!(a.as_str().contains("orte_default_hostfile = /home/hpc/.corral/hostfile-even\n"));

        let node = topo.master.clone().with_home_dir(Some("/data/users/hpc/".into()));
        let probed = render(TemplateId::McaParams, &TemplateContext::for_node(&topo, &node));
        assert!(probed
            .as_str()
            .contains("orte_default_hostfile = /data/users/hpc/.corral/hostfile-even\n"));
        assert_eq!(default_home("root"), "/root");
    }

    #[test]
    fn test_privileged_templates_are_allow_listed() {
        for id in TemplateId::ALL.iter().filter(|t| t.privileged()) {
            assert!(
                corral_exec::session::PRIVILEGED_TARGETS.contains(&(id.target_path(), id.mode())),
                "{id} writes a root-owned file the sudo policy does not cover"
            );
        }
    }

    #[test]
    fn test_mca_pins_exact_address_when_multi_homed() {
        let topo = topology(true);
        let a = render(TemplateId::McaParams, &ctx(&topo, 0));
        let b = render(TemplateId::McaParams, &ctx(&topo, 1));
        assert!(a.as_str().contains("btl_tcp_if_include = 192.168.1.10/32\n"));
        assert!(a.as_str().contains("oob_tcp_if_include = 192.168.1.10/32\n"));
        assert!(b.as_str().contains("btl_tcp_if_include = 192.168.1.11/32\n"));
        assert!(!b.as_str().contains("10.8.0.11"));
        assert_ne!(a.checksum, b.checksum);
    }

    #[test]
    fn test_covering_cidr() {
        let ips = |l: &[&str]| l.iter().map(|s| s.parse().unwrap()).collect::<Vec<IpAddr>>();
        assert_eq!(covering_cidr(&ips(&["10.0.0.1", "10.0.0.2"])).unwrap(), "10.0.0.0/30");
        assert_eq!(covering_cidr(&ips(&["10.0.0.7"])).unwrap(), "10.0.0.7/32");
        assert_eq!(covering_cidr(&ips(&["10.0.0.1", "138.0.0.1"])).unwrap(), "0.0.0.0/0");
        assert_eq!(covering_cidr(&ips(&["fd00::1", "fd00::2"])).unwrap(), "fd00::/126");
        assert!(covering_cidr(&ips(&["10.0.0.1", "fd00::1"])).is_none());
        assert!(covering_cidr(&[]).is_none());
    }

    #[test]
    fn test_ssh_and_slurm_config() {
        let topo = topology(false);
        let ssh = render(TemplateId::SshConfig, &ctx(&topo, 2));
        assert!(ssh.as_str().contains("Host b 192.168.1.11\n    HostName 192.168.1.11\n    User hpc\n"));
        assert!(ssh.as_str().contains("ControlMaster auto"));
        assert_eq!(ssh.mode, 0o600);

        let slurm = render(TemplateId::SlurmConf, &ctx(&topo, 2));
        assert!(slurm.privileged);
        assert!(slurm.as_str().contains("SlurmctldHost=a(192.168.1.10)\n"));
        assert!(slurm.as_str().contains("NodeName=c NodeAddr=192.168.1.20 CPUs=16 State=UNKNOWN\n"));
        assert!(slurm.as_str().contains("PartitionName=all Nodes=a,b,c Default=YES"));
    }

    #[test]
    fn test_merge_managed_block() {
        let topo = topology(false);
        let block = render(TemplateId::HostsBlock, &ctx(&topo, 0)).as_str().into_owned();
        let original = "127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost\n";

        let merged = merge_managed_block(original, &block);
        assert!(merged.starts_with(original));
        assert!(merged.ends_with(&block));
        assert_eq!(merge_managed_block(&merged, &block), merged);

        let stale = format!("{original}{HOSTS_BLOCK_BEGIN}\n10.9.9.9\told\n{HOSTS_BLOCK_END}\n# trailing\n");
        let fixed = merge_managed_block(&stale, &block);
        assert!(!fixed.contains("10.9.9.9"));
        assert!(fixed.ends_with("# trailing\n"));
        assert!(fixed.contains("192.168.1.20\tc\n"));
    }

    #[test]
    fn test_template_id_parse() {
        assert_eq!("mca-params".parse::<TemplateId>().unwrap(), TemplateId::McaParams);
        assert!("nope".parse::<TemplateId>().is_err());
    }
}
