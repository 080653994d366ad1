//! Live discovery of per-node facts before the topology is frozen.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::{info, warn};

use corral_common::{ClusterTopology, NodeFacts, OsFamily, TopologyInput};

use crate::dispatch::Dispatcher;

pub const PROBE_COMMAND: &str =
    "cat /etc/os-release 2>/dev/null; echo __NPROC=$(nproc); echo __HOST=$(hostname); echo __HOME=$HOME";

/// Probe every declared node once and build the immutable topology.
///
/// Nodes that cannot be reached keep their declared hints; the failure shows
/// up again, with context, the first time a step touches them.
pub async fn probe_topology(input: &TopologyInput, dispatcher: &Dispatcher) -> anyhow::Result<ClusterTopology> {
    let provisional = input.build(&HashMap::new())?;
    let nodes = provisional.all_nodes();
    let results = dispatcher.dispatch(PROBE_COMMAND, &nodes).await;

    let mut facts: HashMap<IpAddr, NodeFacts> = HashMap::new();
    for res in results {
        if !res.success() {
            warn!(node=%res.ip, status=?res.status, error=%res.stderr.trim(), "probe failed, keeping declared values");
            continue;
        }
        match parse_probe_output(&res.stdout) {
            Some(f) => {
                info!(node=%res.ip, hostname=%f.hostname, os=?f.os_family, cpus = f.cpu_count, "node probed");
                facts.insert(res.ip, f);
            }
            None => warn!(node=%res.ip, "probe output unrecognised, keeping declared values"),
        }
    }

    settle_hostnames(input, &mut facts);
    Ok(input.build(&facts)?)
}

/// Cloned images often report the same hostname. Any probed name that is not
/// unique across the cluster falls back to the operator's declared name.
fn settle_hostnames(input: &TopologyInput, facts: &mut HashMap<IpAddr, NodeFacts>) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (_, spec) in input.specs() {
        let name = facts
            .get(&spec.ip)
            .map(|f| f.hostname.clone())
            .unwrap_or_else(|| spec.name.clone());
        *counts.entry(name).or_default() += 1;
    }
    for (_, spec) in input.specs() {
        if let Some(f) = facts.get_mut(&spec.ip) {
            if counts.get(&f.hostname).copied().unwrap_or(0) > 1 {
                warn!(node=%spec.ip, probed=%f.hostname, declared=%spec.name, "probed hostname is not unique, using declared name");
                f.hostname = spec.name.clone();
            }
        }
    }
}

pub fn parse_probe_output(stdout: &str) -> Option<NodeFacts> {
    let mut cpus = None;
    let mut host = None;
    let mut home = None;
    let mut os_release = String::new();
    for line in stdout.lines() {
        if let Some(v) = line.strip_prefix("__NPROC=") {
            cpus = v.trim().parse::<u32>().ok();
        } else if let Some(v) = line.strip_prefix("__HOST=") {
            let v = v.trim();
            if !v.is_empty() {
                host = Some(v.to_string());
            }
        } else if let Some(v) = line.strip_prefix("__HOME=") {
            let v = v.trim();
            if v.starts_with('/') {
                home = Some(v.to_string());
            }
        } else {
            os_release.push_str(line);
            os_release.push('\n');
        }
    }
    Some(NodeFacts {
        hostname: host?,
        os_family: OsFamily::from_os_release(&os_release),
        cpu_count: cpus?.max(1),
        home_dir: home,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use corral_common::NodeSpec;

    use crate::dispatch::DispatchOptions;
    use crate::memory::MemoryCluster;
    use crate::transport::ExecOutput;

    const UBUNTU: &str = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\n";
    const ROCKY: &str = "NAME=\"Rocky Linux\"\nID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n";

    #[test]
    fn test_parse_probe_output() {
        let facts = parse_probe_output(&format!("{ROCKY}__NPROC=16\n__HOST=node-b\n")).unwrap();
        assert_eq!(facts.hostname, "node-b");
        assert_eq!(facts.os_family, OsFamily::RhelLike);
        assert_eq!(facts.cpu_count, 16);
        assert_eq!(facts.home_dir, None);

        let facts = parse_probe_output("__NPROC=2\n__HOST=h\n__HOME=/root\n").unwrap();
        assert_eq!(facts.home_dir.as_deref(), Some("/root"));

        assert!(parse_probe_output("__NPROC=4\n").is_none());
        assert!(parse_probe_output("__NPROC=x\n__HOST=a\n").is_none());
    }

    #[tokio::test]
    async fn test_probe_prefers_live_facts() {
        let spec = |ip: &str, name: &str| NodeSpec {
            ip: ip.parse().unwrap(),
            name: name.into(),
            os_hint: Some("ubuntu".into()),
            cpus: Some(2),
            extra_addresses: vec![],
        };
        let input = TopologyInput {
            master: spec("10.0.0.1", "a"),
            workers: vec![spec("10.0.0.2", "b")],
            username: "hpc".into(),
        };
        let cluster = MemoryCluster::new();
        cluster.add_node("10.0.0.1".parse().unwrap(), "a").await;
        cluster.add_node("10.0.0.2".parse().unwrap(), "b").await;
        cluster
            .on_command("os-release", |_, sim| {
                let os = if sim.hostname == "a" { UBUNTU } else { ROCKY };
                ExecOutput::ok(format!("{os}__NPROC=8\n__HOST={}-live\n", sim.hostname))
            })
            .await;
        cluster.update("10.0.0.2".parse().unwrap(), |s| s.reachable = false).await;

        let dispatcher = Dispatcher::per_node(Arc::new(cluster), DispatchOptions::default());
        let topo = probe_topology(&input, &dispatcher).await.unwrap();

        assert_eq!(topo.master.hostname, "a-live");
        assert_eq!(topo.master.cpu_count, 8);
        assert_eq!(topo.master.os_family, OsFamily::DebianLike);
        // unreachable worker keeps its hints
        assert_eq!(topo.workers[0].hostname, "b");
        assert_eq!(topo.workers[0].cpu_count, 2);
    }

    #[tokio::test]
    async fn test_duplicate_live_hostnames_keep_declared_names() {
        let spec = |ip: &str, name: &str| NodeSpec {
            ip: ip.parse().unwrap(),
            name: name.into(),
            os_hint: None,
            cpus: None,
            extra_addresses: vec![],
        };
        let input = TopologyInput {
            master: spec("10.0.0.1", "head"),
            workers: vec![spec("10.0.0.2", "w1"), spec("10.0.0.3", "w2")],
            username: "hpc".into(),
        };
        let cluster = MemoryCluster::new();
        for (ip, name) in [("10.0.0.1", "head"), ("10.0.0.2", "w1"), ("10.0.0.3", "w2")] {
            cluster.add_node(ip.parse().unwrap(), name).await;
        }
        cluster
            .on_command("os-release", |_, sim| {
                let host = if sim.hostname == "w2" { "w2-live" } else { "ubuntu" };
                ExecOutput::ok(format!("{UBUNTU}__NPROC=4\n__HOST={host}\n"))
            })
            .await;

        let dispatcher = Dispatcher::per_node(Arc::new(cluster), DispatchOptions::default());
        let topo = probe_topology(&input, &dispatcher).await.unwrap();

        assert_eq!(topo.master.hostname, "head");
        assert_eq!(topo.workers[0].hostname, "w1");
        assert_eq!(topo.workers[1].hostname, "w2-live");
        assert_eq!(topo.master.cpu_count, 4);
    }
}
