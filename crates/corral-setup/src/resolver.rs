//! Which configured node is this process running on.

use std::collections::BTreeSet;
use std::net::IpAddr;

use anyhow::Context;
use tokio::process::Command;
use tracing::{debug, info};

use corral_common::{ClusterError, ClusterTopology, Node};

/// Intersect the local address set with the configured primary addresses.
///
/// Exactly one match is authoritative. Zero or several matches are errors;
/// the resolver never picks one.
pub fn resolve_role(local: &[IpAddr], topology: &ClusterTopology) -> Result<Node, ClusterError> {
    let local: BTreeSet<IpAddr> = local.iter().copied().collect();
    let matches: Vec<&Node> = topology.nodes().filter(|n| local.contains(&n.ip)).collect();
    match matches.as_slice() {
        [node] => {
            info!(node=%node.ip, hostname=%node.hostname, role=%node.role, "role resolved");
            Ok((*node).clone())
        }
        [] => Err(ClusterError::RoleUnresolved),
        many => Err(ClusterError::AmbiguousRole(many.iter().map(|n| n.ip).collect())),
    }
}

/// Like [`resolve_role`], but an operator-pinned address wins outright. The
/// pinned address must itself be a configured node.
pub fn resolve_with_override(
    local: &[IpAddr],
    pinned: Option<IpAddr>,
    topology: &ClusterTopology,
) -> Result<Node, ClusterError> {
    match pinned {
        Some(ip) => {
            let node = topology.node_by_ip(ip).ok_or(ClusterError::RoleUnresolved)?;
            info!(node=%node.ip, role=%node.role, "role pinned by operator");
            Ok(node.clone())
        }
        None => resolve_role(local, topology),
    }
}

/// Every address bound on this machine, secondary and virtual interfaces included.
pub async fn local_addresses() -> anyhow::Result<Vec<IpAddr>> {
    let out = Command::new("ip").args(["-o", "addr", "show"]).output().await;
    if let Ok(out) = out {
        if out.status.success() {
            let addrs = parse_ip_addr(&String::from_utf8_lossy(&out.stdout));
            if !addrs.is_empty() {
                debug!(count = addrs.len(), "local addresses from ip(8)");
                return Ok(addrs);
            }
        }
    }

    let out = Command::new("hostname")
        .arg("-I")
        .output()
        .await
        .context("neither `ip -o addr show` nor `hostname -I` is available")?;
    if !out.status.success() {
        anyhow::bail!("hostname -I exited with {}", out.status);
    }
    Ok(parse_hostname_i(&String::from_utf8_lossy(&out.stdout)))
}

/// Parse `ip -o addr show`:
/// `2: eth0    inet 10.0.0.5/24 brd 10.0.0.255 scope global eth0\ ...`
pub fn parse_ip_addr(output: &str) -> Vec<IpAddr> {
    let mut addrs = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "inet" || field == "inet6" {
                if let Some(ip) = fields
                    .next()
                    .and_then(|cidr| cidr.split('/').next())
                    .and_then(|ip| ip.parse().ok())
                {
                    addrs.push(ip);
                }
                break;
            }
        }
    }
    addrs
}

pub fn parse_hostname_i(output: &str) -> Vec<IpAddr> {
    output
        .split_whitespace()
        .filter_map(|s| s.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use corral_common::{NodeSpec, Role, TopologyInput};

    fn topology() -> ClusterTopology {
        let spec = |ip: &str, name: &str| NodeSpec {
            ip: ip.parse().unwrap(),
            name: name.into(),
            os_hint: None,
            cpus: Some(4),
            extra_addresses: vec![],
        };
        TopologyInput {
            master: spec("192.168.1.10", "head"),
            workers: vec![spec("192.168.1.11", "n1"), spec("192.168.1.12", "n2")],
            username: "hpc".into(),
        }
        .build(&HashMap::new())
        .unwrap()
    }

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_exactly_one_match() {
        let topo = topology();
        let local = ips(&["127.0.0.1", "172.17.0.1", "192.168.1.11", "fe80::1"]);
        let node = resolve_role(&local, &topo).unwrap();
        assert_eq!(node.hostname, "n1");
        assert_eq!(node.role, Role::Worker { index: 0 });

        let node = resolve_role(&ips(&["192.168.1.10"]), &topo).unwrap();
        assert!(node.is_master());
    }

    #[test]
    fn test_zero_matches_is_unresolved() {
        let topo = topology();
        let err = resolve_role(&ips(&["127.0.0.1", "10.9.9.9"]), &topo).unwrap_err();
        assert_eq!(err, ClusterError::RoleUnresolved);
        assert_eq!(resolve_role(&[], &topo).unwrap_err(), ClusterError::RoleUnresolved);
    }

    #[test]
    fn test_several_matches_is_ambiguous() {
        let topo = topology();
        let err = resolve_role(&ips(&["192.168.1.12", "192.168.1.10"]), &topo).unwrap_err();
        assert_eq!(
            err,
            ClusterError::AmbiguousRole(ips(&["192.168.1.10", "192.168.1.12"]))
        );
        assert!(err.is_run_fatal());
    }

    #[test]
    fn test_duplicate_local_entries_count_once() {
        let topo = topology();
        let node = resolve_role(&ips(&["192.168.1.12", "192.168.1.12"]), &topo).unwrap();
        assert_eq!(node.hostname, "n2");
    }

    #[test]
    fn test_override() {
        let topo = topology();
        let local = ips(&["192.168.1.10", "192.168.1.11"]);
        let node = resolve_with_override(&local, Some("192.168.1.11".parse().unwrap()), &topo).unwrap();
        assert_eq!(node.hostname, "n1");

        let err = resolve_with_override(&local, Some("10.0.0.1".parse().unwrap()), &topo).unwrap_err();
        assert_eq!(err, ClusterError::RoleUnresolved);
    }

    #[test]
    fn test_parse_ip_addr() {
        let out = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 192.168.1.11/24 brd 192.168.1.255 scope global eth0\\       valid_lft forever
2: eth0    inet 192.168.1.50/24 scope global secondary eth0:1\\       valid_lft forever
2: eth0    inet6 fe80::a00:27ff:fe4e:66a1/64 scope link \\       valid_lft forever
";
        assert_eq!(
            parse_ip_addr(out),
            ips(&["127.0.0.1", "192.168.1.11", "192.168.1.50", "fe80::a00:27ff:fe4e:66a1"])
        );
    }

    #[test]
    fn test_parse_hostname_i() {
        assert_eq!(
            parse_hostname_i("192.168.1.11 172.17.0.1 \n"),
            ips(&["192.168.1.11", "172.17.0.1"])
        );
    }
}
