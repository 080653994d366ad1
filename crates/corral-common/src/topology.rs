use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::node::{Node, OsFamily, Role};

/// One declared machine as it appears in the cluster file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSpec {
    pub ip: IpAddr,
    pub name: String,

    /// Advisory only; the live probe decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_hint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_addresses: Vec<IpAddr>,
}

/// The topology document after deserialization, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyInput {
    pub master: NodeSpec,
    #[serde(default)]
    pub workers: Vec<NodeSpec>,
    pub username: String,
}

/// Facts gathered from a live node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFacts {
    pub hostname: String,
    pub os_family: OsFamily,
    pub cpu_count: u32,
    pub home_dir: Option<String>,
}

impl NodeSpec {
    /// Build the immutable node, preferring probed facts over declared hints.
    pub fn to_node(&self, role: Role, facts: Option<&NodeFacts>) -> Node {
        let (hostname, os_family, cpus) = match facts {
            Some(f) => (f.hostname.clone(), f.os_family, f.cpu_count),
            None => (
                self.name.clone(),
                self.os_hint
                    .as_deref()
                    .map(OsFamily::from_hint)
                    .unwrap_or(OsFamily::Other),
                self.cpus.unwrap_or(1),
            ),
        };
        Node::new(self.ip, hostname, os_family, cpus, role)
            .with_extra_addresses(self.extra_addresses.clone())
            .with_home_dir(facts.and_then(|f| f.home_dir.clone()))
    }
}

impl TopologyInput {
    pub fn specs(&self) -> impl Iterator<Item = (Role, &NodeSpec)> {
        std::iter::once((Role::Master, &self.master)).chain(
            self.workers
                .iter()
                .enumerate()
                .map(|(index, w)| (Role::Worker { index }, w)),
        )
    }

    /// Build a topology from declared values and whatever facts were probed.
    pub fn build(&self, facts: &HashMap<IpAddr, NodeFacts>) -> Result<ClusterTopology, ClusterError> {
        let master = self.master.to_node(Role::Master, facts.get(&self.master.ip));
        let workers = self
            .workers
            .iter()
            .enumerate()
            .map(|(index, w)| w.to_node(Role::Worker { index }, facts.get(&w.ip)))
            .collect();
        ClusterTopology::new(master, workers, self.username.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterTopology {
    pub master: Node,
    pub workers: Vec<Node>,
    pub username: String,
}

impl ClusterTopology {
    pub fn new(master: Node, workers: Vec<Node>, username: String) -> Result<Self, ClusterError> {
        if username.trim().is_empty() {
            return Err(ClusterError::InvalidTopology("username is empty".into()));
        }
        if master.role != Role::Master {
            return Err(ClusterError::InvalidTopology(format!(
                "{} is listed as master but carries role {}",
                master.label(),
                master.role
            )));
        }

        let mut seen_ips: HashSet<IpAddr> = HashSet::new();
        let mut seen_names: HashSet<&str> = HashSet::new();
        for node in std::iter::once(&master).chain(workers.iter()) {
            if node.role == Role::Master && node != &master {
                return Err(ClusterError::InvalidTopology(format!(
                    "{} is a second master",
                    node.label()
                )));
            }
            for ip in std::iter::once(&node.ip).chain(node.extra_addresses.iter()) {
                if !seen_ips.insert(*ip) {
                    return Err(ClusterError::InvalidTopology(format!(
                        "address {} is assigned more than once",
                        ip
                    )));
                }
            }
            if !seen_names.insert(node.hostname.as_str()) {
                return Err(ClusterError::InvalidTopology(format!(
                    "hostname {} is used more than once",
                    node.hostname
                )));
            }
        }

        Ok(Self {
            master,
            workers,
            username,
        })
    }

    /// Multi-node runs need at least one worker.
    pub fn require_workers(&self) -> Result<(), ClusterError> {
        if self.workers.is_empty() {
            return Err(ClusterError::InvalidTopology(
                "multi-node run requested but no workers are configured".into(),
            ));
        }
        Ok(())
    }

    /// Master first, then workers in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        std::iter::once(&self.master).chain(self.workers.iter())
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.nodes().cloned().collect()
    }

    pub fn len(&self) -> usize {
        1 + self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn node_by_ip(&self, ip: IpAddr) -> Option<&Node> {
        self.nodes().find(|n| n.ip == ip)
    }

    pub fn primary_ips(&self) -> Vec<IpAddr> {
        self.nodes().map(|n| n.ip).collect()
    }

    pub fn any_multi_homed(&self) -> bool {
        self.nodes().any(|n| n.is_multi_homed())
    }

    pub fn total_cpus(&self) -> u32 {
        self.nodes().map(|n| n.cpu_count).sum()
    }
}
