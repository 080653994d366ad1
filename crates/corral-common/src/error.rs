use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by every component.
///
/// Per-node variants are isolated into reports by their callers; only the
/// cluster-wide precondition variants abort a run (see [`ClusterError::is_run_fatal`]).
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterError {
    #[error("node {node} unreachable: {reason}")]
    ConnectionFailed { node: String, reason: String },

    #[error("passwordless privilege escalation is not configured on {node}")]
    PrivilegeDenied { node: String },

    #[error("conflicting runtime implementations on {node}: {detail}")]
    PackageManagerMismatch { node: String, detail: String },

    #[error("{template} on {node}: expected checksum {expected}, found {found}")]
    TemplateChecksumMismatch {
        node: String,
        template: String,
        expected: String,
        found: String,
    },

    #[error("benchmark {name} exceeded its {timeout_sec}s deadline")]
    BenchmarkTimeout { name: String, timeout_sec: u64 },

    #[error("local addresses match more than one cluster node: {}", join_ips(.0))]
    AmbiguousRole(Vec<IpAddr>),

    #[error("no local address matches a configured cluster node; pass --node-ip to override")]
    RoleUnresolved,

    #[error("invalid topology: {0}")]
    InvalidTopology(String),
}

impl ClusterError {
    /// Errors that violate a cluster-wide precondition and must stop the run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::PrivilegeDenied { .. }
                | ClusterError::AmbiguousRole(_)
                | ClusterError::RoleUnresolved
                | ClusterError::InvalidTopology(_)
        )
    }

    /// Errors that stop the remaining steps on one node but not elsewhere.
    pub fn is_node_fatal(&self) -> bool {
        matches!(self, ClusterError::PackageManagerMismatch { .. })
    }
}

fn join_ips(ips: &[IpAddr]) -> String {
    ips.iter()
        .map(|ip| ip.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classes() {
        assert!(ClusterError::RoleUnresolved.is_run_fatal());
        assert!(ClusterError::PrivilegeDenied { node: "a".into() }.is_run_fatal());
        let mismatch = ClusterError::PackageManagerMismatch {
            node: "a".into(),
            detail: "openmpi and mpich".into(),
        };
        assert!(!mismatch.is_run_fatal());
        assert!(mismatch.is_node_fatal());
        let conn = ClusterError::ConnectionFailed {
            node: "a".into(),
            reason: "timeout".into(),
        };
        assert!(!conn.is_run_fatal());
        assert!(!conn.is_node_fatal());
    }

    #[test]
    fn test_ambiguous_role_message_lists_addresses() {
        let err = ClusterError::AmbiguousRole(vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        ]);
        assert_eq!(
            err.to_string(),
            "local addresses match more than one cluster node: 10.0.0.1, 10.0.0.2"
        );
    }
}
