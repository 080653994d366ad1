use std::net::IpAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// The command ran; `exit_code` says how it went.
    Completed,
    /// The node could not be reached within the connect timeout.
    ConnectionFailed,
    /// The command did not finish within the command timeout.
    TimedOut,
}

/// Outcome of one command on one node. Identical in shape for the fan-out
/// and per-node transports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteCommandResult {
    pub node: String,
    pub ip: IpAddr,
    pub status: CommandStatus,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub used_parallel_path: bool,
}

impl RemoteCommandResult {
    pub fn success(&self) -> bool {
        self.status == CommandStatus::Completed && self.exit_code == 0
    }

    pub fn connection_failed(&self) -> bool {
        self.status == CommandStatus::ConnectionFailed
    }

    /// stdout with the trailing newline removed.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim_end_matches(['\n', '\r'])
    }
}
