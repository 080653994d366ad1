use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use corral_common::Node;

/// Raw output of one command on one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_connection(&self) -> bool {
        matches!(self, TransportError::ConnectionFailed(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Octal file mode applied after the write.
    pub mode: Option<u32>,
    /// Write through sudo (system paths such as `/etc/hosts`).
    pub privileged: bool,
}

impl WriteOptions {
    pub fn mode(mode: u32) -> Self {
        Self {
            mode: Some(mode),
            privileged: false,
        }
    }

    pub fn privileged(mode: u32) -> Self {
        Self {
            mode: Some(mode),
            privileged: true,
        }
    }
}

/// Non-interactive access to a single node.
///
/// Paths starting with `~/` are relative to the operating user's home.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exec(&self, node: &Node, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError>;

    async fn write_file(
        &self,
        node: &Node,
        path: &str,
        contents: &[u8],
        opts: WriteOptions,
    ) -> Result<(), TransportError>;

    /// `Ok(None)` when the file does not exist.
    async fn read_file(&self, node: &Node, path: &str) -> Result<Option<Vec<u8>>, TransportError>;
}
