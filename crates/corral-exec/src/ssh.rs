use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use corral_common::util::{now_ms, shell_quote};
use corral_common::Node;

use crate::session::Credentials;
use crate::transport::{ExecOutput, Transport, TransportError, WriteOptions};

/// Exit status ssh reserves for its own failures.
const SSH_CONNECT_FAILURE: i32 = 255;
/// sshpass: wrong password / host key problem.
const SSHPASS_AUTH_FAILURE: i32 = 5;
const SSHPASS_HOST_KEY_FAILURE: i32 = 6;
/// Sentinel used by `read_file` for a missing file.
const MISSING_FILE_EXIT: i32 = 44;

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub username: String,
    pub connect_timeout: Duration,
    /// Directory holding ControlMaster sockets.
    pub control_dir: PathBuf,
    pub control_persist_secs: u64,
    pub identity_file: Option<PathBuf>,
}

impl SshOptions {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            connect_timeout: Duration::from_secs(10),
            control_dir: std::env::temp_dir().join("corral-ssh"),
            control_persist_secs: 60,
            identity_file: None,
        }
    }
}

#[derive(Debug, Clone)]
struct PooledConnection {
    control_path: PathBuf,
    opened_ms: u64,
}

/// Transport over the system `ssh` client with multiplexed connections.
///
/// Without credentials every call runs in batch mode (keys only, `sudo -n`).
/// With credentials, authentication goes through `sshpass` and privileged
/// writes feed the password to `sudo -S`; that mode exists for bootstrapping
/// the key mesh.
pub struct SshTransport {
    opts: SshOptions,
    credentials: Option<Credentials>,
    pool: Mutex<HashMap<IpAddr, PooledConnection>>,
}

impl SshTransport {
    pub fn new(opts: SshOptions) -> Self {
        Self {
            opts,
            credentials: None,
            pool: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_credentials(opts: SshOptions, credentials: Credentials) -> Self {
        Self {
            opts,
            credentials: Some(credentials),
            pool: Mutex::new(HashMap::new()),
        }
    }

    async fn control_path(&self, node: &Node) -> PathBuf {
        let mut pool = self.pool.lock().await;
        pool.entry(node.ip)
            .or_insert_with(|| {
                tracing::debug!(node=%node.ip, "opening pooled ssh connection");
                PooledConnection {
                    control_path: self.opts.control_dir.join(format!("cm-{}", node.ip)),
                    opened_ms: now_ms(),
                }
            })
            .control_path
            .clone()
    }

    async fn build_command(&self, node: &Node, remote: &str) -> Command {
        let control_path = self.control_path(node).await;
        let mut cmd = match &self.credentials {
            Some(creds) => {
                let mut c = Command::new("sshpass");
                c.arg("-e").arg("ssh");
                c.env("SSHPASS", creds.password());
                c
            }
            None => {
                let mut c = Command::new("ssh");
                c.arg("-o").arg("BatchMode=yes");
                c
            }
        };
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.opts.connect_timeout.as_secs().max(1)))
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg(format!("ControlPersist={}", self.opts.control_persist_secs));
        if let Some(identity) = &self.opts.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", self.opts.username, node.ip))
            .arg("--")
            .arg(remote);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        node: &Node,
        remote: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Output, TransportError> {
        if let Err(e) = tokio::fs::create_dir_all(&self.opts.control_dir).await {
            return Err(TransportError::Other(format!(
                "cannot create {}: {}",
                self.opts.control_dir.display(),
                e
            )));
        }

        let mut cmd = self.build_command(node, remote).await;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Other(format!("failed to spawn ssh: {e}")))?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&bytes)
                    .await
                    .map_err(|e| TransportError::Other(format!("failed to write stdin: {e}")))?;
                drop(pipe);
            }
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(TransportError::Other(e.to_string())),
            Err(_) => return Err(TransportError::TimedOut(timeout)),
        };

        let code = output.status.code().unwrap_or(-1);
        let auth_failure = self.credentials.is_some()
            && (code == SSHPASS_AUTH_FAILURE || code == SSHPASS_HOST_KEY_FAILURE);
        if code == SSH_CONNECT_FAILURE || auth_failure {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TransportError::ConnectionFailed(if stderr.is_empty() {
                format!("ssh exited with {code}")
            } else {
                stderr
            }));
        }
        Ok(output)
    }

    /// Tear down every multiplexed connection opened by this transport.
    pub async fn close_all(&self) {
        let pool = self.pool.lock().await;
        for (ip, conn) in pool.iter() {
            let _ = Command::new("ssh")
                .arg("-o")
                .arg(format!("ControlPath={}", conn.control_path.display()))
                .arg("-O")
                .arg("exit")
                .arg(format!("{}@{}", self.opts.username, ip))
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            tracing::debug!(node=%ip, age_ms = now_ms().saturating_sub(conn.opened_ms), "closed pooled ssh connection");
        }
    }
}

/// Shell expression for a remote path, keeping `~/` expandable.
pub fn remote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}

pub(crate) fn parent_dir(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some(("~", _)) => None,
        Some((dir, _)) => Some(dir),
    }
}

/// Shell script that writes stdin to `path`.
pub(crate) fn write_script(path: &str, mode: Option<u32>) -> String {
    let target = remote_path(path);
    let mut parts = Vec::new();
    if let Some(dir) = parent_dir(path) {
        parts.push(format!("mkdir -p {}", remote_path(dir)));
    }
    parts.push(format!("cat > {target}"));
    if let Some(mode) = mode {
        parts.push(format!("chmod {:o} {target}", mode));
    }
    parts.join(" && ")
}

/// Same as [`write_script`] but every step goes through `sudo -n`, using only
/// commands on the installed allow-list (mkdir, tee, chmod).
pub(crate) fn privileged_write_script(path: &str, mode: Option<u32>) -> String {
    let target = remote_path(path);
    let mut parts = Vec::new();
    if let Some(dir) = parent_dir(path) {
        parts.push(format!("sudo -n mkdir -p {}", remote_path(dir)));
    }
    parts.push(format!("sudo -n tee {target} >/dev/null"));
    if let Some(mode) = mode {
        parts.push(format!("sudo -n chmod {:o} {target}", mode));
    }
    parts.join(" && ")
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, node: &Node, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        let output = self.run(node, command, None, timeout).await?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn write_file(
        &self,
        node: &Node,
        path: &str,
        contents: &[u8],
        opts: WriteOptions,
    ) -> Result<(), TransportError> {
        let (remote, stdin) = match (&self.credentials, opts.privileged) {
            (Some(creds), true) => {
                // Bootstrap mode: the sudo policy may not exist yet.
                let script = write_script(path, opts.mode);
                let mut stdin = creds.password().as_bytes().to_vec();
                stdin.push(b'\n');
                stdin.extend_from_slice(contents);
                (format!("sudo -S -p '' sh -c {}", shell_quote(&script)), stdin)
            }
            (None, true) => (privileged_write_script(path, opts.mode), contents.to_vec()),
            (_, false) => (write_script(path, opts.mode), contents.to_vec()),
        };

        let timeout = self.opts.connect_timeout + Duration::from_secs(60);
        let output = self.run(node, &remote, Some(stdin), timeout).await?;
        if !output.status.success() {
            return Err(TransportError::Other(format!(
                "write {} failed: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn read_file(&self, node: &Node, path: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let target = remote_path(path);
        let remote = format!("if [ -f {target} ]; then cat {target}; else exit {MISSING_FILE_EXIT}; fi");
        let timeout = self.opts.connect_timeout + Duration::from_secs(30);
        let output = self.run(node, &remote, None, timeout).await?;
        match output.status.code() {
            Some(0) => Ok(Some(output.stdout)),
            Some(MISSING_FILE_EXIT) => Ok(None),
            _ => Err(TransportError::Other(format!(
                "read {} failed: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_path_keeps_home_expandable() {
        assert_eq!(remote_path("~/.ssh/config"), "\"$HOME\"/.ssh/config");
        assert_eq!(remote_path("/etc/hosts"), "/etc/hosts");
        assert_eq!(remote_path("/tmp/a b"), "'/tmp/a b'");
    }

    #[test]
    fn test_write_script() {
        assert_eq!(
            write_script("~/.ssh/authorized_keys", Some(0o600)),
            "mkdir -p \"$HOME\"/.ssh && cat > \"$HOME\"/.ssh/authorized_keys && chmod 600 \"$HOME\"/.ssh/authorized_keys"
        );
        assert_eq!(write_script("/hosts", None), "cat > /hosts");
        assert_eq!(write_script("~/hostfile", None), "cat > \"$HOME\"/hostfile");
    }

    #[test]
    fn test_privileged_write_script_uses_allow_listed_commands() {
        assert_eq!(
            privileged_write_script("/etc/slurm/slurm.conf", Some(0o644)),
            "sudo -n mkdir -p /etc/slurm && sudo -n tee /etc/slurm/slurm.conf >/dev/null && sudo -n chmod 644 /etc/slurm/slurm.conf"
        );
    }
}
