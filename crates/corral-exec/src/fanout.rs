use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use corral_common::util::shell_quote;
use corral_common::Node;

use crate::transport::{ExecOutput, TransportError};

const RC_MARKER: &str = "__CORRAL_RC__=";

pub type FanOutResults = HashMap<IpAddr, Result<ExecOutput, TransportError>>;

/// A cluster-wide parallel shell: one invocation, many nodes.
#[async_trait]
pub trait FanOut: Send + Sync {
    fn name(&self) -> &str;

    /// Installed locally and able to reach every node.
    async fn available(&self, nodes: &[Node]) -> bool;

    /// Per-node outcomes keyed by primary IP. An `Err` means the invocation as
    /// a whole failed and nothing can be said about individual nodes.
    async fn fan_out(&self, nodes: &[Node], command: &str, timeout: Duration) -> anyhow::Result<FanOutResults>;
}

/// `pdsh -R ssh`, with each node's exit status recovered from a marker line.
#[derive(Debug, Clone)]
pub struct PdshFanOut {
    pub binary: String,
    pub username: String,
    pub connect_timeout: Duration,
    pub width: usize,
}

impl PdshFanOut {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            binary: "pdsh".to_string(),
            username: username.into(),
            connect_timeout: Duration::from_secs(10),
            width: 64,
        }
    }

    fn wrap(command: &str) -> String {
        format!("sh -c {}; echo {}$?", shell_quote(command), RC_MARKER)
    }
}

#[async_trait]
impl FanOut for PdshFanOut {
    fn name(&self) -> &str {
        "pdsh"
    }

    async fn available(&self, nodes: &[Node]) -> bool {
        let installed = Command::new(&self.binary)
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if !installed {
            tracing::info!(tool=%self.binary, "parallel shell not installed");
            return false;
        }

        match self.fan_out(nodes, "true", self.connect_timeout * 2).await {
            Ok(results) => {
                let reachable = nodes
                    .iter()
                    .all(|n| matches!(results.get(&n.ip), Some(Ok(out)) if out.success()));
                if !reachable {
                    tracing::info!(tool=%self.binary, "parallel shell cannot reach every node");
                }
                reachable
            }
            Err(e) => {
                tracing::info!(tool=%self.binary, error=%e, "parallel shell probe failed");
                false
            }
        }
    }

    async fn fan_out(&self, nodes: &[Node], command: &str, timeout: Duration) -> anyhow::Result<FanOutResults> {
        let hosts = nodes
            .iter()
            .map(|n| n.ip.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-R")
            .arg("ssh")
            .arg("-l")
            .arg(&self.username)
            .arg("-t")
            .arg(self.connect_timeout.as_secs().max(1).to_string())
            .arg("-u")
            .arg(timeout.as_secs().max(1).to_string())
            .arg("-f")
            .arg(self.width.max(1).to_string())
            .arg("-w")
            .arg(hosts)
            .arg(Self::wrap(command))
            .env(
                "PDSH_SSH_ARGS_APPEND",
                "-o BatchMode=yes -o StrictHostKeyChecking=accept-new",
            )
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // pdsh enforces -u per node; the outer bound only catches a wedged pdsh.
        let outer = timeout + self.connect_timeout + Duration::from_secs(5);
        let output = match tokio::time::timeout(outer, cmd.output()).await {
            Ok(res) => res?,
            Err(_) => anyhow::bail!("{} did not return within {:?}", self.binary, outer),
        };

        Ok(parse_pdsh_output(
            nodes,
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
            timeout,
        ))
    }
}

/// Split pdsh's `host: line` streams back into per-node outcomes.
pub fn parse_pdsh_output(nodes: &[Node], stdout: &str, stderr: &str, timeout: Duration) -> FanOutResults {
    let mut outs: HashMap<String, ExecOutput> = HashMap::new();
    let mut codes: HashMap<String, i32> = HashMap::new();
    let mut conn_failed: HashMap<String, String> = HashMap::new();
    let mut timed_out: Vec<String> = Vec::new();

    for line in stdout.lines() {
        let Some((host, text)) = split_host_line(line) else {
            continue;
        };
        if let Some(rc) = text.strip_prefix(RC_MARKER) {
            if let Ok(code) = rc.trim().parse::<i32>() {
                codes.insert(host.to_string(), code);
                continue;
            }
        }
        let out = outs.entry(host.to_string()).or_default();
        out.stdout.push_str(text);
        out.stdout.push('\n');
    }

    for line in stderr.lines() {
        if let Some(rest) = line.strip_prefix("pdsh@") {
            // "pdsh@ctl: 10.0.0.2: ssh exited with exit code 255"
            let Some((_, tail)) = rest.split_once(": ") else {
                continue;
            };
            let Some((host, msg)) = tail.split_once(": ") else {
                continue;
            };
            if msg.contains("command timeout") {
                timed_out.push(host.to_string());
            } else if msg.contains("exit code 255") || msg.contains("connect") {
                conn_failed.insert(host.to_string(), msg.to_string());
            }
            continue;
        }
        let Some((host, text)) = split_host_line(line) else {
            continue;
        };
        let out = outs.entry(host.to_string()).or_default();
        out.stderr.push_str(text);
        out.stderr.push('\n');
    }

    let mut results = FanOutResults::new();
    for node in nodes {
        let host = node.ip.to_string();
        let outcome = if let Some(code) = codes.get(&host) {
            let mut out = outs.remove(&host).unwrap_or_default();
            out.exit_code = *code;
            Ok(out)
        } else if let Some(msg) = conn_failed.remove(&host) {
            Err(TransportError::ConnectionFailed(msg))
        } else if timed_out.contains(&host) {
            Err(TransportError::TimedOut(timeout))
        } else {
            Err(TransportError::Other("no exit status reported".to_string()))
        };
        results.insert(node.ip, outcome);
    }
    results
}

fn split_host_line(line: &str) -> Option<(&str, &str)> {
    if let Some((host, text)) = line.split_once(": ") {
        return Some((host, text));
    }
    line.strip_suffix(':').map(|host| (host, ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_common::{OsFamily, Role};

    fn node(ip: &str) -> Node {
        Node::new(ip.parse().unwrap(), ip, OsFamily::DebianLike, 4, Role::Master)
    }

    #[test]
    fn test_parse_pdsh_output() {
        let nodes = vec![node("10.0.0.1"), node("10.0.0.2"), node("10.0.0.3"), node("10.0.0.4")];
        let stdout = "10.0.0.1: head\n10.0.0.1: __CORRAL_RC__=0\n10.0.0.2: line one\n10.0.0.2:\n10.0.0.2: __CORRAL_RC__=3\n";
        let stderr = "10.0.0.2: oops\npdsh@ctl: 10.0.0.3: ssh exited with exit code 255\npdsh@ctl: 10.0.0.4: command timeout\n";

        let res = parse_pdsh_output(&nodes, stdout, stderr, Duration::from_secs(5));

        let a = res[&nodes[0].ip].as_ref().unwrap();
        assert_eq!(a.exit_code, 0);
        assert_eq!(a.stdout, "head\n");

        let b = res[&nodes[1].ip].as_ref().unwrap();
        assert_eq!(b.exit_code, 3);
        assert_eq!(b.stdout, "line one\n\n");
        assert_eq!(b.stderr, "oops\n");

        assert!(matches!(res[&nodes[2].ip], Err(TransportError::ConnectionFailed(_))));
        assert!(matches!(res[&nodes[3].ip], Err(TransportError::TimedOut(_))));
    }

    #[test]
    fn test_wrap_preserves_exit_status() {
        assert_eq!(
            PdshFanOut::wrap("exit 3"),
            "sh -c 'exit 3'; echo __CORRAL_RC__=$?"
        );
    }
}
