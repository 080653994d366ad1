//! In-memory cluster used by tests in place of real ssh/pdsh.
//!
//! Each simulated node keeps a file map and a process list. Commands are
//! answered by registered handlers (first handler whose key is a substring of
//! the command wins) or by a few built-ins: `hostname`, `pkill`/`pgrep` with
//! a single-quoted `-x` name alternation or an anchored `-f '^path( |$)'`,
//! and `sha256sum <path>`.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use corral_common::util::sha256_hex;
use corral_common::{ClusterTopology, Node};

use crate::fanout::{FanOut, FanOutResults};
use crate::transport::{ExecOutput, Transport, TransportError, WriteOptions};

pub type CommandHandler = Arc<dyn Fn(&str, &mut SimNode) -> ExecOutput + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SimNode {
    pub hostname: String,
    pub files: BTreeMap<String, Vec<u8>>,
    pub processes: Vec<String>,
    pub reachable: bool,
    /// Fail this many upcoming connections before succeeding.
    pub connect_failures: u32,
    /// Corrupt this many upcoming file writes.
    pub corrupt_writes: u32,
    pub delay: Option<Duration>,
    pub commands: Vec<String>,
    pub writes: u32,
}

impl SimNode {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            files: BTreeMap::new(),
            processes: Vec::new(),
            reachable: true,
            connect_failures: 0,
            corrupt_writes: 0,
            delay: None,
            commands: Vec::new(),
            writes: 0,
        }
    }

    pub fn file_string(&self, path: &str) -> Option<String> {
        self.files
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

struct Inner {
    nodes: HashMap<IpAddr, SimNode>,
    handlers: Vec<(String, CommandHandler)>,
    fan_out_installed: bool,
    fan_out_broken: bool,
    fan_out_calls: u32,
}

#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes: HashMap::new(),
                handlers: Vec::new(),
                fan_out_installed: false,
                fan_out_broken: false,
                fan_out_calls: 0,
            })),
        }
    }

    /// One simulated node per topology member, named after its hostname.
    pub fn from_topology(topology: &ClusterTopology) -> Self {
        let nodes = topology
            .nodes()
            .map(|n| (n.ip, SimNode::new(n.hostname.clone())))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes,
                handlers: Vec::new(),
                fan_out_installed: false,
                fan_out_broken: false,
                fan_out_calls: 0,
            })),
        }
    }

    pub async fn add_node(&self, ip: IpAddr, hostname: &str) {
        self.inner.lock().await.nodes.insert(ip, SimNode::new(hostname));
    }

    pub async fn on_command<F>(&self, key: &str, handler: F)
    where
        F: Fn(&str, &mut SimNode) -> ExecOutput + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .await
            .handlers
            .push((key.to_string(), Arc::new(handler)));
    }

    pub async fn set_fan_out(&self, installed: bool) {
        self.inner.lock().await.fan_out_installed = installed;
    }

    /// Make every fan-out invocation fail as a whole.
    pub async fn break_fan_out(&self) {
        self.inner.lock().await.fan_out_broken = true;
    }

    pub async fn fan_out_calls(&self) -> u32 {
        self.inner.lock().await.fan_out_calls
    }

    pub async fn update<R>(&self, ip: IpAddr, f: impl FnOnce(&mut SimNode) -> R) -> Option<R> {
        let mut inner = self.inner.lock().await;
        inner.nodes.get_mut(&ip).map(f)
    }

    pub async fn snapshot(&self, ip: IpAddr) -> Option<SimNode> {
        self.inner.lock().await.nodes.get(&ip).cloned()
    }

    async fn connect(&self, node: &Node) -> Result<Option<Duration>, TransportError> {
        let mut inner = self.inner.lock().await;
        let sim = inner
            .nodes
            .get_mut(&node.ip)
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no route to {}", node.ip)))?;
        if !sim.reachable {
            return Err(TransportError::ConnectionFailed(format!("{} is down", node.ip)));
        }
        if sim.connect_failures > 0 {
            sim.connect_failures -= 1;
            return Err(TransportError::ConnectionFailed(format!(
                "{} refused connection",
                node.ip
            )));
        }
        Ok(sim.delay)
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// What one `pkill`/`pgrep` invocation selects.
#[derive(Debug, PartialEq, Eq)]
enum ProcSelector {
    /// `-x 'a|b'`: exact process name.
    Names(Vec<String>),
    /// `-f '^/path( |$)'`: command line starting with the path.
    Path(String),
}

impl ProcSelector {
    fn parse(segment: &str) -> Option<Self> {
        let pattern = segment.split('\'').nth(1)?;
        if segment.contains(" -x ") {
            let names = pattern.split('|').map(|n| n.replace('\\', "")).collect();
            return Some(Self::Names(names));
        }
        let path = pattern.strip_prefix('^')?.strip_suffix("( |$)")?;
        Some(Self::Path(path.replace('\\', "")))
    }

    fn matches(&self, cmdline: &str) -> bool {
        match self {
            Self::Names(names) => {
                let argv0 = cmdline.split_whitespace().next().unwrap_or("");
                let name = argv0.rsplit('/').next().unwrap_or(argv0);
                names.iter().any(|n| n == name)
            }
            Self::Path(path) => {
                cmdline == path || cmdline.strip_prefix(path.as_str()).is_some_and(|rest| rest.starts_with(' '))
            }
        }
    }
}

fn proc_builtin(command: &str, node: &mut SimNode) -> Option<ExecOutput> {
    let segments: Vec<&str> = command
        .split(';')
        .map(|seg| seg.trim().trim_end_matches("|| true").trim())
        .filter(|seg| !seg.is_empty() && *seg != "true")
        .collect();
    if segments.is_empty() || !segments.iter().all(|seg| seg.starts_with("pkill") || seg.starts_with("pgrep")) {
        return None;
    }
    let mut stdout = String::new();
    for seg in segments {
        let Some(selector) = ProcSelector::parse(seg) else {
            return Some(ExecOutput::failed(2, format!("unsupported pattern in: {seg}\n")));
        };
        if seg.starts_with("pkill") {
            node.processes.retain(|p| !selector.matches(p));
        } else {
            let count = node.processes.iter().filter(|p| selector.matches(p)).count();
            stdout.push_str(&format!("{count}\n"));
        }
    }
    Some(ExecOutput::ok(stdout))
}

fn builtin(command: &str, node: &mut SimNode) -> ExecOutput {
    let trimmed = command.trim();
    if trimmed == "hostname" {
        return ExecOutput::ok(format!("{}\n", node.hostname));
    }
    if let Some(out) = proc_builtin(trimmed, node) {
        return out;
    }
    if let Some(path) = trimmed.strip_prefix("sha256sum ") {
        let path = path.trim().trim_matches('\'');
        return match node.files.get(path) {
            Some(bytes) => ExecOutput::ok(format!("{}  {}\n", sha256_hex(bytes), path)),
            None => ExecOutput::failed(1, format!("sha256sum: {path}: No such file or directory\n")),
        };
    }
    ExecOutput::ok("")
}

#[async_trait]
impl Transport for MemoryCluster {
    async fn exec(&self, node: &Node, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        let delay = self.connect(node).await?;
        if let Some(delay) = delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::TimedOut(timeout));
            }
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().await;
        let handler = inner
            .handlers
            .iter()
            .find(|(key, _)| command.contains(key.as_str()))
            .map(|(_, h)| h.clone());
        let sim = inner
            .nodes
            .get_mut(&node.ip)
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no route to {}", node.ip)))?;
        sim.commands.push(command.to_string());
        Ok(match handler {
            Some(h) => h(command, sim),
            None => builtin(command, sim),
        })
    }

    async fn write_file(
        &self,
        node: &Node,
        path: &str,
        contents: &[u8],
        _opts: WriteOptions,
    ) -> Result<(), TransportError> {
        self.connect(node).await?;
        let mut inner = self.inner.lock().await;
        let Some(sim) = inner.nodes.get_mut(&node.ip) else {
            return Err(TransportError::ConnectionFailed(format!("no route to {}", node.ip)));
        };
        sim.writes += 1;
        let mut stored = contents.to_vec();
        if sim.corrupt_writes > 0 {
            sim.corrupt_writes -= 1;
            stored.extend_from_slice(b"\n# corrupted in transit\n");
        }
        sim.files.insert(path.to_string(), stored);
        Ok(())
    }

    async fn read_file(&self, node: &Node, path: &str) -> Result<Option<Vec<u8>>, TransportError> {
        self.connect(node).await?;
        let inner = self.inner.lock().await;
        Ok(inner
            .nodes
            .get(&node.ip)
            .and_then(|sim| sim.files.get(path).cloned()))
    }
}

#[async_trait]
impl FanOut for MemoryCluster {
    fn name(&self) -> &str {
        "memory"
    }

    async fn available(&self, nodes: &[Node]) -> bool {
        let inner = self.inner.lock().await;
        inner.fan_out_installed
            && nodes
                .iter()
                .all(|n| inner.nodes.get(&n.ip).is_some_and(|s| s.reachable))
    }

    async fn fan_out(&self, nodes: &[Node], command: &str, timeout: Duration) -> anyhow::Result<FanOutResults> {
        {
            let mut inner = self.inner.lock().await;
            inner.fan_out_calls += 1;
            if inner.fan_out_broken {
                anyhow::bail!("simulated fan-out failure");
            }
        }

        let mut set = JoinSet::new();
        for node in nodes.iter().cloned() {
            let cluster = self.clone();
            let command = command.to_string();
            set.spawn(async move {
                let res = match tokio::time::timeout(timeout, cluster.exec(&node, &command, timeout)).await {
                    Ok(r) => r,
                    Err(_) => Err(TransportError::TimedOut(timeout)),
                };
                (node.ip, res)
            });
        }

        let mut out = FanOutResults::new();
        while let Some(joined) = set.join_next().await {
            let (ip, res) = joined?;
            out.insert(ip, res);
        }
        Ok(out)
    }
}
