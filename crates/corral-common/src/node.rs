use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Operating-system family, resolved once per node and never re-probed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    DebianLike,
    RhelLike,
    Other,
}

impl OsFamily {
    /// Classify the contents of `/etc/os-release` by its `ID` and `ID_LIKE` keys.
    pub fn from_os_release(content: &str) -> Self {
        let mut ids: Vec<String> = Vec::new();
        for line in content.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            if key == "ID" || key == "ID_LIKE" {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                ids.extend(value.split_whitespace().map(|s| s.to_ascii_lowercase()));
            }
        }
        Self::from_ids(ids.iter().map(|s| s.as_str()))
    }

    /// Interpret an operator-supplied hint such as "ubuntu" or "rocky".
    pub fn from_hint(hint: &str) -> Self {
        Self::from_ids(std::iter::once(hint.trim().to_ascii_lowercase().as_str()))
    }

    fn from_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Self {
        let mut family = OsFamily::Other;
        for id in ids {
            match id {
                "debian" | "ubuntu" | "linuxmint" | "pop" | "raspbian" => {
                    return OsFamily::DebianLike
                }
                "rhel" | "fedora" | "centos" | "rocky" | "almalinux" | "ol" | "amzn" => {
                    family = OsFamily::RhelLike
                }
                _ => {}
            }
        }
        family
    }

    pub fn package_manager(self) -> PackageManager {
        match self {
            OsFamily::DebianLike => PackageManager::Apt,
            OsFamily::RhelLike => PackageManager::Dnf,
            OsFamily::Other => PackageManager::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Apt,
    Dnf,
    Unknown,
}

impl PackageManager {
    /// Non-interactive install command, run under sudo.
    pub fn install_command(self, packages: &[&str]) -> Option<String> {
        let list = packages.join(" ");
        match self {
            PackageManager::Apt => Some(format!(
                "sudo -n apt-get update -q && DEBIAN_FRONTEND=noninteractive sudo -n apt-get install -y -q {list}"
            )),
            PackageManager::Dnf => Some(format!("sudo -n dnf install -y -q {list}")),
            PackageManager::Unknown => None,
        }
    }

    /// Command that exits 0 only when every package is installed.
    pub fn query_command(self, packages: &[&str]) -> Option<String> {
        let list = packages.join(" ");
        match self {
            PackageManager::Apt => Some(format!("dpkg -s {list} >/dev/null 2>&1")),
            PackageManager::Dnf => Some(format!("rpm -q {list} >/dev/null 2>&1")),
            PackageManager::Unknown => None,
        }
    }

    pub fn binary(self) -> &'static str {
        match self {
            PackageManager::Apt => "/usr/bin/apt-get",
            PackageManager::Dnf => "/usr/bin/dnf",
            PackageManager::Unknown => "",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Worker { index: usize },
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Worker { index } => write!(f, "worker-{}", index + 1),
        }
    }
}

/// One cluster member. Built once from validated input plus the live probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    /// Pinned primary address; every generated artifact binds to this one.
    pub ip: IpAddr,
    pub hostname: String,
    pub os_family: OsFamily,
    pub package_manager: PackageManager,
    pub cpu_count: u32,
    pub role: Role,

    /// Other addresses the operator declared for this machine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_addresses: Vec<IpAddr>,

    /// The operating user's `$HOME` on this node, when probed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_dir: Option<String>,
}

impl Node {
    pub fn new(ip: IpAddr, hostname: impl Into<String>, os_family: OsFamily, cpu_count: u32, role: Role) -> Self {
        Self {
            ip,
            hostname: hostname.into(),
            os_family,
            package_manager: os_family.package_manager(),
            cpu_count: cpu_count.max(1),
            role,
            extra_addresses: Vec::new(),
            home_dir: None,
        }
    }

    pub fn with_extra_addresses(mut self, addrs: Vec<IpAddr>) -> Self {
        self.extra_addresses = addrs;
        self
    }

    pub fn with_home_dir(mut self, home_dir: Option<String>) -> Self {
        self.home_dir = home_dir;
        self
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    pub fn is_multi_homed(&self) -> bool {
        !self.extra_addresses.is_empty()
    }

    /// `hostname (ip)` label used in logs and summaries.
    pub fn label(&self) -> String {
        format!("{} ({})", self.hostname, self.ip)
    }
}
