//! Host environment sensing.
//!
//! Everything here reads plain files under a configurable root so the
//! detection rules can be exercised against a fake filesystem in tests.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const VM_MARKERS: [&str; 6] = ["vmware", "virtualbox", "qemu", "kvm", "xen", "hyper-v"];

/// What the factory knows about the machine it runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    /// `linux`, `macos`, `windows`, ...
    pub os: String,
    /// `x86_64`, `aarch64`, `arm`, ...
    pub arch: String,
    /// Lowercased distribution id from os-release (`ubuntu`, `fedora`, ...)
    pub distribution: String,
    pub version: String,
    pub hostname: String,
    pub is_container: bool,
    pub is_vm: bool,
    pub is_arm: bool,
    pub is_raspberry: bool,
}

impl HostProfile {
    /// Sense the running host.
    pub fn sense() -> Self {
        Self::sense_from(
            Path::new("/"),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }

    /// Sense a host whose filesystem is mounted at `root`.
    pub fn sense_from(root: &Path, os: &str, arch: &str) -> Self {
        let files = HostFiles { root };
        let is_linux = os == "linux";
        let (distribution, version) = if is_linux {
            files.distribution()
        } else {
            (os.to_string(), String::new())
        };

        Self {
            os: os.to_string(),
            arch: arch.to_string(),
            distribution,
            version,
            hostname: files.hostname(),
            is_container: is_linux && files.is_nested_container(),
            is_vm: is_linux && files.is_vm(),
            is_arm: is_arm_arch(arch),
            is_raspberry: is_linux && files.is_raspberry(),
        }
    }

    pub fn is_macos(&self) -> bool {
        self.os == "macos" || self.os == "darwin"
    }
}

pub fn is_arm_arch(arch: &str) -> bool {
    arch.starts_with("arm") || arch == "aarch64"
}

struct HostFiles<'a> {
    root: &'a Path,
}

impl HostFiles<'_> {
    fn path(&self, abs: &str) -> PathBuf {
        self.root.join(abs.trim_start_matches('/'))
    }

    fn read(&self, abs: &str) -> Option<String> {
        std::fs::read_to_string(self.path(abs)).ok()
    }

    fn exists(&self, abs: &str) -> bool {
        self.path(abs).exists()
    }

    fn is_raspberry(&self) -> bool {
        if let Some(cpuinfo) = self.read("/proc/cpuinfo")
            && cpuinfo_mentions_raspberry(&cpuinfo)
        {
            return true;
        }
        self.read("/proc/device-tree/model")
            .map(|m| m.to_lowercase().contains("raspberry"))
            .unwrap_or(false)
    }

    fn is_nested_container(&self) -> bool {
        if self.exists("/.dockerenv") {
            return true;
        }
        self.read("/proc/1/cgroup")
            .map(|c| cgroup_mentions_container(&c))
            .unwrap_or(false)
    }

    fn is_vm(&self) -> bool {
        self.read("/sys/class/dmi/id/product_name")
            .map(|p| product_name_is_vm(&p))
            .unwrap_or(false)
    }

    fn distribution(&self) -> (String, String) {
        if let Some(content) = self.read("/etc/os-release") {
            let (id, version) = parse_os_release(&content);
            if !id.is_empty() {
                return (id, version);
            }
        }
        if let Some(v) = self.read("/etc/debian_version") {
            return ("debian".to_string(), v.trim().to_string());
        }
        if let Some(v) = self.read("/etc/redhat-release") {
            return ("rhel".to_string(), v.trim().to_string());
        }
        if self.exists("/etc/arch-release") {
            return ("arch".to_string(), "rolling".to_string());
        }
        ("unknown".to_string(), String::new())
    }

    fn hostname(&self) -> String {
        self.read("/etc/hostname")
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

pub fn cpuinfo_mentions_raspberry(cpuinfo: &str) -> bool {
    let lower = cpuinfo.to_lowercase();
    lower.contains("raspberry") || lower.contains("bcm283")
}

pub fn cgroup_mentions_container(cgroup: &str) -> bool {
    cgroup.contains("docker") || cgroup.contains("lxc")
}

pub fn product_name_is_vm(product: &str) -> bool {
    let lower = product.to_lowercase();
    VM_MARKERS.iter().any(|m| lower.contains(m))
}

/// Extract `ID` and `VERSION_ID` from os-release content, lowercasing the id.
pub fn parse_os_release(content: &str) -> (String, String) {
    let mut id = String::new();
    let mut version = String::new();
    for line in content.lines() {
        if let Some(v) = line.strip_prefix("ID=") {
            id = v.trim().trim_matches('"').to_lowercase();
        } else if let Some(v) = line.strip_prefix("VERSION_ID=") {
            version = v.trim().trim_matches('"').to_string();
        }
    }
    (id, version)
}
