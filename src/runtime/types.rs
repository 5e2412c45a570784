use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Docker,
    Containerd,
    Lxc,
}

impl RuntimeType {
    pub const ALL: [RuntimeType; 3] = [Self::Docker, Self::Containerd, Self::Lxc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Containerd => "containerd",
            Self::Lxc => "lxc",
        }
    }

    /// Whether this backend runs OCI images built by the image pipeline.
    pub fn uses_images(&self) -> bool {
        matches!(self, Self::Docker | Self::Containerd)
    }
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "containerd" => Ok(Self::Containerd),
            "lxc" => Ok(Self::Lxc),
            _ => Err(format!("Invalid runtime type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Paused,
    Exited,
    Error,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Exited => "exited",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "paused" => Ok(Self::Paused),
            "exited" => Ok(Self::Exited),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid container status: {}", s)),
        }
    }
}

/// Self-description reported by a backend adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    #[serde(rename = "type")]
    pub runtime_type: RuntimeType,
    pub version: String,
    pub os: String,
    pub architecture: String,
    pub available: bool,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl PortMapping {
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: default_protocol(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// Bytes
    pub memory: Option<i64>,
    pub cpu_shares: Option<i64>,
    /// Number of CPUs, fractional
    pub cpu_limit: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub environment: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub restart_policy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ports: Vec<PortMapping>,
    pub ip_address: Option<String>,
    pub network_mode: Option<String>,
}

/// A container as seen by one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub runtime: RuntimeType,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub config: ContainerConfig,
    pub network: NetworkInfo,
    pub resources: ResourceLimits,
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub environment: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
    pub resources: ResourceLimits,
    pub network_mode: Option<String>,
    pub restart_policy: Option<String>,
    pub auto_remove: bool,
    pub privileged: bool,
}

impl CreateContainerRequest {
    /// `KEY=VALUE` strings, sorted by key so the result is stable.
    pub fn env_list(&self) -> Vec<String> {
        let mut keys: Vec<&String> = self.environment.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|k| format!("{}={}", k, self.environment[k]))
            .collect()
    }

    pub fn config(&self) -> ContainerConfig {
        ContainerConfig {
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            environment: self.environment.clone(),
            labels: self.labels.clone(),
            restart_policy: self.restart_policy.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecResult {
    pub output: String,
    pub error: String,
    pub exit_code: i64,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Lifecycle notification emitted by a backend adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub container_id: String,
    pub runtime: RuntimeType,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RuntimeEvent {
    pub fn new(
        runtime: RuntimeType,
        event_type: &str,
        container_id: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            container_id: container_id.to_string(),
            runtime,
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Image as listed by an image backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageSummary {
    pub id: String,
    pub tags: Vec<String>,
    /// Unix seconds
    pub created: i64,
}

/// One decoded line of a backend build-progress stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildMessage {
    pub stream: Option<String>,
    pub error: Option<String>,
    pub aux_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub space_reclaimed: u64,
}
