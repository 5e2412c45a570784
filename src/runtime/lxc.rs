//! LXC adapter driven by the `lxc-*` host tools.
//!
//! LXC has no "list with live state" primitive, so the adapter keeps a local
//! registry and reconciles it from `lxc-ls` output. `lxc-start -d` returns
//! before the container is up; readiness is a bounded poll of `lxc-info -s`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    Container, ContainerConfig, ContainerRuntime, ContainerStatus, CreateContainerRequest,
    EVENT_CHANNEL_CAPACITY, EventStream, ExecResult, LogStream, NetworkInfo, RuntimeEvent,
    RuntimeInfo, RuntimeType, redact_credentials,
};
use crate::config::LxcSection;
use crate::errors::RuntimeError;

const REQUIRED_TOOLS: [&str; 4] = ["lxc-create", "lxc-start", "lxc-stop", "lxc-info"];

/// Output of one host command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stderr if present, else stdout; used as the raw diagnostic text.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        text.trim().to_string()
    }
}

/// Abstraction over host command execution.
/// Real implementation: `HostCommands`. Tests script the outputs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program`; `env` is added to the inherited environment.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> std::io::Result<CommandOutput>;
}

pub struct HostCommands;

#[async_trait]
impl CommandRunner for HostCommands {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// `lxc-create` template parameters derived from an image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LxcImage {
    pub dist: String,
    pub release: String,
}

/// Map an image reference such as `ubuntu:22.04` or `debian:bookworm` onto
/// a download-template distribution and release. Unknown images fall back
/// to Ubuntu focal.
pub fn parse_image(image: &str) -> LxcImage {
    let (name, version) = match image.split_once(':') {
        Some((n, v)) => (n.to_lowercase(), Some(v.to_lowercase())),
        None => (image.to_lowercase(), None),
    };
    let version = version.filter(|v| v != "latest");
    let name = name.rsplit('/').next().unwrap_or_default().to_string();

    let (dist, release) = match name.as_str() {
        "ubuntu" => (
            "ubuntu",
            match version.as_deref() {
                Some("20.04") | None => "focal".to_string(),
                Some("22.04") => "jammy".to_string(),
                Some("24.04") => "noble".to_string(),
                Some(other) => other.to_string(),
            },
        ),
        "debian" => (
            "debian",
            match version.as_deref() {
                Some("11") | None => "bullseye".to_string(),
                Some("12") => "bookworm".to_string(),
                Some(other) => other.to_string(),
            },
        ),
        "alpine" => ("alpine", version.unwrap_or_else(|| "3.18".to_string())),
        _ => ("ubuntu", "focal".to_string()),
    };
    LxcImage {
        dist: dist.to_string(),
        release,
    }
}

/// Map an `lxc-ls` state column onto `ContainerStatus`.
pub fn map_lxc_state(state: &str) -> ContainerStatus {
    match state.to_ascii_uppercase().as_str() {
        "RUNNING" => ContainerStatus::Running,
        "STOPPED" => ContainerStatus::Stopped,
        "FROZEN" => ContainerStatus::Paused,
        _ => ContainerStatus::Stopped,
    }
}

/// One row of `lxc-ls -f -F name,state,ipv4`.
#[derive(Debug, Clone, PartialEq)]
pub struct LxcListing {
    pub name: String,
    pub status: ContainerStatus,
    pub ip: Option<String>,
}

pub fn parse_lxc_ls(output: &str) -> Vec<LxcListing> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                return None;
            }
            let ip = fields
                .get(2)
                .map(|s| s.trim_end_matches(','))
                .filter(|s| *s != "-" && !s.is_empty())
                .map(str::to_string);
            Some(LxcListing {
                name: fields[0].to_string(),
                status: map_lxc_state(fields[1]),
                ip,
            })
        })
        .collect()
}

fn lxc_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "armhf",
        other => other,
    }
}

pub struct LxcRuntime {
    settings: LxcSection,
    commands: Arc<dyn CommandRunner>,
    registry: RwLock<HashMap<String, Container>>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl LxcRuntime {
    pub fn new(settings: LxcSection) -> Self {
        Self::with_commands(settings, Arc::new(HostCommands))
    }

    pub fn with_commands(settings: LxcSection, commands: Arc<dyn CommandRunner>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            commands,
            registry: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Tools on PATH and the current user may drive them.
    pub async fn is_available() -> bool {
        if !REQUIRED_TOOLS.iter().all(|t| find_on_path(t).is_some()) {
            return false;
        }
        if is_root() {
            return true;
        }
        match HostCommands.run("id", &args(["-Gn"]), &HashMap::new()).await {
            Ok(out) if out.success => {
                let groups = out.stdout.to_lowercase();
                groups.contains("lxd") || groups.contains("lxc")
            }
            _ => false,
        }
    }

    fn emit(&self, event_type: &str, id: &str, message: impl Into<String>) {
        let _ = self
            .events
            .send(RuntimeEvent::new(RuntimeType::Lxc, event_type, id, message));
    }

    fn fail(&self, event_type: &str, id: &str, message: String) -> RuntimeError {
        warn!(container = %id, "{}", message);
        self.emit(event_type, id, message.clone());
        RuntimeError::backend(RuntimeType::Lxc, message)
    }

    async fn run(&self, program: &str, argv: Vec<String>) -> Result<CommandOutput, RuntimeError> {
        self.run_env(program, argv, &HashMap::new()).await
    }

    async fn run_env(
        &self,
        program: &str,
        argv: Vec<String>,
        env: &HashMap<String, String>,
    ) -> Result<CommandOutput, RuntimeError> {
        debug!(program, args = %redact_credentials(&argv.join(" ")), "lxc command");
        self.commands
            .run(program, &argv, env)
            .await
            .map_err(|e| RuntimeError::backend(RuntimeType::Lxc, format!("{}: {}", program, e)))
    }

    /// `-P <lxc_path> -n <id>` followed by `rest`.
    fn target(&self, id: &str, rest: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "-P".to_string(),
            self.settings.lxc_path.display().to_string(),
            "-n".to_string(),
            id.to_string(),
        ];
        argv.extend(rest.iter().map(|s| s.to_string()));
        argv
    }

    /// Run and require success, mapping failure to a backend error.
    async fn run_ok(
        &self,
        program: &str,
        argv: Vec<String>,
        event_type: &str,
        id: &str,
    ) -> Result<CommandOutput, RuntimeError> {
        let out = self.run(program, argv).await?;
        if !out.success {
            return Err(self.fail(
                event_type,
                id,
                format!("{} failed: {}", program, out.diagnostic()),
            ));
        }
        Ok(out)
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.settings.lxc_path.join(id)
    }

    async fn write_environment(
        &self,
        id: &str,
        environment: &HashMap<String, String>,
    ) -> std::io::Result<()> {
        if environment.is_empty() {
            return Ok(());
        }
        let path = self.container_dir(id).join("config");
        let mut config = tokio::fs::read_to_string(&path).await?;
        config.push_str("\n# diplo environment\n");
        let mut keys: Vec<&String> = environment.keys().collect();
        keys.sort();
        for key in keys {
            config.push_str(&format!("lxc.environment = {}={}\n", key, environment[key]));
        }
        tokio::fs::write(&path, config).await
    }

    async fn wait_until_running(&self, id: &str) -> Result<(), RuntimeError> {
        let deadline = Instant::now() + self.settings.start_timeout();
        let interval = self.settings.poll_interval().max(std::time::Duration::from_millis(1));
        loop {
            if let Ok(out) = self.run("lxc-info", self.target(id, &["-s"])).await
                && out.success
                && out.stdout.contains("RUNNING")
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(self.fail(
                    "container_start_timeout",
                    id,
                    format!(
                        "container {} did not reach RUNNING within {}s",
                        id,
                        self.settings.start_timeout().as_secs_f64()
                    ),
                ));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Reconcile the registry with `lxc-ls`.
    async fn refresh(&self) -> Result<(), RuntimeError> {
        let out = self
            .run_ok(
                "lxc-ls",
                vec![
                    "-P".to_string(),
                    self.settings.lxc_path.display().to_string(),
                    "-f".to_string(),
                    "-F".to_string(),
                    "name,state,ipv4".to_string(),
                ],
                "container_list_error",
                "",
            )
            .await?;
        let listing = parse_lxc_ls(&out.stdout);
        let mut registry = self.registry.write().await;
        for row in listing {
            match registry.get_mut(&row.name) {
                Some(existing) => {
                    existing.status = row.status;
                    if row.ip.is_some() {
                        existing.network.ip_address = row.ip;
                    }
                }
                None => {
                    let mut metadata = HashMap::new();
                    metadata.insert("discovered".to_string(), "true".to_string());
                    registry.insert(
                        row.name.clone(),
                        Container {
                            id: row.name.clone(),
                            name: row.name,
                            image: "unknown".to_string(),
                            status: row.status,
                            runtime: RuntimeType::Lxc,
                            created_at: Utc::now(),
                            started_at: None,
                            stopped_at: None,
                            config: ContainerConfig::default(),
                            network: NetworkInfo {
                                ip_address: row.ip,
                                ..Default::default()
                            },
                            resources: Default::default(),
                            labels: HashMap::new(),
                            metadata,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn set_status(&self, id: &str, status: ContainerStatus) {
        let mut registry = self.registry.write().await;
        if let Some(c) = registry.get_mut(id) {
            c.status = status;
            match status {
                ContainerStatus::Running => c.started_at = Some(Utc::now()),
                ContainerStatus::Stopped => c.stopped_at = Some(Utc::now()),
                _ => {}
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for LxcRuntime {
    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Lxc
    }

    async fn runtime_info(&self) -> Result<RuntimeInfo, RuntimeError> {
        let version = match self.run("lxc-create", args(["--version"])).await {
            Ok(out) if out.success => out.stdout.trim().to_string(),
            _ => "native".to_string(),
        };
        let mut metadata = HashMap::new();
        metadata.insert(
            "lxc_path".to_string(),
            self.settings.lxc_path.display().to_string(),
        );
        Ok(RuntimeInfo {
            runtime_type: RuntimeType::Lxc,
            version,
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            available: true,
            capabilities: ["create", "start", "stop", "destroy", "exec", "logs", "networking"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            metadata,
        })
    }

    async fn create_container(
        &self,
        request: &CreateContainerRequest,
    ) -> Result<Container, RuntimeError> {
        let id = request.name.clone();
        let image = parse_image(&request.image);
        info!(container = %id, dist = %image.dist, release = %image.release, "Creating LXC container");
        self.emit("container_create_start", &id, format!("Creating container from {}", request.image));

        let argv = self.target(
            &id,
            &[
                "-t",
                "download",
                "--",
                "--dist",
                image.dist.as_str(),
                "--release",
                image.release.as_str(),
                "--arch",
                lxc_arch(),
            ],
        );
        self.run_ok("lxc-create", argv, "container_create_error", &id)
            .await?;

        if let Err(e) = self.write_environment(&id, &request.environment).await {
            let _ = self.run("lxc-destroy", self.target(&id, &[])).await;
            return Err(self.fail(
                "container_create_error",
                &id,
                format!("failed to write container config: {}", e),
            ));
        }

        let mut metadata = HashMap::new();
        metadata.insert("dist".to_string(), image.dist);
        metadata.insert("release".to_string(), image.release);
        let container = Container {
            id: id.clone(),
            name: id.clone(),
            image: request.image.clone(),
            status: ContainerStatus::Created,
            runtime: RuntimeType::Lxc,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            config: request.config(),
            network: NetworkInfo {
                ports: request.ports.clone(),
                ip_address: None,
                network_mode: request.network_mode.clone(),
            },
            resources: request.resources.clone(),
            labels: request.labels.clone(),
            metadata,
        };
        self.registry
            .write()
            .await
            .insert(id.clone(), container.clone());
        self.emit("container_created", &id, "Container created");
        Ok(container)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.emit("container_start", id, "Starting container");
        self.run_ok(
            "lxc-start",
            self.target(id, &["-d"]),
            "container_start_error",
            id,
        )
        .await?;
        self.wait_until_running(id).await?;
        self.set_status(id, ContainerStatus::Running).await;
        self.emit("container_started", id, "Container running");
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.emit("container_stop", id, "Stopping container");
        self.run_ok("lxc-stop", self.target(id, &[]), "container_stop_error", id)
            .await?;
        self.set_status(id, ContainerStatus::Stopped).await;
        self.emit("container_stopped", id, "Container stopped");
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.stop_container(id).await?;
        self.start_container(id).await
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let running = self
            .registry
            .read()
            .await
            .get(id)
            .map(|c| c.status == ContainerStatus::Running)
            .unwrap_or(false);
        if running && let Err(e) = self.stop_container(id).await {
            warn!(container = %id, error = %e, "Stop before destroy failed");
        }
        self.run_ok(
            "lxc-destroy",
            self.target(id, &[]),
            "container_remove_error",
            id,
        )
        .await?;
        self.registry.write().await.remove(id);
        self.emit("container_removed", id, "Container removed");
        Ok(())
    }

    async fn get_container(&self, id: &str) -> Result<Container, RuntimeError> {
        if let Err(e) = self.refresh().await {
            debug!(error = %e, "lxc-ls refresh failed, serving cached state");
        }
        self.registry
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::backend(RuntimeType::Lxc, format!("container {} not found", id)))
    }

    async fn list_containers(&self) -> Result<Vec<Container>, RuntimeError> {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "lxc-ls refresh failed, serving cached state");
        }
        let mut containers: Vec<Container> = self.registry.read().await.values().cloned().collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    async fn container_logs(&self, id: &str, follow: bool) -> Result<LogStream, RuntimeError> {
        let path = self.container_dir(id).join("console.log");
        let interval = self.settings.poll_interval().max(std::time::Duration::from_millis(1));
        Ok(tail_file(path, follow, interval))
    }

    async fn execute_command(
        &self,
        id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ExecResult, RuntimeError> {
        let mut full = self.target(id, &[]);
        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            full.push("--keep-var".to_string());
            full.push(key.clone());
        }
        full.push("--".to_string());
        full.extend(argv.iter().cloned());
        self.emit(
            "container_exec",
            id,
            format!("Executing {}", redact_credentials(&argv.join(" "))),
        );
        let out = self.run_env("lxc-attach", full, env).await?;
        let exit_code = match (out.success, out.code) {
            (true, _) => 0,
            (false, Some(code)) => code as i64,
            (false, None) => 1,
        };
        if exit_code != 0 {
            self.emit(
                "container_exec_error",
                id,
                format!("Command exited with {}", exit_code),
            );
        }
        Ok(ExecResult {
            output: out.stdout,
            error: out.stderr,
            exit_code,
        })
    }

    async fn container_ip(&self, id: &str) -> Result<String, RuntimeError> {
        let out = self
            .run_ok("lxc-info", self.target(id, &["-iH"]), "container_ip_error", id)
            .await?;
        out.stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                RuntimeError::backend(RuntimeType::Lxc, format!("no IP address for container {}", id))
            })
    }

    fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Stream a file's contents; with `follow`, keep polling for appended bytes.
fn tail_file(path: PathBuf, follow: bool, interval: std::time::Duration) -> LogStream {
    async_stream::stream! {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !follow => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Ok(f) = tokio::fs::File::open(&path).await {
                        break f;
                    }
                }
            }
            Err(e) => {
                yield Err(RuntimeError::backend(RuntimeType::Lxc, format!("{}: {}", path.display(), e)));
                return;
            }
        };
        let mut offset = 0u64;
        let mut buf = vec![0u8; 8192];
        loop {
            match file.read(&mut buf).await {
                Ok(0) if !follow => return,
                Ok(0) => {
                    tokio::time::sleep(interval).await;
                    // Truncated (console log rotated); start over.
                    if let Ok(meta) = tokio::fs::metadata(&path).await
                        && meta.len() < offset
                    {
                        offset = 0;
                        if file.seek(std::io::SeekFrom::Start(0)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(n) => {
                    offset += n as u64;
                    yield Ok(buf[..n].to_vec());
                }
                Err(e) => {
                    yield Err(RuntimeError::backend(RuntimeType::Lxc, e.to_string()));
                    return;
                }
            }
        }
    }
    .boxed()
}

fn find_on_path(tool: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

fn is_root() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|l| l.starts_with("Uid:"))
                .and_then(|l| l.split_whitespace().nth(1).map(|uid| uid == "0"))
        })
        .unwrap_or(false)
}
