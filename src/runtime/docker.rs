//! Docker adapter over the engine API (bollard).
//!
//! Also the only [`ImageBackend`]: build contexts are a single-file tar
//! archive holding the generated Dockerfile.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::StartExecResults;
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, ExecConfig, HostConfig, PortBinding,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, ListContainersOptionsBuilder,
    ListImagesOptionsBuilder, LogsOptionsBuilder, PruneImagesOptionsBuilder,
    RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder, RestartContainerOptionsBuilder,
    StopContainerOptionsBuilder, TagImageOptionsBuilder,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    BuildMessage, BuildStream, CONTEXT_SOURCE_DIR, Container, ContainerConfig, ContainerRuntime,
    ContainerStatus, CreateContainerRequest, EVENT_CHANNEL_CAPACITY, EventStream, ExecResult, ImageBackend,
    ImageSummary, LogStream, NetworkInfo, PortMapping, PruneReport, ResourceLimits, RuntimeEvent,
    RuntimeInfo, RuntimeType,
};
use crate::config::DockerSection;
use crate::errors::RuntimeError;

/// Seconds the engine waits for a graceful stop before killing.
const STOP_TIMEOUT_SECS: i32 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 120;
const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

fn backend_err(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::backend(RuntimeType::Docker, e.to_string())
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

pub struct DockerRuntime {
    docker: Docker,
    events: broadcast::Sender<RuntimeEvent>,
}

impl DockerRuntime {
    /// Connect using `settings.host` (`unix://`, `tcp://`, `http://`) or the
    /// local defaults (`DOCKER_HOST`, then the platform socket).
    pub fn connect(settings: &DockerSection) -> Result<Self, RuntimeError> {
        let docker = match settings.host.as_deref() {
            Some(host) if host.starts_with("unix://") => Docker::connect_with_socket(
                host,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(host) => {
                return Err(RuntimeError::backend(
                    RuntimeType::Docker,
                    format!("unsupported docker host: {}", host),
                ));
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(backend_err)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self { docker, events })
    }

    /// Reachable daemon that answers a ping.
    pub async fn is_available(settings: &DockerSection) -> bool {
        match Self::connect(settings) {
            Ok(rt) => match tokio::time::timeout(PROBE_TIMEOUT, rt.docker.ping()).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    debug!(error = %e, "Docker ping failed");
                    false
                }
                Err(_) => {
                    debug!("Docker ping timed out");
                    false
                }
            },
            Err(e) => {
                debug!(error = %e, "Docker connect failed");
                false
            }
        }
    }

    fn emit(&self, event_type: &str, id: &str, message: impl Into<String>) {
        let _ = self
            .events
            .send(RuntimeEvent::new(RuntimeType::Docker, event_type, id, message));
    }

    fn fail(&self, event_type: &str, id: &str, e: impl std::fmt::Display) -> RuntimeError {
        let message = e.to_string();
        warn!(container = %id, "{}", message);
        self.emit(event_type, id, message.clone());
        RuntimeError::backend(RuntimeType::Docker, message)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Docker
    }

    async fn runtime_info(&self) -> Result<RuntimeInfo, RuntimeError> {
        let version = self.docker.version().await.map_err(backend_err)?;
        let mut metadata = HashMap::new();
        if let Some(api) = version.api_version {
            metadata.insert("api_version".to_string(), api);
        }
        Ok(RuntimeInfo {
            runtime_type: RuntimeType::Docker,
            version: version.version.unwrap_or_else(|| "unknown".to_string()),
            os: version.os.unwrap_or_else(|| std::env::consts::OS.to_string()),
            architecture: version
                .arch
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            available: true,
            capabilities: [
                "create", "start", "stop", "restart", "remove", "logs", "exec", "build",
                "networking", "volumes",
            ]
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
        info!(name = %request.name, image = %request.image, "Creating Docker container");
        self.emit("container_create_start", &request.name, "Creating container");

        let options = CreateContainerOptionsBuilder::default()
            .name(&request.name)
            .build();
        let created = self
            .docker
            .create_container(Some(options), container_body(request))
            .await
            .map_err(|e| self.fail("container_create_error", &request.name, e))?;
        for warning in &created.warnings {
            warn!(container = %created.id, "{}", warning);
        }

        let _ = self.events.send(
            RuntimeEvent::new(RuntimeType::Docker, "container_created", &created.id, "Container created")
                .with_meta("name", request.name.clone()),
        );
        Ok(Container {
            id: created.id,
            name: request.name.clone(),
            image: request.image.clone(),
            status: ContainerStatus::Created,
            runtime: RuntimeType::Docker,
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
            metadata: HashMap::new(),
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None)
            .await
            .map_err(|e| self.fail("container_start_error", id, e))?;
        self.emit("container_started", id, "Container started");
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptionsBuilder::default()
            .t(STOP_TIMEOUT_SECS)
            .build();
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| self.fail("container_stop_error", id, e))?;
        self.emit("container_stopped", id, "Container stopped");
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RestartContainerOptionsBuilder::default()
            .t(STOP_TIMEOUT_SECS)
            .build();
        self.docker
            .restart_container(id, Some(options))
            .await
            .map_err(|e| self.fail("container_restart_error", id, e))?;
        self.emit("container_restarted", id, "Container restarted");
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| self.fail("container_remove_error", id, e))?;
        self.emit("container_removed", id, "Container removed");
        Ok(())
    }

    async fn get_container(&self, id: &str) -> Result<Container, RuntimeError> {
        let inspected = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(backend_err)?;
        Ok(container_from_inspect(inspected))
    }

    async fn list_containers(&self) -> Result<Vec<Container>, RuntimeError> {
        let options = ListContainersOptionsBuilder::default().all(true).build();
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(backend_err)?;
        let mut containers = Vec::with_capacity(summaries.len());
        for id in summaries.into_iter().filter_map(|s| s.id) {
            match self.docker.inspect_container(&id, None).await {
                Ok(inspected) => containers.push(container_from_inspect(inspected)),
                // Removed between list and inspect.
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(backend_err(e)),
            }
        }
        Ok(containers)
    }

    async fn container_logs(&self, id: &str, follow: bool) -> Result<LogStream, RuntimeError> {
        let options = LogsOptionsBuilder::default()
            .follow(follow)
            .stdout(true)
            .stderr(true)
            .build();
        let stream = self
            .docker
            .logs(id, Some(options))
            .map(|item| {
                item.map(|out: LogOutput| out.into_bytes().to_vec())
                    .map_err(backend_err)
            })
            .boxed();
        Ok(stream)
    }

    async fn execute_command(
        &self,
        id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ExecResult, RuntimeError> {
        let config = ExecConfig {
            cmd: Some(argv.to_vec()),
            env: (!env.is_empty())
                .then(|| env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(id, config)
            .await
            .map_err(|e| self.fail("container_exec_error", id, e))?;

        let mut output = String::new();
        let mut error = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| self.fail("container_exec_error", id, e))?
        {
            StartExecResults::Attached { output: mut out, .. } => {
                while let Some(chunk) = out.next().await {
                    match chunk.map_err(backend_err)? {
                        LogOutput::StdErr { message } => {
                            error.push_str(&String::from_utf8_lossy(&message))
                        }
                        other => output.push_str(&String::from_utf8_lossy(&other.into_bytes())),
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(backend_err)?;
        Ok(ExecResult {
            output,
            error,
            exit_code: inspected.exit_code.unwrap_or(0),
        })
    }

    async fn container_ip(&self, id: &str) -> Result<String, RuntimeError> {
        let inspected = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(backend_err)?;
        container_ip_from(&inspected).ok_or_else(|| {
            RuntimeError::backend(
                RuntimeType::Docker,
                format!("no IP address for container {}", id),
            )
        })
    }

    fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[async_trait]
impl ImageBackend for DockerRuntime {
    async fn build_image(
        &self,
        dockerfile: &str,
        tag: &str,
        source: Option<&Path>,
    ) -> Result<BuildStream, RuntimeError> {
        let dockerfile = dockerfile.to_string();
        let source = source.map(Path::to_path_buf);
        let context = tokio::task::spawn_blocking(move || build_context(&dockerfile, source))
            .await
            .map_err(backend_err)?
            .map_err(backend_err)?;
        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(tag)
            .nocache(true)
            .rm(true)
            .forcerm(true)
            .build();
        info!(tag, "Submitting image build");
        let docker = self.docker.clone();
        let stream = async_stream::stream! {
            let mut build = std::pin::pin!(docker.build_image(
                options,
                None,
                Some(bollard::body_full(context.into())),
            ));
            while let Some(item) = build.next().await {
                yield match item {
                    Ok(info) => Ok(BuildMessage {
                        stream: info.stream,
                        error: info.error_detail.and_then(|d| d.message),
                        aux_id: info.aux.and_then(|aux| aux.id),
                    }),
                    Err(e) => Err(backend_err(e)),
                };
            }
        };
        Ok(stream.boxed())
    }

    async fn find_image_by_tag(&self, tag: &str) -> Result<Option<String>, RuntimeError> {
        match self.docker.inspect_image(tag).await {
            Ok(image) => Ok(image.id),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn list_images(&self, prefix: &str) -> Result<Vec<ImageSummary>, RuntimeError> {
        let options = ListImagesOptionsBuilder::default().all(false).build();
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(backend_err)?;
        Ok(images
            .into_iter()
            .map(|img| ImageSummary {
                id: img.id,
                tags: img.repo_tags,
                created: img.created,
            })
            .filter(|img| img.tags.iter().any(|t| t.starts_with(prefix)))
            .collect())
    }

    async fn tag_image(&self, id: &str, repo: &str, tag: &str) -> Result<(), RuntimeError> {
        let options = TagImageOptionsBuilder::default().repo(repo).tag(tag).build();
        self.docker
            .tag_image(id, Some(options))
            .await
            .map_err(backend_err)
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveImageOptionsBuilder::default().force(true).build();
        self.docker
            .remove_image(id, Some(options), None)
            .await
            .map_err(backend_err)?;
        debug!(image = %id, "Image removed");
        Ok(())
    }

    async fn prune_dangling_images(&self) -> Result<PruneReport, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["true".to_string()]);
        let options = PruneImagesOptionsBuilder::default()
            .filters(&filters)
            .build();
        let response = self
            .docker
            .prune_images(Some(options))
            .await
            .map_err(backend_err)?;
        let removed = response
            .images_deleted
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| item.deleted.or(item.untagged))
            .collect();
        Ok(PruneReport {
            removed,
            space_reclaimed: response.space_reclaimed.unwrap_or(0).max(0) as u64,
        })
    }
}

/// Tar archive containing only `Dockerfile`.
pub fn build_context(dockerfile: &str, source: Option<PathBuf>) -> std::io::Result<Vec<u8>> {
    let bytes = dockerfile.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, "Dockerfile", bytes)?;
    if let Some(root) = source {
        append_source(&mut builder, &root)?;
    }
    builder.into_inner()
}

/// Add a checkout under `source/`, without git metadata or symlinks.
fn append_source(builder: &mut tar::Builder<Vec<u8>>, root: &Path) -> std::io::Result<()> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_name() == ".git" {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).map_err(std::io::Error::other)?;
            let name = Path::new(CONTEXT_SOURCE_DIR).join(relative);
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                builder.append_dir(&name, &path)?;
                pending.push(path);
            } else if file_type.is_file() {
                builder.append_path_with_name(&path, &name)?;
            }
        }
    }
    Ok(())
}

/// Map a Docker state string onto `ContainerStatus`.
pub fn map_state(state: &str) -> ContainerStatus {
    match state.to_ascii_lowercase().as_str() {
        "created" => ContainerStatus::Created,
        "running" | "restarting" => ContainerStatus::Running,
        "paused" => ContainerStatus::Paused,
        "exited" => ContainerStatus::Exited,
        "dead" => ContainerStatus::Error,
        _ => ContainerStatus::Stopped,
    }
}

/// Engine port bindings keyed `"<port>/<proto>"`.
pub fn port_bindings(ports: &[PortMapping]) -> HashMap<String, Option<Vec<PortBinding>>> {
    ports
        .iter()
        .map(|p| {
            (
                format!("{}/{}", p.container_port, p.protocol),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(p.host_port.to_string()),
                }]),
            )
        })
        .collect()
}

pub fn restart_policy(name: Option<&str>) -> Option<RestartPolicy> {
    let name = match name? {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => return None,
    };
    Some(RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    })
}

fn container_body(request: &CreateContainerRequest) -> ContainerCreateBody {
    let binds: Vec<String> = request
        .volumes
        .iter()
        .map(|v| {
            if v.read_only {
                format!("{}:{}:ro", v.source, v.target)
            } else {
                format!("{}:{}", v.source, v.target)
            }
        })
        .collect();

    let host_config = HostConfig {
        port_bindings: (!request.ports.is_empty()).then(|| port_bindings(&request.ports)),
        binds: (!binds.is_empty()).then_some(binds),
        memory: request.resources.memory,
        cpu_shares: request.resources.cpu_shares,
        nano_cpus: request
            .resources
            .cpu_limit
            .map(|cpus| (cpus * 1_000_000_000.0) as i64),
        network_mode: request.network_mode.clone(),
        restart_policy: restart_policy(request.restart_policy.as_deref()),
        auto_remove: Some(request.auto_remove),
        privileged: Some(request.privileged),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(request.image.clone()),
        cmd: (!request.command.is_empty()).then(|| request.command.clone()),
        env: Some(request.env_list()),
        labels: Some(request.labels.clone()),
        working_dir: request.working_dir.clone(),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        // The engine reports "0001-01-01T00:00:00Z" for never.
        .filter(|t| t.timestamp() > 0)
}

fn container_ip_from(inspected: &ContainerInspectResponse) -> Option<String> {
    inspected
        .network_settings
        .as_ref()?
        .networks
        .as_ref()?
        .values()
        .filter_map(|endpoint| endpoint.ip_address.clone())
        .find(|ip| !ip.is_empty())
}

fn container_from_inspect(inspected: ContainerInspectResponse) -> Container {
    let status = inspected
        .state
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .map(|s| map_state(&s.to_string()))
        .unwrap_or(ContainerStatus::Stopped);
    let started_at = parse_timestamp(
        inspected
            .state
            .as_ref()
            .and_then(|s| s.started_at.as_deref()),
    );
    let stopped_at = parse_timestamp(
        inspected
            .state
            .as_ref()
            .and_then(|s| s.finished_at.as_deref()),
    );
    let ip_address = container_ip_from(&inspected);
    let config = inspected.config.clone().unwrap_or_default();

    let environment: HashMap<String, String> = config
        .env
        .unwrap_or_default()
        .into_iter()
        .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect();
    let labels = config.labels.unwrap_or_default();
    let host = inspected.host_config.clone().unwrap_or_default();

    Container {
        id: inspected.id.unwrap_or_default(),
        name: inspected
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image: config.image.unwrap_or_default(),
        status,
        runtime: RuntimeType::Docker,
        created_at: parse_timestamp(inspected.created.as_deref()).unwrap_or_else(Utc::now),
        started_at,
        stopped_at,
        config: ContainerConfig {
            command: config.cmd.unwrap_or_default(),
            working_dir: config.working_dir.filter(|w| !w.is_empty()),
            environment,
            labels: labels.clone(),
            restart_policy: host
                .restart_policy
                .and_then(|p| p.name)
                .map(|n| n.to_string()),
        },
        network: NetworkInfo {
            ports: Vec::new(),
            ip_address,
            network_mode: host.network_mode,
        },
        resources: ResourceLimits {
            memory: host.memory,
            cpu_shares: host.cpu_shares,
            cpu_limit: host.nano_cpus.map(|n| n as f64 / 1_000_000_000.0),
        },
        labels,
        metadata: HashMap::new(),
    }
}
