//! In-memory doubles for the runtime traits.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Notify, broadcast};

use super::{
    BuildMessage, HostProfile, BuildStream, Container, ContainerRuntime, ContainerStatus,
    CreateContainerRequest, EVENT_CHANNEL_CAPACITY, EventStream, ExecResult, ImageBackend,
    ImageSummary, LogStream, NetworkInfo, PruneReport, RuntimeEvent, RuntimeInfo, RuntimeProvider,
    RuntimeType,
};
use crate::errors::RuntimeError;

#[derive(Default)]
pub struct MockState {
    pub build_messages: Vec<BuildMessage>,
    /// Popped per lookup; `None` once exhausted
    pub find_results: VecDeque<Option<String>>,
    pub find_calls: u32,
    pub built_tags: Vec<String>,
    pub built_dockerfiles: Vec<String>,
    /// File names at the root of each build's source tree
    pub built_sources: Vec<Option<Vec<String>>>,
    /// Builds wait for one notification each while set
    pub build_gate: Option<Arc<Notify>>,
    pub created: Vec<CreateContainerRequest>,
    pub containers: HashMap<String, Container>,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub removed: Vec<String>,
    pub fail_start: bool,
    pub fail_stop: bool,
    pub fail_remove: bool,
    pub exec_calls: Vec<Vec<String>>,
    pub exec_env: Vec<HashMap<String, String>>,
    pub exec_result: ExecResult,
    pub log_lines: Vec<String>,
    /// Followed log streams stay open after `log_lines`
    pub hold_logs: bool,
    pub images: Vec<ImageSummary>,
    pub removed_images: Vec<String>,
    pub tagged: Vec<(String, String, String)>,
    pub prune_calls: u32,
}

pub struct MockRuntime {
    runtime_type: RuntimeType,
    events: broadcast::Sender<RuntimeEvent>,
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new(runtime_type: RuntimeType) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            runtime_type,
            events,
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Build stream ending in `Successfully built <id>`, with lookups that
    /// find the image on the first try.
    pub fn succeed_builds(&self, image_id: &str) {
        let mut st = self.state();
        st.build_messages = vec![
            BuildMessage {
                stream: Some("Step 1/2 : FROM scratch\n".into()),
                ..Default::default()
            },
            BuildMessage {
                stream: Some(format!("Successfully built {}\n", image_id)),
                ..Default::default()
            },
        ];
        st.find_results = VecDeque::from(vec![Some(format!("sha256:{}", image_id)); 8]);
    }

    fn emit(&self, event_type: &str, id: &str) {
        let _ = self
            .events
            .send(RuntimeEvent::new(self.runtime_type, event_type, id, event_type));
    }

    fn missing(&self, id: &str) -> RuntimeError {
        RuntimeError::backend(self.runtime_type, format!("no such container: {}", id))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    async fn runtime_info(&self) -> Result<RuntimeInfo, RuntimeError> {
        Ok(RuntimeInfo {
            runtime_type: self.runtime_type,
            version: "mock".into(),
            os: "linux".into(),
            architecture: "amd64".into(),
            available: true,
            capabilities: vec![],
            metadata: HashMap::new(),
        })
    }

    async fn create_container(
        &self,
        request: &CreateContainerRequest,
    ) -> Result<Container, RuntimeError> {
        let container = {
            let mut st = self.state();
            st.created.push(request.clone());
            let id = format!("ctr-{}", st.created.len());
            let container = Container {
                id: id.clone(),
                name: request.name.clone(),
                image: request.image.clone(),
                status: ContainerStatus::Created,
                runtime: self.runtime_type,
                created_at: Utc::now(),
                started_at: None,
                stopped_at: None,
                config: request.config(),
                network: NetworkInfo {
                    ports: request.ports.clone(),
                    ..Default::default()
                },
                resources: request.resources.clone(),
                labels: request.labels.clone(),
                metadata: HashMap::new(),
            };
            st.containers.insert(id, container.clone());
            container
        };
        let _ = self.events.send(
            RuntimeEvent::new(self.runtime_type, "container_created", &container.id, "created")
                .with_meta("name", container.name.clone()),
        );
        Ok(container)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        {
            let mut st = self.state();
            if st.fail_start {
                return Err(RuntimeError::backend(self.runtime_type, "port is already allocated"));
            }
            let c = st.containers.get_mut(id).ok_or_else(|| self.missing(id))?;
            c.status = ContainerStatus::Running;
            st.started.push(id.to_string());
        }
        self.emit("container_started", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut st = self.state();
        if st.fail_stop {
            return Err(RuntimeError::backend(self.runtime_type, "stop timed out"));
        }
        let c = st.containers.get_mut(id).ok_or_else(|| self.missing(id))?;
        c.status = ContainerStatus::Stopped;
        st.stopped.push(id.to_string());
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.stop_container(id).await?;
        self.start_container(id).await
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut st = self.state();
        if st.fail_remove {
            return Err(RuntimeError::backend(self.runtime_type, "removal already in progress"));
        }
        st.containers.remove(id).ok_or_else(|| self.missing(id))?;
        st.removed.push(id.to_string());
        Ok(())
    }

    async fn get_container(&self, id: &str) -> Result<Container, RuntimeError> {
        self.state()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| self.missing(id))
    }

    async fn list_containers(&self) -> Result<Vec<Container>, RuntimeError> {
        Ok(self.state().containers.values().cloned().collect())
    }

    async fn container_logs(&self, _id: &str, follow: bool) -> Result<LogStream, RuntimeError> {
        let st = self.state();
        let lines: Vec<Result<Vec<u8>, RuntimeError>> = st
            .log_lines
            .iter()
            .map(|l| Ok(format!("{}\n", l).into_bytes()))
            .collect();
        let logs = futures::stream::iter(lines);
        if follow && st.hold_logs {
            return Ok(logs.chain(futures::stream::pending()).boxed());
        }
        Ok(logs.boxed())
    }

    async fn execute_command(
        &self,
        _id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ExecResult, RuntimeError> {
        let mut st = self.state();
        st.exec_calls.push(argv.to_vec());
        st.exec_env.push(env.clone());
        Ok(st.exec_result.clone())
    }

    async fn container_ip(&self, _id: &str) -> Result<String, RuntimeError> {
        Ok("10.0.3.15".into())
    }

    fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[async_trait]
impl ImageBackend for MockRuntime {
    async fn build_image(
        &self,
        dockerfile: &str,
        tag: &str,
        source: Option<&Path>,
    ) -> Result<BuildStream, RuntimeError> {
        let gate = self.state().build_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let listing = source.map(|dir| {
            let mut names: Vec<String> = std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.file_name().to_string_lossy().to_string())
                        .collect()
                })
                .unwrap_or_default();
            names.sort();
            names
        });
        let messages: Vec<Result<BuildMessage, RuntimeError>> = {
            let mut st = self.state();
            st.built_tags.push(tag.to_string());
            st.built_dockerfiles.push(dockerfile.to_string());
            st.built_sources.push(listing);
            st.build_messages.iter().cloned().map(Ok).collect()
        };
        Ok(futures::stream::iter(messages).boxed())
    }

    async fn find_image_by_tag(&self, _tag: &str) -> Result<Option<String>, RuntimeError> {
        let mut st = self.state();
        st.find_calls += 1;
        Ok(st.find_results.pop_front().flatten())
    }

    async fn list_images(&self, prefix: &str) -> Result<Vec<ImageSummary>, RuntimeError> {
        Ok(self
            .state()
            .images
            .iter()
            .filter(|img| img.tags.iter().any(|t| t.starts_with(prefix)))
            .cloned()
            .collect())
    }

    async fn tag_image(&self, id: &str, repo: &str, tag: &str) -> Result<(), RuntimeError> {
        self.state()
            .tagged
            .push((id.to_string(), repo.to_string(), tag.to_string()));
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        let mut st = self.state();
        st.images.retain(|img| img.id != id);
        st.removed_images.push(id.to_string());
        Ok(())
    }

    async fn prune_dangling_images(&self) -> Result<PruneReport, RuntimeError> {
        self.state().prune_calls += 1;
        Ok(PruneReport::default())
    }
}

/// Fixed set of mock backends.
pub struct MockProvider {
    runtimes: HashMap<RuntimeType, Arc<MockRuntime>>,
    preferred: RuntimeType,
}

impl MockProvider {
    pub fn new(runtimes: Vec<Arc<MockRuntime>>) -> Arc<Self> {
        let preferred = runtimes
            .first()
            .map(|r| r.runtime_type())
            .unwrap_or(RuntimeType::Docker);
        Arc::new(Self {
            runtimes: runtimes.into_iter().map(|r| (r.runtime_type(), r)).collect(),
            preferred,
        })
    }
}

#[async_trait]
impl RuntimeProvider for MockProvider {
    async fn available(&self) -> Vec<RuntimeType> {
        let mut types: Vec<RuntimeType> = self.runtimes.keys().copied().collect();
        types.sort();
        types
    }

    async fn preferred(&self) -> RuntimeType {
        self.preferred
    }

    async fn profile(&self) -> HostProfile {
        HostProfile::sense_from(std::path::Path::new("/nonexistent"), "linux", "x86_64")
    }

    async fn runtime(
        &self,
        runtime_type: RuntimeType,
    ) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        self.runtimes
            .get(&runtime_type)
            .map(|r| Arc::clone(r) as Arc<dyn ContainerRuntime>)
            .ok_or(RuntimeError::Unavailable(runtime_type))
    }

    async fn image_backend(&self) -> Result<Arc<dyn ImageBackend>, RuntimeError> {
        self.runtimes
            .get(&RuntimeType::Docker)
            .map(|r| Arc::clone(r) as Arc<dyn ImageBackend>)
            .ok_or(RuntimeError::Unavailable(RuntimeType::Docker))
    }
}
