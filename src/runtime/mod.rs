//! Container runtime abstraction.
//!
//! Every backend implements [`ContainerRuntime`]: one flat capability set,
//! one adapter type per engine. The [`factory::RuntimeFactory`] senses the
//! host, tracks which adapters are usable and hands out the preferred one.
//!
//! ```text
//!                 ┌────────────────────────────┐
//!  pipeline ────> │ factory.rs  RuntimeFactory │ ── host.rs (HostProfile)
//!                 └─────────────┬──────────────┘
//!                               │ Arc<dyn ContainerRuntime>
//!          ┌────────────────────┼─────────────────────┐
//!          v                    v                     v
//!   docker.rs (bollard)   containerd.rs (stub)   lxc.rs (lxc-* tools)
//! ```
//!
//! Only the Docker adapter also implements [`ImageBackend`]; images are
//! always built by the Docker daemon.

pub mod containerd;
pub mod docker;
pub mod factory;
pub mod host;
pub mod lxc;
#[cfg(test)]
pub mod testing;
pub mod types;

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use futures::stream::BoxStream;
use regex::Regex;
use tokio::sync::broadcast;

use crate::errors::RuntimeError;

pub use factory::{RuntimeFactory, RuntimeProvider};
pub use host::HostProfile;
pub use types::*;

/// Raw container output, chunked as the backend delivers it.
pub type LogStream = BoxStream<'static, Result<Vec<u8>, RuntimeError>>;

/// Decoded build-progress messages, ending at EOF or the first error.
pub type BuildStream = BoxStream<'static, Result<BuildMessage, RuntimeError>>;

/// Per-subscriber event feed. Dropping the receiver unsubscribes.
pub type EventStream = broadcast::Receiver<RuntimeEvent>;

/// Capacity of each adapter's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Build-context directory holding a host checkout.
pub const CONTEXT_SOURCE_DIR: &str = "source";

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn runtime_type(&self) -> RuntimeType;

    async fn runtime_info(&self) -> Result<RuntimeInfo, RuntimeError>;

    async fn create_container(
        &self,
        request: &CreateContainerRequest,
    ) -> Result<Container, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn get_container(&self, id: &str) -> Result<Container, RuntimeError>;

    async fn list_containers(&self) -> Result<Vec<Container>, RuntimeError>;

    /// Container output. With `follow` the stream stays open until the
    /// container exits or the stream is dropped.
    async fn container_logs(&self, id: &str, follow: bool) -> Result<LogStream, RuntimeError>;

    /// Run `argv` inside the container. `env` is visible to this command
    /// only and never appears in its arguments.
    async fn execute_command(
        &self,
        id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ExecResult, RuntimeError>;

    async fn container_ip(&self, id: &str) -> Result<String, RuntimeError>;

    /// Subscribe to lifecycle events from this adapter.
    fn subscribe(&self) -> EventStream;

    async fn close(&self) -> Result<(), RuntimeError>;
}

/// Image build and index operations used by the image pipeline.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Submit a build of `dockerfile` tagged `tag`. The context holds the
    /// Dockerfile and, when given, the `source` tree under `source/`.
    async fn build_image(
        &self,
        dockerfile: &str,
        tag: &str,
        source: Option<&Path>,
    ) -> Result<BuildStream, RuntimeError>;

    /// Id of the image carrying `tag`, if the index knows it yet.
    async fn find_image_by_tag(&self, tag: &str) -> Result<Option<String>, RuntimeError>;

    /// Images with at least one tag starting with `prefix`.
    async fn list_images(&self, prefix: &str) -> Result<Vec<ImageSummary>, RuntimeError>;

    /// Point `repo:tag` at image `id`.
    async fn tag_image(&self, id: &str, repo: &str, tag: &str) -> Result<(), RuntimeError>;

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError>;

    async fn prune_dangling_images(&self) -> Result<PruneReport, RuntimeError>;
}

static URL_USERINFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z][A-Za-z0-9+.-]*://)[^\s/@'"]+@"#).unwrap());

/// Mask the credentials of every URL in `text`.
pub fn redact_credentials(text: &str) -> String {
    URL_USERINFO.replace_all(text, "${1}***@").into_owned()
}
