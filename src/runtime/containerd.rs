//! containerd adapter.
//!
//! There is no control-API integration yet, so this adapter reports itself
//! unavailable and every operation fails with a backend error. The factory
//! never selects it while it is unavailable.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{
    Container, ContainerRuntime, CreateContainerRequest, EVENT_CHANNEL_CAPACITY, EventStream,
    ExecResult, LogStream, RuntimeEvent, RuntimeInfo, RuntimeType,
};
use crate::errors::RuntimeError;

/// Default control socket path.
pub const CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";

pub struct ContainerdRuntime {
    socket_path: String,
    events: broadcast::Sender<RuntimeEvent>,
}

impl ContainerdRuntime {
    pub fn new() -> Self {
        Self::with_socket(CONTAINERD_SOCKET)
    }

    pub fn with_socket(socket_path: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            socket_path: socket_path.to_string(),
            events,
        }
    }

    /// Always false until a real control-plane integration exists.
    pub fn is_available() -> bool {
        false
    }

    fn unsupported<T>(&self) -> Result<T, RuntimeError> {
        Err(RuntimeError::unsupported(RuntimeType::Containerd))
    }
}

impl Default for ContainerdRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for ContainerdRuntime {
    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Containerd
    }

    async fn runtime_info(&self) -> Result<RuntimeInfo, RuntimeError> {
        let mut metadata = HashMap::new();
        metadata.insert("socket".to_string(), self.socket_path.clone());
        metadata.insert("status".to_string(), "not implemented".to_string());
        Ok(RuntimeInfo {
            runtime_type: RuntimeType::Containerd,
            version: "unknown".to_string(),
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            available: Self::is_available(),
            capabilities: Vec::new(),
            metadata,
        })
    }

    async fn create_container(
        &self,
        _request: &CreateContainerRequest,
    ) -> Result<Container, RuntimeError> {
        self.unsupported()
    }

    async fn start_container(&self, _id: &str) -> Result<(), RuntimeError> {
        self.unsupported()
    }

    async fn stop_container(&self, _id: &str) -> Result<(), RuntimeError> {
        self.unsupported()
    }

    async fn restart_container(&self, _id: &str) -> Result<(), RuntimeError> {
        self.unsupported()
    }

    async fn remove_container(&self, _id: &str) -> Result<(), RuntimeError> {
        self.unsupported()
    }

    async fn get_container(&self, _id: &str) -> Result<Container, RuntimeError> {
        self.unsupported()
    }

    async fn list_containers(&self) -> Result<Vec<Container>, RuntimeError> {
        self.unsupported()
    }

    async fn container_logs(&self, _id: &str, _follow: bool) -> Result<LogStream, RuntimeError> {
        self.unsupported()
    }

    async fn execute_command(
        &self,
        _id: &str,
        _argv: &[String],
        _env: &HashMap<String, String>,
    ) -> Result<ExecResult, RuntimeError> {
        self.unsupported()
    }

    async fn container_ip(&self, _id: &str) -> Result<String, RuntimeError> {
        self.unsupported()
    }

    fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_unavailable() {
        let rt = ContainerdRuntime::new();
        let info = rt.runtime_info().await.unwrap();
        assert!(!info.available);
        assert_eq!(info.runtime_type, RuntimeType::Containerd);
        assert!(info.capabilities.is_empty());
        assert!(!ContainerdRuntime::is_available());
    }

    #[tokio::test]
    async fn test_operations_fail_explicitly() {
        let rt = ContainerdRuntime::new();
        let err = rt.start_container("abc").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Backend {
                backend: RuntimeType::Containerd,
                ..
            }
        ));

        let err = match rt.container_logs("abc", false).await {
            Err(e) => e,
            Ok(_) => panic!("logs must not succeed"),
        };
        assert!(err.to_string().contains("not supported by this backend"));

        assert!(rt.create_container(&CreateContainerRequest::default()).await.is_err());
        assert!(rt.list_containers().await.is_err());
        assert!(rt.execute_command("abc", &["ls".to_string()], &HashMap::new())
                .await
                .is_err());
    }

    #[tokio::test]
    async fn test_close_is_ok() {
        let rt = ContainerdRuntime::with_socket("/tmp/none.sock");
        rt.close().await.unwrap();
    }
}
