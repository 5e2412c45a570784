//! Runtime factory: host sensing, availability tracking and backend choice.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::containerd::ContainerdRuntime;
use super::docker::DockerRuntime;
use super::host::HostProfile;
use super::lxc::LxcRuntime;
use super::{ContainerRuntime, ImageBackend, RuntimeInfo, RuntimeType};
use crate::config::{DockerSection, LxcSection};
use crate::errors::RuntimeError;

/// Distributions on which containerd is the preferred engine.
const CONTAINERD_DISTROS: [&str; 5] = ["ubuntu", "debian", "rhel", "centos", "fedora"];

/// Pick the preferred backend.
///
/// Rules are evaluated in order and the first one whose choice is available
/// wins:
/// 1. Raspberry Pi: containerd, else Docker, else containerd (degraded)
/// 2. nested container: containerd
/// 3. macOS: Docker, else containerd
/// 4. ARM: containerd
/// 5. ubuntu/debian/rhel/centos/fedora: containerd
/// 6. containerd, then Docker, then LXC
/// 7. Docker as a placeholder when nothing is available
///
/// The result depends only on the arguments; the order of `available` is
/// irrelevant.
pub fn resolve_preferred(profile: &HostProfile, available: &[RuntimeType]) -> RuntimeType {
    let has = |rt: RuntimeType| available.contains(&rt);

    if profile.is_raspberry {
        if has(RuntimeType::Containerd) {
            return RuntimeType::Containerd;
        }
        if has(RuntimeType::Docker) {
            return RuntimeType::Docker;
        }
        return RuntimeType::Containerd;
    }

    if profile.is_container && has(RuntimeType::Containerd) {
        return RuntimeType::Containerd;
    }

    if profile.is_macos() {
        if has(RuntimeType::Docker) {
            return RuntimeType::Docker;
        }
        if has(RuntimeType::Containerd) {
            return RuntimeType::Containerd;
        }
    }

    if profile.is_arm && has(RuntimeType::Containerd) {
        return RuntimeType::Containerd;
    }

    if CONTAINERD_DISTROS.contains(&profile.distribution.as_str()) && has(RuntimeType::Containerd)
    {
        return RuntimeType::Containerd;
    }

    if has(RuntimeType::Containerd) {
        return RuntimeType::Containerd;
    }
    if has(RuntimeType::Docker) {
        return RuntimeType::Docker;
    }
    if has(RuntimeType::Lxc) {
        return RuntimeType::Lxc;
    }

    RuntimeType::Docker
}

/// Source of container runtimes for the deployment pipeline and the API.
///
/// Real implementation: `RuntimeFactory`. Tests provide in-memory doubles.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    async fn available(&self) -> Vec<RuntimeType>;

    async fn preferred(&self) -> RuntimeType;

    async fn profile(&self) -> HostProfile;

    /// Shared adapter for `runtime_type`; fails if the backend is absent.
    async fn runtime(
        &self,
        runtime_type: RuntimeType,
    ) -> Result<Arc<dyn ContainerRuntime>, RuntimeError>;

    async fn image_backend(&self) -> Result<Arc<dyn ImageBackend>, RuntimeError>;

    /// Resolve a caller override, or the preferred backend when none is given.
    async fn select(&self, requested: Option<RuntimeType>) -> Result<RuntimeType, RuntimeError> {
        match requested {
            Some(rt) if self.available().await.contains(&rt) => Ok(rt),
            Some(rt) => Err(RuntimeError::Unavailable(rt)),
            None => Ok(self.preferred().await),
        }
    }

    async fn report(&self) -> FactoryReport {
        FactoryReport {
            system: self.profile().await,
            available: self.available().await,
            preferred: self.preferred().await,
        }
    }
}

/// Adapter construction settings.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSettings {
    pub docker: DockerSection,
    pub lxc: LxcSection,
}

#[derive(Debug, Clone)]
struct FactoryState {
    profile: HostProfile,
    available: Vec<RuntimeType>,
    preferred: RuntimeType,
    /// Set by `set_preferred`; survives refreshes while still available.
    manual: Option<RuntimeType>,
}

/// Snapshot returned by `RuntimeFactory::report`.
#[derive(Debug, Clone, Serialize)]
pub struct FactoryReport {
    pub system: HostProfile,
    pub available: Vec<RuntimeType>,
    pub preferred: RuntimeType,
}

pub struct RuntimeFactory {
    settings: RuntimeSettings,
    state: RwLock<FactoryState>,
    /// Shared adapters, created on first use.
    instances: Mutex<HashMap<RuntimeType, Arc<dyn ContainerRuntime>>>,
    docker: Mutex<Option<Arc<DockerRuntime>>>,
}

impl RuntimeFactory {
    /// Sense the host and check every backend.
    pub async fn detect(settings: RuntimeSettings) -> Self {
        let profile = HostProfile::sense();
        let available = detect_available(&settings).await;
        Self::from_parts(settings, profile, available)
    }

    /// Build a factory from already-sensed inputs.
    pub fn from_parts(
        settings: RuntimeSettings,
        profile: HostProfile,
        mut available: Vec<RuntimeType>,
    ) -> Self {
        available.sort();
        available.dedup();
        let preferred = resolve_preferred(&profile, &available);
        info!(
            os = %profile.os,
            arch = %profile.arch,
            distribution = %profile.distribution,
            ?available,
            %preferred,
            "Runtime factory initialized"
        );
        Self {
            settings,
            state: RwLock::new(FactoryState {
                profile,
                available,
                preferred,
                manual: None,
            }),
            instances: Mutex::new(HashMap::new()),
            docker: Mutex::new(None),
        }
    }

    pub async fn is_available(&self, runtime_type: RuntimeType) -> bool {
        self.state.read().await.available.contains(&runtime_type)
    }

    /// Manually override the preferred backend.
    pub async fn set_preferred(&self, runtime_type: RuntimeType) -> Result<(), RuntimeError> {
        let mut state = self.state.write().await;
        if !state.available.contains(&runtime_type) {
            return Err(RuntimeError::Unavailable(runtime_type));
        }
        info!(from = %state.preferred, to = %runtime_type, "Preferred runtime overridden");
        state.preferred = runtime_type;
        state.manual = Some(runtime_type);
        Ok(())
    }

    /// Re-sense the host and re-check every backend.
    pub async fn refresh(&self) {
        let profile = HostProfile::sense();
        let available = detect_available(&self.settings).await;
        self.apply_refresh(profile, available).await;
    }

    async fn apply_refresh(&self, profile: HostProfile, mut available: Vec<RuntimeType>) {
        available.sort();
        available.dedup();
        let mut state = self.state.write().await;
        let manual = state.manual.filter(|rt| available.contains(rt));
        state.preferred = manual.unwrap_or_else(|| resolve_preferred(&profile, &available));
        state.manual = manual;
        state.profile = profile;

        let dropped: Vec<RuntimeType> = state
            .available
            .iter()
            .filter(|rt| !available.contains(rt))
            .copied()
            .collect();
        state.available = available;
        drop(state);

        if !dropped.is_empty() {
            warn!(?dropped, "Runtimes no longer available");
            let mut instances = self.instances.lock().await;
            for rt in dropped {
                instances.remove(&rt);
                if rt == RuntimeType::Docker {
                    *self.docker.lock().await = None;
                }
            }
        }
    }

    /// Construct a fresh, unshared adapter.
    pub async fn create_runtime(
        &self,
        runtime_type: RuntimeType,
    ) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        if !self.is_available(runtime_type).await {
            return Err(RuntimeError::Unavailable(runtime_type));
        }
        Ok(match runtime_type {
            RuntimeType::Docker => Arc::new(DockerRuntime::connect(&self.settings.docker)?),
            RuntimeType::Containerd => Arc::new(ContainerdRuntime::new()),
            RuntimeType::Lxc => Arc::new(LxcRuntime::new(self.settings.lxc.clone())),
        })
    }

    /// Fresh adapter for the preferred backend.
    pub async fn create_preferred(&self) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        let preferred = self.state.read().await.preferred;
        self.create_runtime(preferred).await
    }

    async fn shared_docker(&self) -> Result<Arc<DockerRuntime>, RuntimeError> {
        if !self.is_available(RuntimeType::Docker).await {
            return Err(RuntimeError::Unavailable(RuntimeType::Docker));
        }
        let mut slot = self.docker.lock().await;
        if let Some(ref docker) = *slot {
            return Ok(docker.clone());
        }
        let docker = Arc::new(DockerRuntime::connect(&self.settings.docker)?);
        *slot = Some(docker.clone());
        Ok(docker)
    }

    /// Aggregated capability report: instantiate each available adapter,
    /// query it, and release it.
    pub async fn runtime_infos(&self) -> Vec<RuntimeInfo> {
        let available = self.state.read().await.available.clone();
        let mut infos = Vec::new();
        for rt in available {
            let runtime = match self.create_runtime(rt).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(runtime = %rt, error = %e, "Failed to instantiate runtime");
                    continue;
                }
            };
            match runtime.runtime_info().await {
                Ok(info) => infos.push(info),
                Err(e) => warn!(runtime = %rt, error = %e, "Failed to query runtime info"),
            }
            if let Err(e) = runtime.close().await {
                debug!(runtime = %rt, error = %e, "Failed to close runtime");
            }
        }
        infos
    }
}

#[async_trait]
impl RuntimeProvider for RuntimeFactory {
    async fn available(&self) -> Vec<RuntimeType> {
        self.state.read().await.available.clone()
    }

    async fn preferred(&self) -> RuntimeType {
        self.state.read().await.preferred
    }

    async fn profile(&self) -> HostProfile {
        self.state.read().await.profile.clone()
    }

    async fn runtime(
        &self,
        runtime_type: RuntimeType,
    ) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        if runtime_type == RuntimeType::Docker {
            let docker: Arc<dyn ContainerRuntime> = self.shared_docker().await?;
            return Ok(docker);
        }
        if !self.is_available(runtime_type).await {
            return Err(RuntimeError::Unavailable(runtime_type));
        }
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(&runtime_type) {
            return Ok(existing.clone());
        }
        let runtime = self.create_runtime(runtime_type).await?;
        instances.insert(runtime_type, runtime.clone());
        Ok(runtime)
    }

    async fn image_backend(&self) -> Result<Arc<dyn ImageBackend>, RuntimeError> {
        let docker: Arc<dyn ImageBackend> = self.shared_docker().await?;
        Ok(docker)
    }
}

/// Check every backend and return the usable ones.
pub async fn detect_available(settings: &RuntimeSettings) -> Vec<RuntimeType> {
    let mut available = Vec::new();
    if DockerRuntime::is_available(&settings.docker).await {
        available.push(RuntimeType::Docker);
    }
    if ContainerdRuntime::is_available() {
        available.push(RuntimeType::Containerd);
    }
    if LxcRuntime::is_available().await {
        available.push(RuntimeType::Lxc);
    }
    available
}

#[cfg(test)]
mod tests {
    use super::*;
    use RuntimeType::{Containerd, Docker, Lxc};

    fn profile() -> HostProfile {
        HostProfile {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            distribution: "arch".to_string(),
            version: String::new(),
            hostname: "test".to_string(),
            is_container: false,
            is_vm: false,
            is_arm: false,
            is_raspberry: false,
        }
    }

    fn all_subsets() -> Vec<Vec<RuntimeType>> {
        (0..8u8)
            .map(|mask| {
                RuntimeType::ALL
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, rt)| *rt)
                    .collect()
            })
            .collect()
    }

    /// Independent restatement of the preference table.
    fn expected(p: &HostProfile, avail: &[RuntimeType]) -> RuntimeType {
        let c = avail.contains(&Containerd);
        let d = avail.contains(&Docker);
        let l = avail.contains(&Lxc);
        if p.is_raspberry {
            return if c { Containerd } else if d { Docker } else { Containerd };
        }
        if p.is_container && c {
            return Containerd;
        }
        if p.is_macos() && d {
            return Docker;
        }
        if c {
            Containerd
        } else if d {
            Docker
        } else if l {
            Lxc
        } else {
            Docker
        }
    }

    #[test]
    fn test_raspberry_without_containerd_prefers_docker() {
        let p = HostProfile {
            is_raspberry: true,
            is_arm: true,
            arch: "aarch64".to_string(),
            ..profile()
        };
        assert_eq!(resolve_preferred(&p, &[Docker]), Docker);
        assert_eq!(resolve_preferred(&p, &[Docker, Lxc]), Docker);
        assert_eq!(resolve_preferred(&p, &[Docker, Containerd]), Containerd);
        assert_eq!(resolve_preferred(&p, &[Lxc]), Containerd);
    }

    #[test]
    fn test_nothing_available_is_docker_placeholder() {
        assert_eq!(resolve_preferred(&profile(), &[]), Docker);
        let mac = HostProfile {
            os: "macos".to_string(),
            ..profile()
        };
        assert_eq!(resolve_preferred(&mac, &[]), Docker);
    }

    #[test]
    fn test_macos_prefers_docker() {
        let mac = HostProfile {
            os: "macos".to_string(),
            is_arm: true,
            ..profile()
        };
        assert_eq!(resolve_preferred(&mac, &[Docker, Containerd]), Docker);
        assert_eq!(resolve_preferred(&mac, &[Containerd]), Containerd);
    }

    #[test]
    fn test_nested_container_prefers_containerd_when_available() {
        let nested = HostProfile {
            is_container: true,
            ..profile()
        };
        assert_eq!(resolve_preferred(&nested, &[Docker, Containerd]), Containerd);
        assert_eq!(resolve_preferred(&nested, &[Docker]), Docker);
    }

    #[test]
    fn test_lxc_only_host_prefers_lxc() {
        assert_eq!(resolve_preferred(&profile(), &[Lxc]), Lxc);
        assert_eq!(resolve_preferred(&profile(), &[Docker, Lxc]), Docker);
        assert_eq!(resolve_preferred(&profile(), &[Containerd, Lxc]), Containerd);
        let mac = HostProfile {
            os: "macos".to_string(),
            ..profile()
        };
        assert_eq!(resolve_preferred(&mac, &[Lxc]), Lxc);
    }

    #[test]
    fn test_resolution_is_pure_over_all_inputs() {
        let oses = ["linux", "macos"];
        let arches = ["x86_64", "aarch64"];
        let distros = ["ubuntu", "fedora", "arch", "unknown"];
        for os in oses {
            for arch in arches {
                for distro in distros {
                    for nested in [false, true] {
                        for pi in [false, true] {
                            let p = HostProfile {
                                os: os.to_string(),
                                arch: arch.to_string(),
                                distribution: distro.to_string(),
                                is_container: nested,
                                is_raspberry: pi,
                                is_arm: crate::runtime::host::is_arm_arch(arch),
                                ..profile()
                            };
                            for avail in all_subsets() {
                                let first = resolve_preferred(&p, &avail);
                                let mut reversed = avail.clone();
                                reversed.reverse();
                                assert_eq!(first, resolve_preferred(&p, &avail));
                                assert_eq!(first, resolve_preferred(&p, &reversed));
                                assert_eq!(first, expected(&p, &avail), "{:?} {:?}", p, avail);
                            }
                        }
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_set_preferred_validates_availability() {
        let factory =
            RuntimeFactory::from_parts(RuntimeSettings::default(), profile(), vec![Docker, Lxc]);
        assert_eq!(factory.preferred().await, Docker);

        let err = factory.set_preferred(Containerd).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(Containerd)));

        factory.set_preferred(Lxc).await.unwrap();
        assert_eq!(factory.preferred().await, Lxc);
    }

    #[tokio::test]
    async fn test_select_override() {
        let factory = RuntimeFactory::from_parts(RuntimeSettings::default(), profile(), vec![Lxc]);
        assert_eq!(factory.select(Some(Lxc)).await.unwrap(), Lxc);
        assert!(matches!(
            factory.select(Some(Docker)).await,
            Err(RuntimeError::Unavailable(Docker))
        ));
        assert_eq!(factory.select(None).await.unwrap(), Lxc);
    }

    #[tokio::test]
    async fn test_unavailable_runtime_is_rejected_explicitly() {
        let factory = RuntimeFactory::from_parts(RuntimeSettings::default(), profile(), vec![]);
        assert!(matches!(
            factory.runtime(Docker).await,
            Err(RuntimeError::Unavailable(Docker))
        ));
        assert!(matches!(
            factory.image_backend().await,
            Err(RuntimeError::Unavailable(Docker))
        ));
        assert!(factory.runtime_infos().await.is_empty());
    }

    #[tokio::test]
    async fn test_shared_lxc_instance_is_reused() {
        let factory = RuntimeFactory::from_parts(RuntimeSettings::default(), profile(), vec![Lxc]);
        let a = factory.runtime(Lxc).await.unwrap();
        let b = factory.runtime(Lxc).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let fresh = factory.create_runtime(Lxc).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &fresh));
    }

    #[tokio::test]
    async fn test_create_preferred() {
        let empty = RuntimeFactory::from_parts(RuntimeSettings::default(), profile(), vec![]);
        assert!(matches!(
            empty.create_preferred().await,
            Err(RuntimeError::Unavailable(Docker))
        ));

        let factory = RuntimeFactory::from_parts(RuntimeSettings::default(), profile(), vec![Lxc]);
        assert_eq!(factory.preferred().await, Lxc);
        let runtime = factory.create_preferred().await.unwrap();
        assert_eq!(runtime.runtime_type(), Lxc);
    }

    #[tokio::test]
    async fn test_refresh_keeps_manual_choice_while_available() {
        let factory =
            RuntimeFactory::from_parts(RuntimeSettings::default(), profile(), vec![Docker, Lxc]);
        factory.set_preferred(Lxc).await.unwrap();

        factory.apply_refresh(profile(), vec![Lxc, Docker]).await;
        assert_eq!(factory.preferred().await, Lxc);

        factory.apply_refresh(profile(), vec![Docker]).await;
        assert_eq!(factory.preferred().await, Docker);
        assert!(!factory.is_available(Lxc).await);
    }

    #[tokio::test]
    async fn test_report() {
        let factory = RuntimeFactory::from_parts(
            RuntimeSettings::default(),
            profile(),
            vec![Lxc, Docker, Lxc],
        );
        let report = factory.report().await;
        assert_eq!(report.available, vec![Docker, Lxc]);
        assert_eq!(report.preferred, Docker);
        assert_eq!(report.system.os, "linux");
    }
}
