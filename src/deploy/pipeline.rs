//! Deployment state machine and stage runner.
//!
//! One attempt runs detection, template rendering, the image pipeline and
//! container start strictly in order. Any stage failure ends the attempt:
//! the message goes onto the application, status becomes `error`, and an
//! `error` message is published. Nothing is retried.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::detect::{
    FALLBACK_LANGUAGE, GitSource, SourceInfo, SourceInspector, authenticated_url, redact,
};
use super::images::{
    app_tag_prefix, consume_build_stream, derive_tag, fallback_hash, housekeeping, resolve_image,
};
use super::locks::PipelineLocks;
use crate::config::ImagesSection;
use crate::errors::DeployError;
use crate::events::{LogHub, LogKind, StreamMessage};
use crate::runtime::{
    ContainerRuntime, CreateContainerRequest, EventStream, ImageBackend, PortMapping,
    RuntimeProvider, RuntimeType, redact_credentials,
};
use crate::secrets::SecretCipher;
use crate::store::{AppStatus, Application, DbHandle};
use crate::templates::{
    GIT_TOKEN_VAR, RenderParams, Rendered, SourceAccess, Templates, normalize_language,
};

const RESTART_POLICY: &str = "unless-stopped";

/// Returns true if moving an application from `from` to `to` is allowed.
pub fn is_valid_transition(from: AppStatus, to: AppStatus) -> bool {
    use AppStatus::*;
    matches!(
        (from, to),
        (Idle, Deploying)
            | (Deploying, Running)
            | (Deploying, Error)
            | (Running, Redeploying)
            | (Error, Redeploying)
            | (Redeploying, Running)
            | (Redeploying, Error)
    )
}

/// Inputs of one deployment attempt that are not stored on the record.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub app_id: String,
    /// Backend override; otherwise the record's backend, then the preferred one
    pub runtime_type: Option<RuntimeType>,
    /// Skips detection when set
    pub language: Option<String>,
    /// Used for the clone only, never stored
    pub github_token: Option<String>,
}

pub struct Deployer {
    db: DbHandle,
    runtimes: Arc<dyn RuntimeProvider>,
    templates: Arc<Templates>,
    hub: Arc<LogHub>,
    cipher: Arc<dyn SecretCipher>,
    source: Arc<dyn SourceInspector>,
    locks: PipelineLocks,
    images: ImagesSection,
}

impl Deployer {
    pub fn new(
        db: DbHandle,
        runtimes: Arc<dyn RuntimeProvider>,
        templates: Arc<Templates>,
        hub: Arc<LogHub>,
        cipher: Arc<dyn SecretCipher>,
        images: ImagesSection,
    ) -> Self {
        Self {
            db,
            runtimes,
            templates,
            hub,
            cipher,
            source: Arc::new(GitSource),
            locks: PipelineLocks::new(),
            images,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SourceInspector>) -> Self {
        self.source = source;
        self
    }

    /// Whether an attempt currently holds the lock for `app_id`.
    pub fn is_active(&self, app_id: &str) -> bool {
        self.locks.is_locked(app_id)
    }

    /// Run an attempt as a detached task. The outcome lands on the record.
    pub fn spawn(self: &Arc<Self>, request: DeployRequest) -> JoinHandle<()> {
        let deployer = Arc::clone(self);
        tokio::spawn(async move {
            let app_id = request.app_id.clone();
            match deployer.run(request).await {
                Ok(app) => info!(app_id = %app_id, container = ?app.container_id, "Deployment finished"),
                Err(e) => warn!(app_id = %app_id, kind = e.kind(), error = %e, "Deployment attempt ended with an error"),
            }
        })
    }

    /// Run one attempt to completion. Waits for any attempt already running
    /// for the same application.
    pub async fn run(&self, request: DeployRequest) -> Result<Application, DeployError> {
        let _guard = self.locks.acquire(&request.app_id).await;
        let mut app = self.load_app(&request.app_id).await?;

        let target = match app.status {
            AppStatus::Idle => AppStatus::Deploying,
            AppStatus::Running | AppStatus::Error => AppStatus::Redeploying,
            from => {
                return Err(DeployError::InvalidTransition {
                    from,
                    to: AppStatus::Deploying,
                });
            }
        };
        self.transition(&mut app, target).await?;

        let redeploy = target == AppStatus::Redeploying;
        self.log(
            &app.id,
            LogKind::Info,
            if redeploy {
                format!("Redeploying {}", app.name)
            } else {
                format!("Deploying {}", app.name)
            },
        );

        match self.execute(&mut app, &request, redeploy).await {
            Ok(()) => Ok(app),
            Err(e) => {
                self.fail(&mut app, &e).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        app: &mut Application,
        request: &DeployRequest,
        redeploy: bool,
    ) -> Result<(), DeployError> {
        let runtime_type = self.choose_runtime(app, request.runtime_type).await?;
        let runtime = self.runtimes.runtime(runtime_type).await?;

        if redeploy {
            self.retire_container(app).await;
            app.container_id = None;
        }
        app.runtime_type = runtime_type;

        // ── Detection ──
        // The token only ever reaches host-side clones and the LXC exec env.
        let clone_url = authenticated_url(&app.repo_url, request.github_token.as_deref());
        let access = match (clone_url != app.repo_url, runtime_type.uses_images()) {
            (false, _) => SourceAccess::Public,
            (true, true) => SourceAccess::Context,
            (true, false) => SourceAccess::Token,
        };
        let known_language = request
            .language
            .as_deref()
            .map(normalize_language)
            .filter(|l| !l.is_empty())
            .or_else(|| (!app.language.is_empty()).then(|| app.language.clone()));
        let detect = known_language.is_none();

        let source = if detect || runtime_type.uses_images() {
            self.log(&app.id, LogKind::Info, "Inspecting repository");
            self.source.inspect(&clone_url, detect).await?
        } else {
            SourceInfo::default()
        };
        app.language = known_language
            .or(source.language)
            .unwrap_or_else(|| FALLBACK_LANGUAGE.to_string());
        self.save(app).await?;
        self.log(
            &app.id,
            LogKind::Info,
            format!("Language: {}", app.language),
        );

        // ── Render ──
        let rendered = self.templates.for_runtime(runtime_type).render(
            &app.language,
            &RenderParams {
                app_name: app.name.clone(),
                app_id: app.id.clone(),
                port: app.port,
                repo_url: app.repo_url.clone(),
                source: access,
                environment: HashMap::from([("PORT".to_string(), app.port.to_string())]),
                labels: HashMap::new(),
            },
        );
        self.log(
            &app.id,
            LogKind::Info,
            format!("Rendered {} template from {}", rendered.language, rendered.base_image),
        );

        // ── Image ──
        let built = if runtime_type.uses_images() {
            let commit = source.commit.unwrap_or_else(|| {
                self.log(
                    &app.id,
                    LogKind::Info,
                    "Commit hash unavailable, using a fallback tag",
                );
                fallback_hash()
            });
            let tag = derive_tag(&self.images.tag_prefix, &app.id, &commit);
            let backend = self.runtimes.image_backend().await?;
            let checkout = match access {
                SourceAccess::Context => {
                    self.log(&app.id, LogKind::Info, "Fetching source for the build context");
                    Some(self.source.checkout(&clone_url).await?)
                }
                _ => None,
            };
            let image_id = self
                .build_image(
                    app,
                    backend.as_ref(),
                    &rendered,
                    &tag,
                    checkout.as_ref().map(|dir| dir.path()),
                    &clone_url,
                )
                .await?;
            Some((tag, image_id, backend))
        } else {
            None
        };

        // ── Container ──
        let environment = self.container_environment(app, &rendered).await?;
        let name = container_name(
            built
                .as_ref()
                .map(|(tag, _, _)| tag.clone())
                .unwrap_or_else(|| {
                    app_tag_prefix(&self.images.tag_prefix, &app.id)
                        .trim_end_matches('-')
                        .to_string()
                }),
        );
        let image = match &built {
            Some((_, image_id, _)) => image_id.clone(),
            None => rendered.base_image.clone(),
        };
        let create = CreateContainerRequest {
            name: name.clone(),
            image: image.clone(),
            environment,
            labels: rendered.labels.clone(),
            ports: vec![PortMapping::tcp(app.port, app.port)],
            restart_policy: Some(RESTART_POLICY.to_string()),
            ..Default::default()
        };

        let mut events = runtime.subscribe();
        let mut scope = HashSet::from([name.clone()]);

        self.log(
            &app.id,
            LogKind::Info,
            format!("Creating container {} on {}", name, runtime_type),
        );
        let container = match runtime.create_container(&create).await {
            Ok(container) => container,
            Err(e) => {
                self.relay_events(&app.id, &mut events, &scope);
                return Err(e.into());
            }
        };
        scope.insert(container.id.clone());
        let mut exec_env = HashMap::new();
        if let (SourceAccess::Token, Some(token)) = (access, request.github_token.as_deref()) {
            exec_env.insert(GIT_TOKEN_VAR.to_string(), token.trim().to_string());
        }
        let booted = self
            .boot(app, runtime.as_ref(), &container.id, &rendered, &exec_env, &clone_url)
            .await;
        if booted.is_err() {
            discard_container(runtime.as_ref(), &container.id).await;
        }
        self.relay_events(&app.id, &mut events, &scope);
        booted?;

        // ── Finalize ──
        app.container_id = Some(container.id.clone());
        app.image_id = Some(image);
        app.error_message = None;
        self.transition(app, AppStatus::Running).await?;
        self.log(
            &app.id,
            LogKind::Success,
            format!("Application running on port {}", app.port),
        );

        if let Some((_, _, backend)) = built {
            let prefix = app_tag_prefix(&self.images.tag_prefix, &app.id);
            let keep = self.images.keep;
            tokio::spawn(async move {
                housekeeping(backend.as_ref(), &prefix, keep).await;
            });
        }
        Ok(())
    }

    async fn choose_runtime(
        &self,
        app: &Application,
        requested: Option<RuntimeType>,
    ) -> Result<RuntimeType, DeployError> {
        if requested.is_some() {
            return Ok(self.runtimes.select(requested).await?);
        }
        if self.runtimes.available().await.contains(&app.runtime_type) {
            return Ok(app.runtime_type);
        }
        Ok(self.runtimes.preferred().await)
    }

    async fn build_image(
        &self,
        app: &Application,
        backend: &dyn ImageBackend,
        rendered: &Rendered,
        tag: &str,
        source: Option<&Path>,
        clone_url: &str,
    ) -> Result<String, DeployError> {
        self.log(&app.id, LogKind::Info, format!("Building image {}", tag));
        let stream = backend.build_image(&rendered.body, tag, source).await?;
        let built_id = consume_build_stream(stream, |line| {
            self.hub.log(&app.id, LogKind::BuildLog, scrub(line, clone_url));
        })
        .await?;

        let image_id = resolve_image(
            backend,
            tag,
            built_id.as_deref(),
            self.images.resolve_attempts,
            self.images.resolve_delay(),
        )
        .await?;
        self.log(
            &app.id,
            LogKind::Success,
            format!("Image {} built ({})", tag, short_id(&image_id)),
        );
        Ok(image_id)
    }

    /// Start the container, then run the setup script on backends without
    /// images.
    async fn boot(
        &self,
        app: &Application,
        runtime: &dyn ContainerRuntime,
        container_id: &str,
        rendered: &Rendered,
        exec_env: &HashMap<String, String>,
        clone_url: &str,
    ) -> Result<(), DeployError> {
        runtime.start_container(container_id).await?;
        if runtime.runtime_type().uses_images() {
            return Ok(());
        }

        self.log(&app.id, LogKind::Info, "Running setup script");
        let argv = vec!["sh".to_string(), "-c".to_string(), rendered.body.clone()];
        let result = runtime
            .execute_command(container_id, &argv, exec_env)
            .await?;
        for line in result.output.lines().filter(|l| !l.trim().is_empty()) {
            self.hub.log(&app.id, LogKind::BuildLog, scrub(line, clone_url));
        }
        if !result.success() {
            let detail = scrub(&tail(&result.error, 5), clone_url);
            return Err(DeployError::Build(format!(
                "Setup script exited with code {}{}",
                result.exit_code,
                if detail.is_empty() {
                    String::new()
                } else {
                    format!(": {}", detail)
                }
            )));
        }
        Ok(())
    }

    /// Template defaults, stored variables (secrets decrypted) and the
    /// platform variables, in increasing precedence.
    async fn container_environment(
        &self,
        app: &Application,
        rendered: &Rendered,
    ) -> Result<HashMap<String, String>, DeployError> {
        let app_id = app.id.clone();
        let vars = self
            .db
            .call(move |db| db.list_env_vars(&app_id))
            .await
            .map_err(DeployError::Storage)?;

        let mut environment = rendered.environment.clone();
        for var in vars {
            let value = if var.is_secret {
                self.cipher
                    .decrypt(&var.value)
                    .with_context(|| format!("Failed to decrypt secret {}", var.key))?
            } else {
                var.value
            };
            environment.insert(var.key, value);
        }
        environment.insert("PORT".to_string(), app.port.to_string());
        environment.insert("DIPLO_APP_ID".to_string(), app.id.clone());
        environment.insert("DIPLO_APP_NAME".to_string(), app.name.clone());
        Ok(environment)
    }

    /// Publish the pending backend events that concern this attempt's
    /// container. Other applications' events on the same backend are skipped.
    fn relay_events(&self, app_id: &str, events: &mut EventStream, scope: &HashSet<String>) {
        loop {
            match events.try_recv() {
                Ok(mut event) => {
                    let ours = scope.contains(&event.container_id)
                        || event.metadata.get("name").is_some_and(|n| scope.contains(n));
                    if ours {
                        event.message = redact_credentials(&event.message);
                        self.hub.publish(app_id, &StreamMessage::Backend(event));
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(app_id = %app_id, skipped, "Backend events lagged")
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    /// Stop and remove the application's current container, best-effort.
    async fn retire_container(&self, app: &Application) {
        let Some(container_id) = app.container_id.as_deref() else {
            return;
        };
        match self.runtimes.runtime(app.runtime_type).await {
            Ok(runtime) => {
                self.log(
                    &app.id,
                    LogKind::Info,
                    format!("Removing previous container {}", short_id(container_id)),
                );
                discard_container(runtime.as_ref(), container_id).await;
            }
            Err(e) => warn!(
                app_id = %app.id,
                container = %container_id,
                error = %e,
                "Cannot reach backend of previous container"
            ),
        }
    }

    async fn load_app(&self, app_id: &str) -> Result<Application, DeployError> {
        let id = app_id.to_string();
        self.db
            .call(move |db| db.get_app(&id))
            .await
            .map_err(DeployError::Storage)?
            .ok_or_else(|| DeployError::AppNotFound {
                id: app_id.to_string(),
            })
    }

    async fn save(&self, app: &mut Application) -> Result<(), DeployError> {
        let snapshot = app.clone();
        *app = self
            .db
            .call(move |db| db.update_app(&snapshot))
            .await
            .map_err(DeployError::Storage)?;
        Ok(())
    }

    async fn transition(&self, app: &mut Application, to: AppStatus) -> Result<(), DeployError> {
        let from = app.status;
        if !is_valid_transition(from, to) {
            return Err(DeployError::InvalidTransition { from, to });
        }
        app.status = to;
        self.save(app).await?;
        info!(app_id = %app.id, from = %from, to = %to, "Application status changed");
        Ok(())
    }

    async fn fail(&self, app: &mut Application, err: &DeployError) {
        let message = redact_credentials(&err.to_string());
        error!(app_id = %app.id, kind = err.kind(), error = %message, "Deployment failed");

        if is_valid_transition(app.status, AppStatus::Error) {
            app.status = AppStatus::Error;
        }
        app.error_message = Some(message.clone());
        if let Err(e) = self.save(app).await {
            error!(app_id = %app.id, error = %e, "Failed to record deployment failure");
        }
        self.log(
            &app.id,
            LogKind::Error,
            format!("Deployment failed: {}", message),
        );
    }

    fn log(&self, app_id: &str, kind: LogKind, message: impl Into<String>) {
        let message = message.into();
        debug!(app_id = %app_id, kind = kind.as_str(), "{}", message);
        self.hub.log(app_id, kind, message);
    }

    // ── Outside the pipeline ──────────────────────────────────────────

    /// Move records left mid-attempt by a previous process to `error`.
    pub async fn recover_interrupted(&self) -> Result<usize, DeployError> {
        let count = self
            .db
            .call(|db| db.recover_interrupted())
            .await
            .map_err(DeployError::Storage)?;
        if count > 0 {
            warn!(count, "Marked interrupted deployments as failed");
        }
        Ok(count)
    }

    /// Remove an application: its container and images best-effort, then
    /// its variables and record. Waits for a running attempt to finish.
    pub async fn delete_app(&self, app_id: &str) -> Result<bool, DeployError> {
        let guard = self.locks.acquire(app_id).await;
        let app = match self.load_app(app_id).await {
            Ok(app) => app,
            Err(DeployError::AppNotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        self.retire_container(&app).await;
        if app.runtime_type.uses_images() {
            self.remove_app_images(&app).await;
        }

        let id = app_id.to_string();
        let deleted = self
            .db
            .call(move |db| {
                db.delete_all_env_vars(&id)?;
                db.delete_app(&id)
            })
            .await
            .map_err(DeployError::Storage)?;
        drop(guard);
        self.locks.forget(app_id);
        info!(app_id = %app_id, "Application deleted");
        Ok(deleted)
    }

    async fn remove_app_images(&self, app: &Application) {
        let backend = match self.runtimes.image_backend().await {
            Ok(backend) => backend,
            Err(e) => {
                debug!(app_id = %app.id, error = %e, "No image backend, skipping image cleanup");
                return;
            }
        };
        let prefix = app_tag_prefix(&self.images.tag_prefix, &app.id);
        match backend.list_images(&prefix).await {
            Ok(images) => {
                for image in images {
                    if let Err(e) = backend.remove_image(&image.id).await {
                        warn!(app_id = %app.id, image = %image.id, error = %e, "Failed to remove image");
                    }
                }
            }
            Err(e) => warn!(app_id = %app.id, error = %e, "Failed to list application images"),
        }
    }
}

/// Stop then remove, logging failures only.
async fn discard_container(runtime: &dyn ContainerRuntime, container_id: &str) {
    if let Err(e) = runtime.stop_container(container_id).await {
        debug!(container = %container_id, error = %e, "Stop before removal failed");
    }
    if let Err(e) = runtime.remove_container(container_id).await {
        warn!(container = %container_id, error = %e, "Failed to remove container");
    }
}

/// Mask the clone credentials and any other URL userinfo in `text`.
fn scrub(text: &str, clone_url: &str) -> String {
    redact_credentials(&redact(text, clone_url))
}

fn container_name(base: String) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}

fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join(" | ")
}
