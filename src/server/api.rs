use std::sync::{Arc, LazyLock};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::sse;
use crate::deploy::naming::{allocate_port, default_app_name, generate_app_id};
use crate::deploy::{DeployRequest, Deployer};
use crate::errors::{DeployError, RuntimeError};
use crate::events::LogHub;
use crate::runtime::{RuntimeProvider, RuntimeType};
use crate::secrets::SecretCipher;
use crate::store::env::{MAX_ENV_VARS, looks_secret, validate_pair, validate_value};
use crate::store::{Application, DbHandle, EnvVar};
use crate::templates::{GENERIC, Templates, normalize_language};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub runtimes: Arc<dyn RuntimeProvider>,
    pub deployer: Arc<Deployer>,
    pub templates: Arc<Templates>,
    pub hub: Arc<LogHub>,
    pub cipher: Arc<dyn SecretCipher>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DeployBody {
    pub repo_url: String,
    pub name: Option<String>,
    pub runtime_type: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub env_vars: Vec<EnvVarInput>,
    pub github_token: Option<String>,
}

#[derive(Deserialize)]
pub struct EnvVarInput {
    pub key: String,
    pub value: String,
    pub is_secret: Option<bool>,
}

#[derive(Deserialize)]
pub struct UpdateEnvVarBody {
    pub value: String,
    pub is_secret: Option<bool>,
}

#[derive(Deserialize)]
pub struct TemplateQuery {
    pub runtime: Option<String>,
}

#[derive(Serialize)]
pub struct DeployResponse {
    pub id: String,
    pub name: String,
    pub repo_url: String,
    pub port: u16,
    pub url: String,
    pub status: String,
    pub runtime_type: RuntimeType,
    pub message: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Unavailable(_) => ApiError::BadRequest(e.to_string()),
            RuntimeError::Backend { .. } => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::AppNotFound { .. } => ApiError::NotFound(e.to_string()),
            DeployError::Validation(msg) => ApiError::BadRequest(msg),
            DeployError::Runtime(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(system_status))
        .route("/api/deploy", post(deploy))
        .route("/api/apps", get(list_apps))
        .route("/api/apps/{id}", get(get_app).delete(delete_app))
        .route("/api/apps/{id}/env", get(list_env_vars).post(create_env_var))
        .route(
            "/api/apps/{id}/env/{key}",
            put(update_env_var).delete(delete_env_var),
        )
        .route("/api/apps/{id}/logs", get(sse::stream_logs))
        .route("/api/maintenance/prune-images", post(prune_images))
        .route("/api/lxc/status", get(lxc_status))
        .route("/api/docker/status", get(docker_status))
        .route("/api/templates", get(list_templates))
        .route("/api/templates/{language}", get(get_template))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn validate_repo_url(url: &str) -> Result<(), ApiError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ApiError::BadRequest("repo_url is required".to_string()));
    }
    let supported = ["https://", "http://", "git@", "ssh://", "file://"];
    let unsafe_char = |c: char| c.is_whitespace() || SHELL_META.contains(c);
    if !supported.iter().any(|p| url.starts_with(p)) || url.contains(unsafe_char) {
        return Err(ApiError::BadRequest(format!(
            "Unsupported repository URL: {}",
            url
        )));
    }
    Ok(())
}

const SHELL_META: &str = ";|&$`\"'\\<>(){}";

static APP_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,63}$").unwrap());

fn validate_app_name(name: &str) -> Result<(), ApiError> {
    if !APP_NAME_RE.is_match(name) {
        return Err(ApiError::BadRequest(format!(
            "Invalid application name {:?}: use 1-63 letters, digits, '.', '_' or '-'",
            name
        )));
    }
    Ok(())
}

fn parse_runtime(raw: Option<&str>) -> Result<Option<RuntimeType>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s.parse().map(Some).map_err(ApiError::BadRequest),
        None => Ok(None),
    }
}

pub(super) async fn load_app(state: &SharedState, id: &str) -> Result<Application, ApiError> {
    let app_id = id.to_string();
    state
        .db
        .call(move |db| db.get_app(&app_id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Application {} not found", id)))
}

/// Value as stored: ciphertext for secrets.
fn stored_value(state: &SharedState, value: &str, is_secret: bool) -> Result<String, ApiError> {
    if is_secret {
        state
            .cipher
            .encrypt(value)
            .map_err(|e| ApiError::Internal(e.to_string()))
    } else {
        Ok(value.to_string())
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn system_status(State(state): State<SharedState>) -> impl IntoResponse {
    let report = state.runtimes.report().await;
    Json(json!({
        "system": report.system,
        "available": report.available,
        "preferred": report.preferred,
        "supported_languages": state.templates.docker.languages(),
        "supported_images": state.templates.docker.images(),
    }))
}

enum Registration {
    Ready(Application, bool),
    TooManyVars(usize),
    NoPort,
}

async fn deploy(
    State(state): State<SharedState>,
    Json(req): Json<DeployBody>,
) -> Result<impl IntoResponse, ApiError> {
    validate_repo_url(&req.repo_url)?;
    let repo_url = req.repo_url.trim().to_string();
    let name = match req.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => {
            validate_app_name(name)?;
            name.to_string()
        }
        None => default_app_name(&repo_url),
    };
    let requested = parse_runtime(req.runtime_type.as_deref())?;
    let runtime_type = state.runtimes.select(requested).await?;

    let language = match req.language.as_deref().map(normalize_language) {
        Some(lang) if lang.is_empty() => None,
        Some(lang) if lang != GENERIC && state.templates.docker.find(&lang).is_none() => {
            return Err(ApiError::BadRequest(format!("Unsupported language: {}", lang)));
        }
        other => other,
    };

    if req.env_vars.len() > MAX_ENV_VARS {
        return Err(ApiError::BadRequest(format!(
            "At most {} environment variables per application",
            MAX_ENV_VARS
        )));
    }
    let mut env_vars = Vec::with_capacity(req.env_vars.len());
    for var in &req.env_vars {
        validate_pair(&var.key, &var.value).map_err(ApiError::BadRequest)?;
        let is_secret = var.is_secret.unwrap_or_else(|| looks_secret(&var.key));
        let value = stored_value(&state, &var.value, is_secret)?;
        env_vars.push((var.key.clone(), value, is_secret));
    }

    let candidate = Application::new(
        &generate_app_id(),
        &name,
        &repo_url,
        language.as_deref().unwrap_or(""),
        0,
        runtime_type,
    );

    let registration = state
        .db
        .call(move |db| {
            let (app, created) = match db.get_app_by_repo_url(&candidate.repo_url)? {
                Some(existing) => (existing, false),
                None => {
                    let Some(port) = allocate_port(&db.ports_in_use()?) else {
                        return Ok(Registration::NoPort);
                    };
                    let mut fresh = candidate;
                    fresh.port = port;
                    db.find_or_create_app(&fresh)?
                }
            };
            let existing_keys = db.list_env_vars(&app.id)?;
            let added = env_vars
                .iter()
                .filter(|(key, _, _)| !existing_keys.iter().any(|v| &v.key == key))
                .count();
            if existing_keys.len() + added > MAX_ENV_VARS {
                return Ok(Registration::TooManyVars(existing_keys.len()));
            }
            for (key, value, is_secret) in &env_vars {
                db.upsert_env_var(&app.id, key, value, *is_secret)?;
            }
            Ok(Registration::Ready(app, created))
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let (app, created) = match registration {
        Registration::Ready(app, created) => (app, created),
        Registration::TooManyVars(existing) => {
            return Err(ApiError::BadRequest(format!(
                "Application already has {} environment variables; at most {} allowed",
                existing, MAX_ENV_VARS
            )));
        }
        Registration::NoPort => {
            return Err(ApiError::Internal("No free port available".to_string()));
        }
    };

    state.deployer.spawn(DeployRequest {
        app_id: app.id.clone(),
        runtime_type: requested,
        language,
        github_token: req.github_token,
    });

    let (status_code, status, message) = if created {
        info!(app_id = %app.id, repo_url = %app.repo_url, "Deployment queued");
        (StatusCode::CREATED, "deploying", "Deployment started")
    } else if app.status.is_in_progress() {
        info!(app_id = %app.id, status = %app.status, "Redeployment queued behind running attempt");
        (
            StatusCode::OK,
            "redeploying",
            "Redeployment queued after the current deployment",
        )
    } else {
        info!(app_id = %app.id, repo_url = %app.repo_url, "Redeployment queued");
        (StatusCode::OK, "redeploying", "Redeployment started")
    };
    Ok((
        status_code,
        Json(DeployResponse {
            url: format!("http://localhost:{}", app.port),
            id: app.id,
            name: app.name,
            repo_url: app.repo_url,
            port: app.port,
            status: status.to_string(),
            runtime_type: requested.unwrap_or(app.runtime_type),
            message: message.to_string(),
        }),
    ))
}

async fn list_apps(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let apps = state
        .db
        .call(|db| db.list_apps())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(apps))
}

async fn get_app(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(load_app(&state, &id).await?))
}

async fn delete_app(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.deployer.delete_app(&id).await? {
        return Err(ApiError::NotFound(format!("Application {} not found", id)));
    }
    Ok(Json(json!({"message": format!("Application {} deleted", id)})))
}

async fn list_env_vars(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    load_app(&state, &id).await?;
    let vars = state
        .db
        .call(move |db| db.list_env_vars(&id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(vars.into_iter().map(EnvVar::masked).collect::<Vec<_>>()))
}

async fn create_env_var(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<EnvVarInput>,
) -> Result<impl IntoResponse, ApiError> {
    load_app(&state, &id).await?;
    validate_pair(&req.key, &req.value).map_err(ApiError::BadRequest)?;
    let is_secret = req.is_secret.unwrap_or(false);
    let value = stored_value(&state, &req.value, is_secret)?;

    let key = req.key.clone();
    let outcome = state
        .db
        .call(move |db| {
            if db.count_env_vars(&id)? >= MAX_ENV_VARS {
                return Ok(Err(()));
            }
            Ok(Ok(db.create_env_var(&id, &key, &value, is_secret)?))
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    match outcome {
        Err(()) => Err(ApiError::BadRequest(format!(
            "At most {} environment variables per application",
            MAX_ENV_VARS
        ))),
        Ok(None) => Err(ApiError::Conflict(format!(
            "Environment variable {} already exists",
            req.key
        ))),
        Ok(Some(var)) => Ok((StatusCode::CREATED, Json(var.masked()))),
    }
}

async fn update_env_var(
    State(state): State<SharedState>,
    Path((id, key)): Path<(String, String)>,
    Json(req): Json<UpdateEnvVarBody>,
) -> Result<impl IntoResponse, ApiError> {
    load_app(&state, &id).await?;
    validate_value(&req.value).map_err(ApiError::BadRequest)?;

    let (app_id, lookup) = (id.clone(), key.clone());
    let existing = state
        .db
        .call(move |db| db.get_env_var(&app_id, &lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Environment variable {} not found", key)))?;

    let is_secret = req.is_secret.unwrap_or(existing.is_secret);
    let value = stored_value(&state, &req.value, is_secret)?;
    let updated = state
        .db
        .call(move |db| db.update_env_var(&id, &key, &value, is_secret))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound("Environment variable not found".to_string()))?;
    Ok(Json(updated.masked()))
}

async fn delete_env_var(
    State(state): State<SharedState>,
    Path((id, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    load_app(&state, &id).await?;
    let lookup = key.clone();
    let deleted = state
        .db
        .call(move |db| db.delete_env_var(&id, &lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !deleted {
        return Err(ApiError::NotFound(format!(
            "Environment variable {} not found",
            key
        )));
    }
    Ok(Json(json!({"message": format!("Environment variable {} deleted", key)})))
}

async fn prune_images(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let backend = state.runtimes.image_backend().await?;
    let report = backend.prune_dangling_images().await?;
    info!(removed = report.removed.len(), "Pruned dangling images");
    Ok(Json(json!({
        "removed": report.removed,
        "space_reclaimed": report.space_reclaimed,
    })))
}

async fn runtime_status(state: &SharedState, runtime_type: RuntimeType) -> Result<Response, ApiError> {
    if !state.runtimes.available().await.contains(&runtime_type) {
        return Ok(Json(json!({
            "runtime": runtime_type,
            "available": false,
        }))
        .into_response());
    }
    let runtime = state.runtimes.runtime(runtime_type).await?;
    let info = runtime.runtime_info().await?;
    let containers = runtime.list_containers().await?;
    Ok(Json(json!({
        "runtime": runtime_type,
        "available": true,
        "info": info,
        "containers": containers,
    }))
    .into_response())
}

async fn lxc_status(State(state): State<SharedState>) -> Result<Response, ApiError> {
    runtime_status(&state, RuntimeType::Lxc).await
}

async fn docker_status(State(state): State<SharedState>) -> Result<Response, ApiError> {
    runtime_status(&state, RuntimeType::Docker).await
}

fn registry_for<'a>(
    templates: &'a Templates,
    query: &TemplateQuery,
) -> Result<&'a crate::templates::TemplateRegistry, ApiError> {
    let runtime = parse_runtime(query.runtime.as_deref())?.unwrap_or(RuntimeType::Docker);
    Ok(templates.for_runtime(runtime))
}

async fn list_templates(
    State(state): State<SharedState>,
    Query(query): Query<TemplateQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = registry_for(&state.templates, &query)?;
    Ok(Json(json!({
        "kind": registry.kind(),
        "languages": registry.languages(),
        "templates": registry.list(),
    })))
}

async fn get_template(
    State(state): State<SharedState>,
    Path(language): Path<String>,
    Query(query): Query<TemplateQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = registry_for(&state.templates, &query)?;
    registry
        .find(&language)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No template for {}", language)))
}

// ── Tests ─────────────────────────────────────────────────────────────
