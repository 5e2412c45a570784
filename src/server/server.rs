use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use crate::config::DiploConfig;
use crate::deploy::Deployer;
use crate::events::LogHub;
use crate::runtime::factory::RuntimeSettings;
use crate::runtime::{RuntimeFactory, RuntimeProvider};
use crate::secrets::{AesGcmCipher, SecretCipher};
use crate::store::{DbHandle, DiploDb};
use crate::templates::Templates;

/// Build the full application router.
pub fn build_router(state: Arc<AppState>, cors: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open (creating if needed) the database at the configured path.
pub fn open_database(config: &DiploConfig) -> Result<DiploDb> {
    let db_path = &config.server.db_path;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    DiploDb::new(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))
}

/// Start the control plane and serve until Ctrl+C.
pub async fn start_server(config: DiploConfig) -> Result<()> {
    for warning in config.validate() {
        warn!("{}", warning);
    }

    let factory = RuntimeFactory::detect(RuntimeSettings {
        docker: config.docker.clone(),
        lxc: config.lxc.clone(),
    })
    .await;
    let report = factory.report().await;
    info!(
        available = ?report.available,
        preferred = %report.preferred,
        os = %report.system.os,
        "Container backends detected"
    );
    if report.available.is_empty() {
        warn!("No container backend available; deployments will fail until one is");
    }
    let runtimes: Arc<dyn RuntimeProvider> = Arc::new(factory);

    let db = DbHandle::new(open_database(&config)?);
    let hub = LogHub::new();
    let templates = Arc::new(Templates::builtin());
    let cipher: Arc<dyn SecretCipher> = Arc::new(AesGcmCipher::from_config(
        config.secrets.encryption_key.as_deref(),
    ));

    let deployer = Arc::new(Deployer::new(
        db.clone(),
        runtimes.clone(),
        templates.clone(),
        hub.clone(),
        cipher.clone(),
        config.images.clone(),
    ));
    deployer
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted deployments")?;

    let state = Arc::new(AppState {
        db,
        runtimes,
        deployer,
        templates,
        hub,
        cipher,
    });
    let app = build_router(state, config.server.cors);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, db = %config.server.db_path.display(), "diplo listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImagesSection;
    use crate::runtime::RuntimeType;
    use crate::runtime::testing::{MockProvider, MockRuntime};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_router(cors: bool) -> Router {
        let db = DbHandle::new(DiploDb::new_in_memory().unwrap());
        let hub = LogHub::new();
        let templates = Arc::new(Templates::builtin());
        let cipher: Arc<dyn SecretCipher> = Arc::new(AesGcmCipher::ephemeral());
        let runtimes: Arc<dyn RuntimeProvider> =
            MockProvider::new(vec![MockRuntime::new(RuntimeType::Docker)]);
        let deployer = Arc::new(Deployer::new(
            db.clone(),
            runtimes.clone(),
            templates.clone(),
            hub.clone(),
            cipher.clone(),
            ImagesSection::default(),
        ));
        build_router(
            Arc::new(AppState {
                db,
                runtimes,
                deployer,
                templates,
                hub,
                cipher,
            }),
            cors,
        )
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router(false);
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router(false);
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_layer() {
        let app = test_router(true);
        let req = Request::builder()
            .uri("/api/health")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }

    #[test]
    fn test_open_database_creates_parent() {
        let dir = tempdir().unwrap();
        let mut config = DiploConfig::default();
        config.server.db_path = dir.path().join("nested").join("diplo.db");
        open_database(&config).unwrap();
        assert!(config.server.db_path.exists());
    }
}
