//! Typed error hierarchy for diplo.
//!
//! - `RuntimeError`: a container backend call failed or the backend is absent
//! - `DeployError`: a deployment stage failed
//! - `TemplateError`: a template registry mutation was rejected

use thiserror::Error;

use crate::runtime::RuntimeType;
use crate::store::models::AppStatus;

/// Errors raised by a backend adapter.
///
/// Adapters never retry; the raw diagnostic text from the engine is kept in
/// `message` so it can be surfaced on the application record verbatim.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{backend} backend error: {message}")]
    Backend {
        backend: RuntimeType,
        message: String,
    },

    #[error("{0} runtime is not available on this host")]
    Unavailable(RuntimeType),
}

impl RuntimeError {
    pub fn backend(backend: RuntimeType, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Error returned by adapters for operations they do not implement.
    pub fn unsupported(backend: RuntimeType) -> Self {
        Self::backend(backend, "not supported by this backend")
    }

    pub fn runtime_type(&self) -> RuntimeType {
        match self {
            Self::Backend { backend, .. } => *backend,
            Self::Unavailable(backend) => *backend,
        }
    }
}

/// Errors from a single deployment attempt.
///
/// Every variant except `Validation` is terminal for the attempt: the message
/// is written onto the application and the status moves to `error`.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Language detection failed: {0}")]
    Detection(String),

    #[error("Build failed: {0}")]
    Build(String),

    #[error("No image found for tag {tag} after {attempts} attempts and no build id was captured")]
    ImageResolution { tag: String, attempts: u32 },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Application {id} not found")]
    AppNotFound { id: String },

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: AppStatus, to: AppStatus },

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    /// Short machine-readable name, used in logs and stream events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Detection(_) => "detection",
            Self::Build(_) => "build",
            Self::ImageResolution { .. } => "image_resolution",
            Self::Runtime(RuntimeError::Backend { .. }) => "runtime_backend",
            Self::Runtime(RuntimeError::Unavailable(_)) => "backend_unavailable",
            Self::AppNotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Storage(_) => "storage",
            Self::Other(_) => "internal",
        }
    }
}

/// Rejected template registry mutations.
#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("Invalid template: {0}")]
    Invalid(String),

    #[error("Template for {0} already exists")]
    Exists(String),

    #[error("No template for {0}")]
    NotFound(String),

    #[error("The generic template cannot be deleted")]
    Protected,
}
