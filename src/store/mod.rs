//! Persistence: applications and their environment variables in SQLite.

pub mod db;
pub mod env;
pub mod models;

pub use db::{DbHandle, DiploDb};
pub use models::{AppStatus, Application, EnvVar, SECRET_MASK};
