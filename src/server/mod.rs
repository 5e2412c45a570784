//! HTTP surface of the control plane.
//!
//! - `api`: JSON routes over applications, variables, backends and templates
//! - `sse`: per-application live log stream
//! - `server`: router assembly and the listener loop

pub mod api;
pub mod server;
pub mod sse;

pub use api::{AppState, SharedState, api_router};
pub use server::{build_router, start_server};
