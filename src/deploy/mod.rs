//! Deployment orchestration.
//!
//! ```text
//!  POST /api/deploy ──> naming.rs (id, name, port) ──> store
//!                                     │
//!                                     v  tokio::spawn
//!              ┌──────────── pipeline.rs Deployer ─────────────┐
//!              │ locks.rs   one attempt per application        │
//!              │ detect.rs  clone, language, HEAD commit       │
//!              │ templates  Dockerfile / LXC script            │
//!              │ images.rs  tag, build, resolve, retention     │
//!              │ runtime    create + start on chosen backend   │
//!              └───────────────────────┬───────────────────────┘
//!                                      v
//!                               events::LogHub
//! ```

pub mod detect;
pub mod images;
pub mod locks;
pub mod naming;
pub mod pipeline;

pub use detect::{GitSource, SourceInfo, SourceInspector};
pub use locks::PipelineLocks;
pub use pipeline::{DeployRequest, Deployer, is_valid_transition};
