//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `status`  | `Status`         |
//! | `db`      | `InitDb`         |

pub mod db;
pub mod serve;
pub mod status;

pub use db::cmd_init_db;
pub use serve::cmd_serve;
pub use status::cmd_status;
