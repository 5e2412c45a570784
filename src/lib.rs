pub mod config;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod runtime;
pub mod secrets;
pub mod server;
pub mod store;
pub mod templates;
