//! Control plane server command, `diplo serve`.

use std::path::PathBuf;

use anyhow::Result;
use diplo::config::DiploConfig;

pub async fn cmd_serve(
    mut config: DiploConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(db_path) = db_path {
        config.server.db_path = db_path;
    }
    diplo::server::start_server(config).await
}
