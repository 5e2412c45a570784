//! Database bootstrap command, `diplo init-db`.

use std::path::PathBuf;

use anyhow::Result;
use diplo::config::DiploConfig;

pub fn cmd_init_db(mut config: DiploConfig, db_path: Option<PathBuf>) -> Result<()> {
    if let Some(db_path) = db_path {
        config.server.db_path = db_path;
    }
    let db = diplo::server::server::open_database(&config)?;
    let apps = db.count_apps()?;
    println!(
        "Database initialized at {} ({} application{})",
        config.server.db_path.display(),
        apps,
        if apps == 1 { "" } else { "s" }
    );
    Ok(())
}
