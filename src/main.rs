use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use diplo::config::DiploConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "diplo")]
#[command(version, about = "Local PaaS control plane for Docker, containerd and LXC")]
pub struct Cli {
    /// Path to diplo.toml (defaults to ./diplo.toml when present)
    #[arg(short, long, global = true, env = "DIPLO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP control plane
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Show the host profile and which container backends are usable
    Status,
    /// Create the database and schema, then exit
    InitDb {
        /// SQLite database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

/// Logs go to stderr, or to a daily-rotated file when `log_dir` is set.
fn init_tracing(json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (writer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "diplo.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(log_dir.is_none())
        .with_writer(writer);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = DiploConfig::resolve(cli.config.as_deref())?;
    let _guard = init_tracing(cli.log_json, config.server.log_dir.as_deref());

    match cli.command {
        Commands::Serve { port, db_path } => cmd::cmd_serve(config, port, db_path).await?,
        Commands::Status => cmd::cmd_status(&config).await?,
        Commands::InitDb { db_path } => cmd::cmd_init_db(config, db_path)?,
    }

    Ok(())
}
