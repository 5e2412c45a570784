//! CLI smoke tests for the diplo binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn diplo() -> Command {
    let mut cmd = cargo_bin_cmd!("diplo");
    cmd.env_remove("DIPLO_DB_PATH")
        .env_remove("DIPLO_PORT")
        .env_remove("DIPLO_CONFIG")
        .env("RUST_LOG", "error");
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        diplo()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("status"))
            .stdout(predicate::str::contains("init-db"));
    }

    #[test]
    fn test_version() {
        diplo()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("diplo"));
    }

    #[test]
    fn test_serve_help_shows_flags() {
        diplo()
            .args(["serve", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--port"))
            .stdout(predicate::str::contains("--db-path"));
    }

    #[test]
    fn test_unknown_command_fails() {
        diplo().arg("deploy-everything").assert().failure();
    }
}

// =============================================================================
// Database bootstrap
// =============================================================================

mod init_db {
    use super::*;

    #[test]
    fn test_init_db_creates_file() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("data").join("diplo.db");

        diplo()
            .current_dir(dir.path())
            .args(["init-db", "--db-path"])
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("Database initialized"))
            .stdout(predicate::str::contains("0 applications"));

        assert!(db_path.exists());
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("diplo.db");
        for _ in 0..2 {
            diplo()
                .current_dir(dir.path())
                .args(["init-db", "--db-path"])
                .arg(&db_path)
                .assert()
                .success();
        }
    }

    #[test]
    fn test_init_db_uses_config_file() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("from-config.db");
        fs::write(
            dir.path().join("diplo.toml"),
            format!("[server]\ndb_path = {:?}\n", db_path.display().to_string()),
        )
        .unwrap();

        diplo()
            .current_dir(dir.path())
            .arg("init-db")
            .assert()
            .success();

        assert!(db_path.exists());
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("broken.toml");
        fs::write(&config, "[server\nport = ").unwrap();

        diplo()
            .current_dir(dir.path())
            .args(["--config"])
            .arg(&config)
            .arg("init-db")
            .assert()
            .failure()
            .stderr(predicate::str::contains("diplo.toml"));
    }
}

// =============================================================================
// Host report
// =============================================================================

mod status {
    use super::*;

    #[test]
    fn test_status_reports_backends() {
        let dir = TempDir::new().unwrap();
        diplo()
            .current_dir(dir.path())
            .env("DIPLO_DOCKER_HOST", "unix:///nonexistent/docker.sock")
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Host"))
            .stdout(predicate::str::contains("docker"))
            .stdout(predicate::str::contains("lxc"))
            .stdout(predicate::str::contains("(preferred)"));
    }
}
