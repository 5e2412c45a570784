use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::runtime::RuntimeType;

const APP_COLUMNS: &str = "id, name, repo_url, language, port, container_id, image_id, status, \
                           error_message, runtime_type, created_at, updated_at";

const ENV_COLUMNS: &str = "app_id, key, value, is_secret, created_at, updated_at";

/// Message written onto applications whose pipeline died with the process.
pub const INTERRUPTED_MESSAGE: &str = "Deployment interrupted by a server restart";

/// Async-safe handle to the database.
///
/// Wraps `DiploDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<DiploDb>>,
}

impl DbHandle {
    pub fn new(db: DiploDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DiploDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, DiploDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct DiploDb {
    conn: Connection,
}

impl DiploDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS apps (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    repo_url TEXT NOT NULL UNIQUE,
                    language TEXT NOT NULL DEFAULT '',
                    port INTEGER NOT NULL,
                    container_id TEXT,
                    image_id TEXT,
                    status TEXT NOT NULL DEFAULT 'idle',
                    error_message TEXT,
                    runtime_type TEXT NOT NULL DEFAULT 'docker',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS env_vars (
                    app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    is_secret INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (app_id, key)
                );

                CREATE INDEX IF NOT EXISTS idx_apps_status ON apps(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Application CRUD ──────────────────────────────────────────────

    pub fn create_app(&self, app: &Application) -> Result<Application> {
        self.conn
            .execute(
                "INSERT INTO apps (id, name, repo_url, language, port, container_id, image_id,
                                   status, error_message, runtime_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    app.id,
                    app.name,
                    app.repo_url,
                    app.language,
                    app.port as i64,
                    app.container_id,
                    app.image_id,
                    app.status.as_str(),
                    app.error_message,
                    app.runtime_type.as_str(),
                ],
            )
            .context("Failed to insert app")?;
        self.get_app(&app.id)?.context("App not found after insert")
    }

    /// Return the app for `app.repo_url` if one exists, else insert `app`.
    /// The boolean is true when a row was inserted.
    pub fn find_or_create_app(&self, app: &Application) -> Result<(Application, bool)> {
        if let Some(existing) = self.get_app_by_repo_url(&app.repo_url)? {
            return Ok((existing, false));
        }
        Ok((self.create_app(app)?, true))
    }

    pub fn get_app(&self, id: &str) -> Result<Option<Application>> {
        let sql = format!("SELECT {} FROM apps WHERE id = ?1", APP_COLUMNS);
        self.conn
            .query_row(&sql, params![id], AppRow::from_row)
            .optional()
            .context("Failed to query app")?
            .map(AppRow::into_app)
            .transpose()
    }

    pub fn get_app_by_repo_url(&self, repo_url: &str) -> Result<Option<Application>> {
        let sql = format!("SELECT {} FROM apps WHERE repo_url = ?1", APP_COLUMNS);
        self.conn
            .query_row(&sql, params![repo_url], AppRow::from_row)
            .optional()
            .context("Failed to query app by repo url")?
            .map(AppRow::into_app)
            .transpose()
    }

    pub fn list_apps(&self) -> Result<Vec<Application>> {
        let sql = format!("SELECT {} FROM apps ORDER BY created_at DESC, id DESC", APP_COLUMNS);
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_apps")?;
        let rows = stmt
            .query_map([], AppRow::from_row)
            .context("Failed to query apps")?;
        let mut apps = Vec::new();
        for row in rows {
            apps.push(row.context("Failed to read app row")?.into_app()?);
        }
        Ok(apps)
    }

    /// Write every mutable column of `app`.
    pub fn update_app(&self, app: &Application) -> Result<Application> {
        let changed = self
            .conn
            .execute(
                "UPDATE apps SET name = ?2, language = ?3, port = ?4, container_id = ?5,
                                 image_id = ?6, status = ?7, error_message = ?8,
                                 runtime_type = ?9, updated_at = datetime('now')
                 WHERE id = ?1",
                params![
                    app.id,
                    app.name,
                    app.language,
                    app.port as i64,
                    app.container_id,
                    app.image_id,
                    app.status.as_str(),
                    app.error_message,
                    app.runtime_type.as_str(),
                ],
            )
            .context("Failed to update app")?;
        if changed == 0 {
            anyhow::bail!("App {} not found", app.id);
        }
        self.get_app(&app.id)?.context("App not found after update")
    }

    /// Delete the app and, through the foreign key, its env vars.
    pub fn delete_app(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM apps WHERE id = ?1", params![id])
            .context("Failed to delete app")?;
        Ok(changed > 0)
    }

    pub fn count_apps(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM apps", [], |row| row.get(0))
            .context("Failed to count apps")
    }

    pub fn ports_in_use(&self) -> Result<Vec<u16>> {
        let mut stmt = self
            .conn
            .prepare("SELECT port FROM apps")
            .context("Failed to prepare ports_in_use")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .context("Failed to query ports")?;
        let mut ports = Vec::new();
        for row in rows {
            let port = row.context("Failed to read port row")?;
            if let Ok(p) = u16::try_from(port) {
                ports.push(p);
            }
        }
        Ok(ports)
    }

    /// Move apps left mid-pipeline by a previous process to `error`.
    pub fn recover_interrupted(&self) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE apps SET status = 'error', error_message = ?1, updated_at = datetime('now')
                 WHERE status IN ('deploying', 'redeploying')",
                params![INTERRUPTED_MESSAGE],
            )
            .context("Failed to recover interrupted apps")
    }

    // ── Env var CRUD ──────────────────────────────────────────────────

    /// Insert a new variable; `None` when the key already exists.
    pub fn create_env_var(
        &self,
        app_id: &str,
        key: &str,
        value: &str,
        is_secret: bool,
    ) -> Result<Option<EnvVar>> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO env_vars (app_id, key, value, is_secret) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(app_id, key) DO NOTHING",
                params![app_id, key, value, is_secret],
            )
            .context("Failed to insert env var")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_env_var(app_id, key)
    }

    /// Insert or overwrite a variable.
    pub fn upsert_env_var(
        &self,
        app_id: &str,
        key: &str,
        value: &str,
        is_secret: bool,
    ) -> Result<EnvVar> {
        self.conn
            .execute(
                "INSERT INTO env_vars (app_id, key, value, is_secret) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(app_id, key) DO UPDATE SET value = excluded.value,
                     is_secret = excluded.is_secret, updated_at = datetime('now')",
                params![app_id, key, value, is_secret],
            )
            .context("Failed to upsert env var")?;
        self.get_env_var(app_id, key)?
            .context("Env var not found after upsert")
    }

    pub fn list_env_vars(&self, app_id: &str) -> Result<Vec<EnvVar>> {
        let sql = format!("SELECT {} FROM env_vars WHERE app_id = ?1 ORDER BY key", ENV_COLUMNS);
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_env_vars")?;
        let rows = stmt
            .query_map(params![app_id], env_var_from_row)
            .context("Failed to query env vars")?;
        let mut vars = Vec::new();
        for row in rows {
            vars.push(row.context("Failed to read env var row")?);
        }
        Ok(vars)
    }

    pub fn get_env_var(&self, app_id: &str, key: &str) -> Result<Option<EnvVar>> {
        let sql = format!("SELECT {} FROM env_vars WHERE app_id = ?1 AND key = ?2", ENV_COLUMNS);
        self.conn
            .query_row(&sql, params![app_id, key], env_var_from_row)
            .optional()
            .context("Failed to query env var")
    }

    /// `None` when the variable does not exist.
    pub fn update_env_var(
        &self,
        app_id: &str,
        key: &str,
        value: &str,
        is_secret: bool,
    ) -> Result<Option<EnvVar>> {
        let changed = self
            .conn
            .execute(
                "UPDATE env_vars SET value = ?3, is_secret = ?4, updated_at = datetime('now')
                 WHERE app_id = ?1 AND key = ?2",
                params![app_id, key, value, is_secret],
            )
            .context("Failed to update env var")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_env_var(app_id, key)
    }

    pub fn delete_env_var(&self, app_id: &str, key: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM env_vars WHERE app_id = ?1 AND key = ?2",
                params![app_id, key],
            )
            .context("Failed to delete env var")?;
        Ok(changed > 0)
    }

    pub fn delete_all_env_vars(&self, app_id: &str) -> Result<usize> {
        self.conn
            .execute("DELETE FROM env_vars WHERE app_id = ?1", params![app_id])
            .context("Failed to delete env vars")
    }

    pub fn count_env_vars(&self, app_id: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM env_vars WHERE app_id = ?1",
                params![app_id],
                |row| row.get(0),
            )
            .context("Failed to count env vars")?;
        Ok(count.max(0) as usize)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for reading apps before parsing status and
/// runtime strings into typed values.
struct AppRow {
    id: String,
    name: String,
    repo_url: String,
    language: String,
    port: i64,
    container_id: Option<String>,
    image_id: Option<String>,
    status: String,
    error_message: Option<String>,
    runtime_type: String,
    created_at: String,
    updated_at: String,
}

impl AppRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            repo_url: row.get(2)?,
            language: row.get(3)?,
            port: row.get(4)?,
            container_id: row.get(5)?,
            image_id: row.get(6)?,
            status: row.get(7)?,
            error_message: row.get(8)?,
            runtime_type: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_app(self) -> Result<Application> {
        let status = AppStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse app status")?;
        let runtime_type = RuntimeType::from_str(&self.runtime_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse app runtime type")?;
        let port = u16::try_from(self.port)
            .with_context(|| format!("Port {} out of range", self.port))?;
        Ok(Application {
            id: self.id,
            name: self.name,
            repo_url: self.repo_url,
            language: self.language,
            port,
            container_id: self.container_id,
            image_id: self.image_id,
            status,
            error_message: self.error_message,
            runtime_type,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn env_var_from_row(row: &Row<'_>) -> rusqlite::Result<EnvVar> {
    Ok(EnvVar {
        app_id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        is_secret: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: &str, repo: &str) -> Application {
        Application::new(id, "hello", repo, "", 4000, RuntimeType::Docker)
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = DiploDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('apps', 'env_vars')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 2);
        Ok(())
    }

    #[test]
    fn test_new_creates_parent_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/dir/diplo.db");
        let db = DiploDb::new(&path)?;
        db.create_app(&app("app_1_1", "https://x/a.git"))?;
        drop(db);
        let reopened = DiploDb::new(&path)?;
        assert_eq!(reopened.count_apps()?, 1);
        Ok(())
    }

    #[test]
    fn test_app_crud() -> Result<()> {
        let db = DiploDb::new_in_memory()?;
        let created = db.create_app(&app("app_1_1", "https://github.com/acme/hello.git"))?;
        assert_eq!(created.status, AppStatus::Idle);
        assert!(!created.created_at.is_empty());

        let by_url = db
            .get_app_by_repo_url("https://github.com/acme/hello.git")?
            .expect("app by url");
        assert_eq!(by_url.id, "app_1_1");

        let mut updated = created.clone();
        updated.status = AppStatus::Running;
        updated.container_id = Some("c1".into());
        updated.image_id = Some("sha256:abc".into());
        updated.language = "go".into();
        let updated = db.update_app(&updated)?;
        assert_eq!(updated.status, AppStatus::Running);
        assert_eq!(updated.container_id.as_deref(), Some("c1"));

        assert_eq!(db.list_apps()?.len(), 1);
        assert!(db.delete_app("app_1_1")?);
        assert!(!db.delete_app("app_1_1")?);
        assert!(db.get_app("app_1_1")?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_missing_app_errors() -> Result<()> {
        let db = DiploDb::new_in_memory()?;
        assert!(db.update_app(&app("nope", "u")).is_err());
        Ok(())
    }

    #[test]
    fn test_repo_url_is_unique() -> Result<()> {
        let db = DiploDb::new_in_memory()?;
        db.create_app(&app("app_1_1", "https://x/a.git"))?;
        assert!(db.create_app(&app("app_1_2", "https://x/a.git")).is_err());
        Ok(())
    }

    #[test]
    fn test_find_or_create_app() -> Result<()> {
        let db = DiploDb::new_in_memory()?;
        let (first, created) = db.find_or_create_app(&app("app_1_1", "https://x/a.git"))?;
        assert!(created);
        let (second, created) = db.find_or_create_app(&app("app_2_2", "https://x/a.git"))?;
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(db.count_apps()?, 1);
        Ok(())
    }

    #[test]
    fn test_recover_interrupted() -> Result<()> {
        let db = DiploDb::new_in_memory()?;
        let mut a = db.create_app(&app("app_1_1", "https://x/a.git"))?;
        a.status = AppStatus::Deploying;
        db.update_app(&a)?;
        let mut b = db.create_app(&app("app_1_2", "https://x/b.git"))?;
        b.status = AppStatus::Running;
        db.update_app(&b)?;

        assert_eq!(db.recover_interrupted()?, 1);
        let a = db.get_app("app_1_1")?.expect("app a");
        assert_eq!(a.status, AppStatus::Error);
        assert_eq!(a.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(db.get_app("app_1_2")?.expect("app b").status, AppStatus::Running);
        Ok(())
    }

    #[test]
    fn test_ports_in_use() -> Result<()> {
        let db = DiploDb::new_in_memory()?;
        db.create_app(&app("app_1_1", "https://x/a.git"))?;
        assert_eq!(db.ports_in_use()?, vec![4000]);
        Ok(())
    }

    #[test]
    fn test_env_var_crud() -> Result<()> {
        let db = DiploDb::new_in_memory()?;
        db.create_app(&app("app_1_1", "https://x/a.git"))?;

        let created = db
            .create_env_var("app_1_1", "LOG_LEVEL", "debug", false)?
            .expect("created");
        assert_eq!(created.value, "debug");
        assert!(db.create_env_var("app_1_1", "LOG_LEVEL", "info", false)?.is_none());

        let updated = db
            .update_env_var("app_1_1", "LOG_LEVEL", "info", false)?
            .expect("updated");
        assert_eq!(updated.value, "info");
        assert!(db.update_env_var("app_1_1", "MISSING", "x", false)?.is_none());

        let upserted = db.upsert_env_var("app_1_1", "API_TOKEN", "cipher", true)?;
        assert!(upserted.is_secret);
        assert_eq!(db.count_env_vars("app_1_1")?, 2);

        let keys: Vec<String> = db
            .list_env_vars("app_1_1")?
            .into_iter()
            .map(|v| v.key)
            .collect();
        assert_eq!(keys, vec!["API_TOKEN", "LOG_LEVEL"]);

        assert!(db.delete_env_var("app_1_1", "LOG_LEVEL")?);
        assert!(!db.delete_env_var("app_1_1", "LOG_LEVEL")?);
        assert_eq!(db.delete_all_env_vars("app_1_1")?, 1);
        Ok(())
    }

    #[test]
    fn test_delete_app_cascades_env_vars() -> Result<()> {
        let db = DiploDb::new_in_memory()?;
        db.create_app(&app("app_1_1", "https://x/a.git"))?;
        db.create_env_var("app_1_1", "A", "1", false)?;
        db.delete_app("app_1_1")?;
        assert_eq!(db.count_env_vars("app_1_1")?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_call() -> Result<()> {
        let handle = DbHandle::new(DiploDb::new_in_memory()?);
        handle
            .call(|db| db.create_app(&app("app_1_1", "https://x/a.git")))
            .await?;
        let count = handle.call(|db| db.count_apps()).await?;
        assert_eq!(count, 1);
        Ok(())
    }
}
