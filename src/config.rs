//! Configuration for the diplo control plane.
//!
//! Settings are layered: `diplo.toml` (optional) → `DIPLO_*` environment
//! variables → CLI flags. Every field has a default so an empty file, or no
//! file at all, yields a working configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! db_path = "/var/lib/diplo/diplo.db"
//! cors = false
//!
//! [images]
//! tag_prefix = "diplo"
//! keep = 3
//! resolve_attempts = 5
//! resolve_delay_ms = 1000
//!
//! [lxc]
//! poll_interval_ms = 1000
//! start_timeout_secs = 30
//! lxc_path = "/var/lib/lxc"
//!
//! [docker]
//! host = "unix:///var/run/docker.sock"
//!
//! [secrets]
//! encryption_key = "0123456789abcdef0123456789abcdef"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "diplo.toml";

/// HTTP listener and storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Attach a permissive CORS layer (for a dashboard served elsewhere)
    #[serde(default)]
    pub cors: bool,
    /// Directory for daily-rotated log files; stderr only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            cors: false,
            log_dir: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("diplo").join("diplo.db"))
        .unwrap_or_else(|| PathBuf::from(".diplo/diplo.db"))
}

/// Image pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesSection {
    /// Prefix of every image tag and container name
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    /// Number of images kept per application after a successful deploy
    #[serde(default = "default_keep")]
    pub keep: usize,
    /// Lookups of a freshly built tag before falling back to the build id
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: u32,
    #[serde(default = "default_resolve_delay_ms")]
    pub resolve_delay_ms: u64,
}

impl Default for ImagesSection {
    fn default() -> Self {
        Self {
            tag_prefix: default_tag_prefix(),
            keep: default_keep(),
            resolve_attempts: default_resolve_attempts(),
            resolve_delay_ms: default_resolve_delay_ms(),
        }
    }
}

impl ImagesSection {
    pub fn resolve_delay(&self) -> Duration {
        Duration::from_millis(self.resolve_delay_ms)
    }
}

fn default_tag_prefix() -> String {
    "diplo".to_string()
}

fn default_keep() -> usize {
    3
}

fn default_resolve_attempts() -> u32 {
    5
}

fn default_resolve_delay_ms() -> u64 {
    1000
}

/// LXC backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LxcSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// Root of the LXC container directories (console logs live here)
    #[serde(default = "default_lxc_path")]
    pub lxc_path: PathBuf,
}

impl Default for LxcSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            start_timeout_secs: default_start_timeout_secs(),
            lxc_path: default_lxc_path(),
        }
    }
}

impl LxcSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_start_timeout_secs() -> u64 {
    30
}

fn default_lxc_path() -> PathBuf {
    PathBuf::from("/var/lib/lxc")
}

/// Docker daemon connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerSection {
    /// Daemon address; the local socket defaults apply when unset
    #[serde(default)]
    pub host: Option<String>,
}

/// Secret storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsSection {
    /// 32-byte AES-256 key; a random per-process key is used when unset
    #[serde(default)]
    pub encryption_key: Option<String>,
}

/// Root of `diplo.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiploConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub images: ImagesSection,
    #[serde(default)]
    pub lxc: LxcSection,
    #[serde(default)]
    pub docker: DockerSection,
    #[serde(default)]
    pub secrets: SecretsSection,
}

impl DiploConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse diplo.toml")
    }

    /// Load `path` if given, else `./diplo.toml` if present, else defaults.
    /// Environment overrides are applied on top in every case.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => {
                let local = PathBuf::from(CONFIG_FILE_NAME);
                if local.exists() {
                    Self::load(&local)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `DIPLO_*` environment variables over file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("DIPLO_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid DIPLO_PORT '{}'", port))?;
        }
        if let Ok(path) = std::env::var("DIPLO_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Ok(host) = std::env::var("DIPLO_DOCKER_HOST") {
            self.docker.host = Some(host);
        }
        if let Ok(key) = std::env::var("DIPLO_ENCRYPTION_KEY") {
            self.secrets.encryption_key = Some(key);
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(ref key) = self.secrets.encryption_key
            && key.len() != 32
        {
            warnings.push(format!(
                "encryption_key must be exactly 32 bytes (got {}); secrets will use a per-process key",
                key.len()
            ));
        }
        if self.secrets.encryption_key.is_none() {
            warnings.push(
                "No encryption_key configured; secret env vars will not survive a restart"
                    .to_string(),
            );
        }
        if self.images.resolve_attempts == 0 {
            warnings.push("images.resolve_attempts is 0; tag lookups will never run".to_string());
        }
        if self.images.keep == 0 {
            warnings.push("images.keep is 0; every image of an app is pruned after deploy".to_string());
        }
        if self.lxc.poll_interval_ms == 0 {
            warnings.push("lxc.poll_interval_ms is 0; using 1ms between polls".to_string());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let config = DiploConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.images.tag_prefix, "diplo");
        assert_eq!(config.images.keep, 3);
        assert_eq!(config.images.resolve_attempts, 5);
        assert_eq!(config.lxc.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.lxc.start_timeout(), Duration::from_secs(30));
        assert!(config.docker.host.is_none());
    }

    #[test]
    fn test_parse_empty_string_uses_defaults() {
        let config = DiploConfig::parse("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.images.resolve_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_parse_partial_sections() {
        let config = DiploConfig::parse(
            r#"
[server]
port = 9000

[images]
keep = 5

[lxc]
start_timeout_secs = 10
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.images.keep, 5);
        assert_eq!(config.images.resolve_attempts, 5);
        assert_eq!(config.lxc.start_timeout_secs, 10);
        assert_eq!(config.lxc.poll_interval_ms, 1000);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let err = DiploConfig::parse("[server\nport = ").unwrap_err();
        assert!(err.to_string().contains("diplo.toml"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("diplo.toml");
        std::fs::write(&path, "[docker]\nhost = \"tcp://10.0.0.2:2375\"\n").unwrap();

        let config = DiploConfig::load(&path).unwrap();
        assert_eq!(config.docker.host.as_deref(), Some("tcp://10.0.0.2:2375"));
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempdir().unwrap();
        let err = DiploConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        // SAFETY: serialized by ENV_MUTEX
        unsafe {
            std::env::set_var("DIPLO_PORT", "9999");
            std::env::set_var("DIPLO_ENCRYPTION_KEY", "k".repeat(32));
        }
        let mut config = DiploConfig::default();
        let result = config.apply_env_overrides();
        unsafe {
            std::env::remove_var("DIPLO_PORT");
            std::env::remove_var("DIPLO_ENCRYPTION_KEY");
        }
        result.unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.secrets.encryption_key.as_deref(), Some(&*"k".repeat(32)));
    }

    #[test]
    fn test_env_override_invalid_port() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("DIPLO_PORT", "not-a-port");
        }
        let mut config = DiploConfig::default();
        let result = config.apply_env_overrides();
        unsafe {
            std::env::remove_var("DIPLO_PORT");
        }
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_warns_on_bad_key_length() {
        let mut config = DiploConfig::default();
        config.secrets.encryption_key = Some("short".to_string());
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("exactly 32 bytes")));
    }

    #[test]
    fn test_validate_clean_config() {
        let mut config = DiploConfig::default();
        config.secrets.encryption_key = Some("a".repeat(32));
        assert!(config.validate().is_empty());
    }
}
