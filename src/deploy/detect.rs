//! Source inspection: shallow clone, language detection and HEAD commit.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::Repository;
use tracing::{debug, warn};

use crate::errors::DeployError;

/// Language used when no marker matches.
pub const FALLBACK_LANGUAGE: &str = "go";

/// Ordered marker table; the first language with a matching marker wins.
/// Glob markers are checked in the repository root and in `src/`.
const MARKERS: &[(&str, &[&str])] = &[
    ("go", &["go.mod", "go.sum", "main.go", "*.go"]),
    (
        "javascript",
        &[
            "package.json",
            "yarn.lock",
            "package-lock.json",
            "app.js",
            "index.js",
            "server.js",
        ],
    ),
    (
        "python",
        &[
            "requirements.txt",
            "setup.py",
            "pyproject.toml",
            "Pipfile",
            "app.py",
            "main.py",
            "*.py",
        ],
    ),
    ("rust", &["Cargo.toml", "Cargo.lock", "src/main.rs", "src/lib.rs"]),
    ("java", &["pom.xml", "build.gradle", "gradlew", "src/main/java"]),
    ("php", &["composer.json", "composer.lock", "index.php", "*.php"]),
    ("ruby", &["Gemfile", "Gemfile.lock", "config.ru", "*.rb"]),
];

/// What a clone of the repository told us.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceInfo {
    /// Set only when detection was requested
    pub language: Option<String>,
    /// Full HEAD commit hash; `None` when the clone or lookup failed
    pub commit: Option<String>,
}

#[async_trait]
pub trait SourceInspector: Send + Sync {
    /// Clone `clone_url` and read its HEAD commit, detecting the language
    /// when `detect` is set. A failed clone is only an error when detection
    /// was requested.
    async fn inspect(&self, clone_url: &str, detect: bool) -> Result<SourceInfo, DeployError>;

    /// Shallow clone kept on disk until the returned directory is dropped.
    async fn checkout(&self, clone_url: &str) -> Result<tempfile::TempDir, DeployError> {
        let workdir = tempfile::Builder::new()
            .prefix("diplo-source-")
            .tempdir()
            .context("Failed to create checkout directory")?;
        shallow_clone(clone_url, workdir.path())
            .await
            .map_err(|e| DeployError::Build(redact(&format!("{:#}", e), clone_url)))?;
        Ok(workdir)
    }
}

/// Shallow clones with the host `git` binary into a temporary directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitSource;

#[async_trait]
impl SourceInspector for GitSource {
    async fn inspect(&self, clone_url: &str, detect: bool) -> Result<SourceInfo, DeployError> {
        let workdir = tempfile::Builder::new()
            .prefix("diplo-clone-")
            .tempdir()
            .context("Failed to create clone directory")?;
        let dest = workdir.path().join("repo");

        if let Err(e) = shallow_clone(clone_url, &dest).await {
            let reason = redact(&format!("{:#}", e), clone_url);
            if detect {
                return Err(DeployError::Detection(reason));
            }
            warn!(error = %reason, "Clone failed, continuing without commit hash");
            return Ok(SourceInfo::default());
        }

        let path = dest.clone();
        let info = tokio::task::spawn_blocking(move || {
            let language = detect.then(|| detect_language(&path));
            let commit = match head_commit(&path) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    warn!(error = %e, "Could not read HEAD commit");
                    None
                }
            };
            SourceInfo { language, commit }
        })
        .await
        .context("Source inspection task panicked")?;

        debug!(language = ?info.language, commit = ?info.commit, "Inspected source");
        drop(workdir);
        Ok(info)
    }
}

async fn shallow_clone(clone_url: &str, dest: &Path) -> Result<()> {
    let output = tokio::process::Command::new("git")
        .args(["clone", "--depth", "1", "--quiet", clone_url])
        .arg(dest)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to run git clone")?;

    if !output.status.success() {
        anyhow::bail!(
            "git clone failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Full hash of the commit HEAD points at.
pub fn head_commit(repo_dir: &Path) -> Result<String> {
    let repo = Repository::open(repo_dir).context("Failed to open cloned repository")?;
    let commit = repo
        .head()
        .and_then(|head| head.peel_to_commit())
        .context("Repository has no HEAD commit")?;
    Ok(commit.id().to_string())
}

/// Walk the marker table against a checked-out tree.
pub fn detect_language(dir: &Path) -> String {
    MARKERS
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| has_marker(dir, m)))
        .map(|(language, _)| language.to_string())
        .unwrap_or_else(|| FALLBACK_LANGUAGE.to_string())
}

fn has_marker(dir: &Path, marker: &str) -> bool {
    if !marker.contains('*') {
        return dir.join(marker).exists();
    }
    let bases: [PathBuf; 2] = [dir.to_path_buf(), dir.join("src")];
    bases.iter().any(|base| {
        let pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&base.to_string_lossy()),
            marker
        );
        glob::glob(&pattern)
            .map(|mut paths| paths.any(|p| p.is_ok()))
            .unwrap_or(false)
    })
}

/// Splice a token into an https clone URL as `https://<token>@host/...`.
/// Other schemes and URLs that already carry credentials are left alone.
pub fn authenticated_url(repo_url: &str, token: Option<&str>) -> String {
    let token = match token.map(str::trim) {
        Some(t) if !t.is_empty() => t,
        _ => return repo_url.to_string(),
    };
    match repo_url.strip_prefix("https://") {
        Some(rest) if userinfo(repo_url).is_none() => format!("https://{}@{}", token, rest),
        _ => repo_url.to_string(),
    }
}

/// Credentials part of an http(s) URL, if any.
fn userinfo(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    authority.rsplit_once('@').map(|(creds, _)| creds)
}

/// Mask the credentials of `url` wherever they appear in `text`.
pub fn redact(text: &str, url: &str) -> String {
    match userinfo(url) {
        Some(creds) if !creds.is_empty() => text.replace(creds, "***"),
        _ => text.to_string(),
    }
}
