//! Image tags, build output handling, image id resolution and retention.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::errors::{DeployError, RuntimeError};
use crate::runtime::{BuildStream, ImageBackend};

/// Tag used for every image the pipeline builds.
pub const LATEST: &str = "latest";

/// Lowercase, map everything outside `[a-z0-9-]` to `-`, collapse runs of `-`.
pub fn sanitize_tag(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out
}

/// `<prefix>-<app id without "app_">-`, shared by every image of one app.
pub fn app_tag_prefix(prefix: &str, app_id: &str) -> String {
    let id = app_id.strip_prefix("app_").unwrap_or(app_id);
    sanitize_tag(&format!("{}-{}-", prefix, id))
}

/// Image tag for one build of `app_id` at `commit`.
pub fn derive_tag(prefix: &str, app_id: &str, commit: &str) -> String {
    let short: String = commit.chars().take(8).collect();
    sanitize_tag(&format!("{}{}", app_tag_prefix(prefix, app_id), short))
}

/// Stand-in commit hash when the repository could not be read.
pub fn fallback_hash() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seed = format!("fallback_{}_{}", now.as_secs(), now.subsec_nanos());
    format!("{:x}", Sha256::digest(seed.as_bytes()))
}

/// Image id announced by a build output line, if any.
fn announced_id(line: &str) -> Option<String> {
    if let Some(rest) = line.strip_prefix("Successfully built ") {
        return rest.split_whitespace().next().map(str::to_string);
    }
    if line.starts_with("sha256:") && !line.contains(char::is_whitespace) {
        return Some(line.to_string());
    }
    None
}

/// Drain a build stream, passing each non-empty output line to `on_line`.
///
/// Fails on the first error entry. Returns the image id the build announced,
/// which is only used when the tag cannot be resolved.
pub async fn consume_build_stream(
    mut stream: BuildStream,
    mut on_line: impl FnMut(&str),
) -> Result<Option<String>, DeployError> {
    let mut built_id = None;
    while let Some(item) = stream.next().await {
        let msg = item?;
        if let Some(error) = msg.error {
            return Err(DeployError::Build(error.trim().to_string()));
        }
        if let Some(id) = msg.aux_id {
            built_id = Some(id);
        }
        if let Some(text) = msg.stream {
            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if let Some(id) = announced_id(line) {
                    built_id = Some(id);
                }
                on_line(line);
            }
        }
    }
    Ok(built_id)
}

/// Authoritative image id for `tag`.
///
/// Looks the tag up `attempts` times, `delay` apart. When it never shows up,
/// falls back to the id captured from the build stream and re-tags it.
pub async fn resolve_image(
    backend: &dyn ImageBackend,
    tag: &str,
    built_id: Option<&str>,
    attempts: u32,
    delay: Duration,
) -> Result<String, DeployError> {
    for attempt in 1..=attempts {
        match backend.find_image_by_tag(tag).await {
            Ok(Some(id)) => {
                debug!(tag, attempt, image = %id, "Resolved image by tag");
                return Ok(id);
            }
            Ok(None) => debug!(tag, attempt, "Image tag not visible yet"),
            Err(e) => warn!(tag, attempt, error = %e, "Image lookup failed"),
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }

    let Some(id) = built_id else {
        return Err(DeployError::ImageResolution {
            tag: tag.to_string(),
            attempts,
        });
    };
    info!(tag, image = %id, "Using image id captured from build output");
    if let Err(e) = backend.tag_image(id, tag, LATEST).await {
        warn!(tag, image = %id, error = %e, "Could not re-tag image");
    }
    Ok(id.to_string())
}

/// Keep the newest `keep` images tagged with `prefix`; remove the rest
/// oldest-first. Returns the removed ids.
pub async fn retain_recent_images(
    backend: &dyn ImageBackend,
    prefix: &str,
    keep: usize,
) -> Result<Vec<String>, RuntimeError> {
    let mut images = backend.list_images(prefix).await?;
    images.sort_by(|a, b| b.created.cmp(&a.created));

    let mut removed = Vec::new();
    for image in images.into_iter().skip(keep).rev() {
        match backend.remove_image(&image.id).await {
            Ok(()) => removed.push(image.id),
            Err(e) => warn!(image = %image.id, error = %e, "Failed to remove old image"),
        }
    }
    Ok(removed)
}

/// Post-deploy cleanup. Failures are logged only.
pub async fn housekeeping(backend: &dyn ImageBackend, prefix: &str, keep: usize) {
    match retain_recent_images(backend, prefix, keep).await {
        Ok(removed) if !removed.is_empty() => {
            info!(prefix, count = removed.len(), "Removed old images")
        }
        Ok(_) => {}
        Err(e) => warn!(prefix, error = %e, "Image retention failed"),
    }
    match backend.prune_dangling_images().await {
        Ok(report) => debug!(
            removed = report.removed.len(),
            reclaimed = report.space_reclaimed,
            "Pruned dangling images"
        ),
        Err(e) => warn!(error = %e, "Dangling image prune failed"),
    }
}
