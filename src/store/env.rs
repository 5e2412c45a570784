//! Environment variable rules.

use std::sync::LazyLock;

use regex::Regex;

/// Per-application cap.
pub const MAX_ENV_VARS: usize = 50;
pub const MAX_KEY_LEN: usize = 100;
pub const MAX_VALUE_LEN: usize = 1000;

/// Keys the platform or the host owns; compared case-insensitively.
const RESERVED_KEYS: [&str; 30] = [
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "TERM",
    "PWD",
    "LANG",
    "LC_ALL",
    "LD_LIBRARY_PATH",
    "LD_PRELOAD",
    "TMPDIR",
    "TMP",
    "TEMP",
    "HOSTNAME",
    "DOCKER_HOST",
    "DOCKER_TLS_VERIFY",
    "DOCKER_CERT_PATH",
    "DOCKER_MACHINE_NAME",
    "DOCKER_BUILDKIT",
    "COMPOSE_PROJECT_NAME",
    "DIPLO_APP_ID",
    "DIPLO_APP_NAME",
    "PORT",
    "DYLD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "NODE_OPTIONS",
    "PYTHONPATH",
    "RUBYLIB",
    "PERL5LIB",
    "CLASSPATH",
];

const SECRET_HINTS: [&str; 6] = ["password", "secret", "key", "token", "api_key", "private"];

const FORBIDDEN_VALUE_CHARS: [char; 10] = ['`', '$', ';', '|', '&', '<', '>', '\n', '\r', '\t'];

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.iter().any(|r| r.eq_ignore_ascii_case(key))
}

pub fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(format!("Key must be 1-{} characters", MAX_KEY_LEN));
    }
    if !KEY_RE.is_match(key) {
        return Err(format!(
            "Invalid key '{}': use letters, digits and underscores, not starting with a digit",
            key
        ));
    }
    if is_reserved(key) {
        return Err(format!("Key '{}' is reserved", key));
    }
    Ok(())
}

pub fn validate_value(value: &str) -> Result<(), String> {
    if value.is_empty() || value.chars().count() > MAX_VALUE_LEN {
        return Err(format!("Value must be 1-{} characters", MAX_VALUE_LEN));
    }
    if let Some(c) = value.chars().find(|c| FORBIDDEN_VALUE_CHARS.contains(c)) {
        return Err(format!("Value contains forbidden character {:?}", c));
    }
    if value.starts_with('-') || value.starts_with('/') {
        return Err("Value must not start with '-' or '/'".to_string());
    }
    Ok(())
}

pub fn validate_pair(key: &str, value: &str) -> Result<(), String> {
    validate_key(key)?;
    validate_value(value)
}

/// Whether a key without an explicit flag should be stored as a secret.
pub fn looks_secret(key: &str) -> bool {
    let lower = key.to_lowercase();
    SECRET_HINTS.iter().any(|hint| lower.contains(hint))
}
