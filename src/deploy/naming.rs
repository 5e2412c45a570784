//! Application ids, default names and host port allocation.

use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::time::{SystemTime, UNIX_EPOCH};

pub const PORT_RANGE: RangeInclusive<u16> = 3000..=9999;
const PORT_ATTEMPTS: usize = 50;

/// `app_<unix secs>_<subsec nanos % 1_000_000>`
pub fn generate_app_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("app_{}_{}", now.as_secs(), now.subsec_nanos() % 1_000_000)
}

const MAX_NAME_LEN: usize = 63;

/// Last path segment of the repository URL, without `.git`. Characters
/// outside `[A-Za-z0-9._-]` become `-`.
pub fn default_app_name(repo_url: &str) -> String {
    let trimmed = repo_url.trim().trim_end_matches('/');
    let segment = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    let name: String = segment
        .strip_suffix(".git")
        .unwrap_or(segment)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    if name.is_empty() {
        "app".to_string()
    } else {
        name
    }
}

fn random_port() -> u16 {
    let span = u128::from(PORT_RANGE.end() - PORT_RANGE.start()) + 1;
    let offset = uuid::Uuid::new_v4().as_u128() % span;
    // offset < span <= u16::MAX
    PORT_RANGE.start() + offset as u16
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Pick a random free port not already held by an application.
pub fn allocate_port(taken: &[u16]) -> Option<u16> {
    allocate_port_with(taken, random_port, port_is_free)
}

fn allocate_port_with(
    taken: &[u16],
    mut candidate: impl FnMut() -> u16,
    is_free: impl Fn(u16) -> bool,
) -> Option<u16> {
    (0..PORT_ATTEMPTS)
        .map(|_| candidate())
        .find(|port| !taken.contains(port) && is_free(*port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_id_shape() {
        let id = generate_app_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "app");
        assert!(parts[1].parse::<u64>().unwrap() > 1_600_000_000);
        assert!(parts[2].parse::<u32>().unwrap() < 1_000_000);
    }

    #[test]
    fn test_default_app_name() {
        assert_eq!(default_app_name("https://github.com/acme/web-shop.git"), "web-shop");
        assert_eq!(default_app_name("https://github.com/acme/api/"), "api");
        assert_eq!(default_app_name("git@github.com:acme/cli.git"), "cli");
        assert_eq!(default_app_name("repo"), "repo");
        assert_eq!(default_app_name(""), "app");
    }

    #[test]
    fn test_default_app_name_is_shell_safe() {
        assert_eq!(default_app_name("https://example.com/acme/my%20app+x.git"), "my-20app-x");
        let long = format!("https://example.com/{}", "a".repeat(80));
        assert_eq!(default_app_name(&long).len(), 63);
    }

    #[test]
    fn test_random_port_in_range() {
        for _ in 0..200 {
            assert!(PORT_RANGE.contains(&random_port()));
        }
    }

    #[test]
    fn test_allocation_skips_taken_and_busy_ports() {
        let mut seq = [3000u16, 3001, 3002, 3003].into_iter().cycle();
        let port = allocate_port_with(&[3000], || seq.next().unwrap(), |p| p != 3001);
        assert_eq!(port, Some(3002));
    }

    #[test]
    fn test_allocation_gives_up() {
        let mut calls = 0;
        let port = allocate_port_with(
            &[],
            || {
                calls += 1;
                4000
            },
            |_| false,
        );
        assert!(port.is_none());
        assert_eq!(calls, PORT_ATTEMPTS);
    }

    #[test]
    fn test_allocate_real_port() {
        let port = allocate_port(&[]).unwrap();
        assert!(PORT_RANGE.contains(&port));
    }
}
