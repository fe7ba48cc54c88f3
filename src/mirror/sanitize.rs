//! Proxy-name sanitization and collision-safe suffixing (§4.6 "Naming and
//! collisions").

use sha1::{Digest, Sha1};
use std::collections::HashSet;

/// Replace any character outside `[A-Za-z0-9_.-]` with `_`.
#[must_use]
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '_' })
        .collect()
}

/// Build the collision-safe proxy name for `(server, tool)`: the plain
/// `sanitize(server).sanitize(tool)` form, or that form plus a
/// `"__" + first-6-hex-of-SHA1(server:tool)` suffix if the plain form was
/// already used earlier in this build. Matches the source's behavior of
/// suffixing only the second and later occurrence, not the first.
pub fn proxy_name(server: &str, tool: &str, seen: &mut HashSet<String>) -> String {
    let candidate = format!("{}.{}", sanitize(server), sanitize(tool));
    if seen.insert(candidate.clone()) {
        return candidate;
    }

    let mut hasher = Sha1::new();
    hasher.update(format!("{server}:{tool}").as_bytes());
    let digest = crate::util::hex_encode(hasher.finalize());
    let suffixed = format!("{candidate}__{}", &digest[..6]);
    seen.insert(suffixed.clone());
    suffixed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_forbidden_characters() {
        assert_eq!(sanitize("my server!"), "my_server_");
        assert_eq!(sanitize("a.b-c_d9"), "a.b-c_d9");
    }

    #[test]
    fn proxy_name_only_suffixes_second_occurrence() {
        let mut seen = HashSet::new();
        let first = proxy_name("s", "a", &mut seen);
        let second = proxy_name("s", "a", &mut seen);
        assert_eq!(first, "s.a");
        assert_ne!(second, "s.a");
        assert!(second.starts_with("s.a__"));
    }

    #[test]
    fn proxy_name_dedupes_when_sanitization_itself_collides() {
        let mut seen = HashSet::new();
        let a = proxy_name("s.a", "x", &mut seen);
        let b = proxy_name("s", "a.x", &mut seen);
        assert_ne!(a, b);
    }
}
