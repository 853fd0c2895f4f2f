//! Wildcard name matching
//!
//! Minimal `*` glob used for lock-key scans and forbidden tool sequences.

/// Match `name` against `pattern`, where `*` matches any run of characters
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn inner(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], name) || (!name.is_empty() && inner(pattern, &name[1..]))
            }
            (Some(p), Some(n)) if p == n => inner(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}
