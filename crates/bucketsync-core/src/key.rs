//! Destination key mapping.
//!
//! Object keys are not filesystem paths: they are always joined with `/`,
//! whatever the host platform.

/// Canonical key separator.
pub const SEPARATOR: char = '/';

/// Normalize a key: collapse runs of `/`, drop any leading `/`.
///
/// A trailing `/` is kept so directory-marker objects (`"logs/"`) stay
/// markers after replication.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for segment in key.split(SEPARATOR).filter(|s| !s.is_empty()) {
        if !out.is_empty() {
            out.push(SEPARATOR);
        }
        out.push_str(segment);
    }
    if key.ends_with(SEPARATOR) && !out.is_empty() {
        out.push(SEPARATOR);
    }
    out
}

/// Returns true when `normalize_key(key) == key`.
pub fn is_canonical(key: &str) -> bool {
    normalize_key(key) == key
}

/// Derive the destination key for `source_key` under `destination_prefix`.
///
/// An empty prefix (or one made only of separators) maps the key onto its
/// normalized self; it never introduces a leading `/`.
///
/// ```
/// use bucketsync_core::key::map_destination_key;
///
/// assert_eq!(map_destination_key("a/b.txt", "backup"), "backup/a/b.txt");
/// assert_eq!(map_destination_key("a/b.txt", "backup/"), "backup/a/b.txt");
/// assert_eq!(map_destination_key("a/b.txt", ""), "a/b.txt");
/// ```
pub fn map_destination_key(source_key: &str, destination_prefix: &str) -> String {
    let prefix = normalize_key(destination_prefix);
    let prefix = prefix.trim_end_matches(SEPARATOR);
    if prefix.is_empty() {
        return normalize_key(source_key);
    }

    let mut joined = String::with_capacity(prefix.len() + 1 + source_key.len());
    joined.push_str(prefix);
    joined.push(SEPARATOR);
    joined.push_str(source_key);
    normalize_key(&joined)
}
