//! Path handling
//!
//! Paths are plain strings, normalized once at the dispatcher and used as
//! opaque map keys below it. A normalized path has no leading or trailing
//! `/`, no empty segments, and the empty string names the root directory.
//! The parent relationship is computed from the string on demand; there is
//! no parent-pointer graph to keep consistent.
//!
//! All comparisons are byte-wise; case is significant.

/// Normalize a path
///
/// Strips leading and trailing slashes and collapses runs of slashes down
/// to one. Idempotent: `clean_path(clean_path(p)) == clean_path(p)`.
pub fn clean_path(path: &str) -> String {
    let mut cleaned = String::with_capacity(path.len());
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !cleaned.is_empty() {
            cleaned.push('/');
        }
        cleaned.push_str(segment);
    }
    cleaned
}

/// Split a path into its segments
///
/// The path is cleaned first, so there are never empty segments. The root
/// splits into no segments at all.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// The directory containing `path`
///
/// The longest prefix of the cleaned path up to the last `/`, or the empty
/// string (the root) when no `/` remains.
pub fn parent_path(path: &str) -> String {
    let cleaned = clean_path(path);
    match cleaned.rfind('/') {
        Some(index) => cleaned[..index].to_string(),
        None => String::new(),
    }
}

/// Is `path` an immediate child of `directory`?
///
/// True only for entries directly inside the directory, not for entries of
/// its subdirectories. The root (empty path) matches exactly the top-level
/// entries.
pub fn is_in_directory(directory: &str, path: &str) -> bool {
    match relative_path(directory, path) {
        Some(relative) => !relative.contains('/'),
        None => false,
    }
}

/// `path` relative to `directory`
///
/// The cleaned path minus the cleaned directory prefix and one separator.
/// `None` when the path does not lie under the directory (or is the
/// directory itself). The remainder may still contain separators; pair
/// with [`is_in_directory`] to restrict to immediate children.
pub fn relative_path(directory: &str, path: &str) -> Option<String> {
    let directory = clean_path(directory);
    let path = clean_path(path);
    if directory.is_empty() {
        if path.is_empty() {
            return None;
        }
        return Some(path);
    }
    if path.len() <= directory.len() || !path.starts_with(&directory) {
        return None;
    }
    if path.as_bytes()[directory.len()] != b'/' {
        return None;
    }
    Some(path[directory.len() + 1..].to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clean_strips_and_collapses() {
        assert_eq!(clean_path(""), "");
        assert_eq!(clean_path("/"), "");
        assert_eq!(clean_path("///"), "");
        assert_eq!(clean_path("/a"), "a");
        assert_eq!(clean_path("a/"), "a");
        assert_eq!(clean_path("/a/b/c/"), "a/b/c");
        assert_eq!(clean_path("a//b///c"), "a/b/c");
    }

    #[test]
    fn clean_is_idempotent() {
        for p in &["", "/", "a", "/a/b//c/", "//x"] {
            let once = clean_path(p);
            assert_eq!(clean_path(&once), once, "clean_path must be idempotent");
        }
    }

    #[test]
    fn split_has_no_empty_segments() {
        assert_eq!(split_path("/a//b/c/"), vec!["a", "b", "c"]);
        assert!(split_path("").is_empty());
        assert!(split_path("///").is_empty());
    }

    #[test]
    fn parent_of_top_level_is_root() {
        assert_eq!(parent_path("a"), "");
        assert_eq!(parent_path("/a/"), "");
        assert_eq!(parent_path("a/b"), "a");
        assert_eq!(parent_path("a/b/c"), "a/b");
        assert_eq!(parent_path(""), "");
    }

    #[test]
    fn direct_children_only() {
        assert!(is_in_directory("", "a"));
        assert!(!is_in_directory("", "a/b"));
        assert!(is_in_directory("a", "a/b"));
        assert!(!is_in_directory("a", "a/b/c"));
        assert!(!is_in_directory("a", "ab"));
        assert!(!is_in_directory("a", "a"));
        assert!(is_in_directory("/a/", "a/b"), "inputs are cleaned first");
    }

    #[test]
    fn relative_strips_prefix_and_separator() {
        assert_eq!(relative_path("a", "a/b"), Some("b".to_string()));
        assert_eq!(relative_path("a", "a/b/c"), Some("b/c".to_string()));
        assert_eq!(relative_path("", "a"), Some("a".to_string()));
        assert_eq!(relative_path("a", "a"), None);
        assert_eq!(relative_path("a", "ab/c"), None);
        assert_eq!(relative_path("a/b", "a"), None);
    }
}
