//! Traversal-safe path resolution.
//!
//! Everything here is pure string and path manipulation; the filesystem is
//! never consulted.

use std::path::{Path, PathBuf};

/// A request path that would leave its root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEscape;

/// Collapses `.` and `..` segments and empty segments.
///
/// Returns `Err(PathEscape)` when a `..` would climb above the start.
///
/// # Example
///
/// ```
/// # use webserv::router::path::normalize;
/// assert_eq!(normalize("a/./b/../c").unwrap(), vec!["a", "c"]);
/// assert!(normalize("a/../../etc").is_err());
/// ```
pub fn normalize(relative: &str) -> Result<Vec<&str>, PathEscape> {
    let mut segments = Vec::new();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop().ok_or(PathEscape)?;
            }
            other => segments.push(other),
        }
    }
    Ok(segments)
}

/// Joins the normalized `relative` path onto `root`.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf, PathEscape> {
    let mut path = root.to_path_buf();
    for segment in normalize(relative)? {
        if segment.contains('\0') {
            return Err(PathEscape);
        }
        path.push(segment);
    }
    Ok(path)
}

/// True when `path` equals `prefix` or continues it at a `/` boundary.
pub fn has_segment_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_stays_under_root() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve(root, "a/b.txt").unwrap(), PathBuf::from("/srv/www/a/b.txt"));
        assert_eq!(resolve(root, "").unwrap(), PathBuf::from("/srv/www"));
        assert_eq!(resolve(root, "a/../b").unwrap(), PathBuf::from("/srv/www/b"));
        assert_eq!(resolve(root, "//a//./b/").unwrap(), PathBuf::from("/srv/www/a/b"));
    }

    #[test]
    fn resolve_rejects_escape() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve(root, "../etc/passwd"), Err(PathEscape));
        assert_eq!(resolve(root, "a/../../etc/passwd"), Err(PathEscape));
    }

    #[test]
    fn segment_prefix() {
        assert!(has_segment_prefix("/images/a.png", "/images"));
        assert!(has_segment_prefix("/images", "/images"));
        assert!(!has_segment_prefix("/imagesx/a.png", "/images"));
        assert!(has_segment_prefix("/anything", "/"));
    }
}
