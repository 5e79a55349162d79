//! Logical path normalization for the proxy namespace.
//!
//! Every path a client hands us is interpreted relative to a single root (the
//! cache directory on the proxy, the store root on the origin). Normalization
//! is purely lexical: `.` components are dropped, `..` components cancel the
//! preceding component, and a leading `/` is stripped so that absolute paths
//! address the same namespace as relative ones. A path whose `..` components
//! would climb above the root is rejected outright.

use std::path::{Component, Path};

use thiserror::Error;

/// A path tried to escape the proxy root.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("path escapes the root directory")]
pub struct PathEscape;

impl From<&PathEscape> for i32 {
    fn from(_: &PathEscape) -> Self {
        -libc::EPERM
    }
}

/// Lexically normalize `raw` into a root-relative path.
///
/// Returns the normalized path with `/`-separated components, or
/// [`PathEscape`] if the path climbs above the root. The empty string is a
/// valid result (the root itself) and is left for the caller to reject.
pub fn normalize(raw: &str) -> Result<String, PathEscape> {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => {
                // Non-UTF-8 components cannot appear: `raw` is a &str.
                parts.push(part.to_str().unwrap_or_default());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathEscape);
                }
            }
            // Absolute paths address the same namespace as relative ones.
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_relative_path_is_unchanged() {
        assert_eq!(normalize("dir/file.txt"), Ok("dir/file.txt".to_owned()));
    }

    #[test]
    fn current_dir_components_are_dropped() {
        assert_eq!(normalize("./a/./b"), Ok("a/b".to_owned()));
    }

    #[test]
    fn interior_parent_components_cancel() {
        assert_eq!(normalize("a/b/../c"), Ok("a/c".to_owned()));
    }

    #[test]
    fn leading_parent_component_is_rejected() {
        assert_eq!(normalize("../etc/passwd"), Err(PathEscape));
    }

    #[test]
    fn deep_escape_is_rejected() {
        assert_eq!(normalize("a/../../etc"), Err(PathEscape));
    }

    #[test]
    fn absolute_path_is_reanchored_at_root() {
        assert_eq!(normalize("/etc/passwd"), Ok("etc/passwd".to_owned()));
    }

    #[test]
    fn empty_path_normalizes_to_empty() {
        assert_eq!(normalize(""), Ok(String::new()));
        assert_eq!(normalize("a/.."), Ok(String::new()));
    }
}
