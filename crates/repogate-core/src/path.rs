//! Lease path parsing and the segment-aware prefix rule.
//!
//! A lease path has the form `<repository>/<subpath>` where the repository
//! is a DNS-style fully qualified name (it must contain at least one dot)
//! and the subpath is normalized to a single leading `/` and no trailing `/`
//! (the root subpath stays `/`). This module is the only place where the
//! prefix relation between subpaths is defined; every other component must
//! call [`is_path_prefix`] instead of reimplementing it.

use thiserror::Error;

/// Errors from lease path parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    /// The lease path does not split into `(repository, subpath)`.
    #[error("malformed lease path: {path}")]
    Malformed {
        /// The path that failed to parse.
        path: String,
    },
}

/// Splits a lease path into `(repository, subpath)`.
///
/// The repository is everything up to the first `/` and must be a DNS-style
/// name containing at least one dot. The rest becomes the subpath,
/// normalized to a single leading `/` with no trailing `/`:
///
/// ```rust
/// use repogate_core::path::split_lease_path;
///
/// let (repo, sub) = split_lease_path("test.repo.org/path/one").unwrap();
/// assert_eq!((repo.as_str(), sub.as_str()), ("test.repo.org", "/path/one"));
///
/// // A bare trailing slash is the repository root.
/// let (_, sub) = split_lease_path("test.repo.org/").unwrap();
/// assert_eq!(sub, "/");
/// ```
///
/// # Errors
///
/// Returns [`PathError::Malformed`] if the path has no `/` separator or the
/// repository part is not a dotted name.
pub fn split_lease_path(lease_path: &str) -> Result<(String, String), PathError> {
    let malformed = || PathError::Malformed {
        path: lease_path.to_string(),
    };

    let (repo, rest) = lease_path.split_once('/').ok_or_else(malformed)?;
    if repo.is_empty() || !repo.contains('.') {
        return Err(malformed());
    }

    let trimmed = rest.trim_matches('/');
    let subpath = if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    };

    Ok((repo.to_string(), subpath))
}

/// Returns true iff `prefix` is a segment-aware path prefix of `path`.
///
/// `a` is a prefix of `b` iff `a == b` or `b` begins with `a + "/"`. The
/// repository root `/` is a prefix of every subpath. Note that `/a/b` is a
/// prefix of `/a/b/c` but not of `/a/bc`; the comparison never splits a
/// path segment.
#[must_use]
pub fn is_path_prefix(prefix: &str, path: &str) -> bool {
    if prefix == path {
        return true;
    }
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}
