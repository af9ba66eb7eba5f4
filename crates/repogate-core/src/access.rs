//! Repository access registry.
//!
//! Maps client key IDs to the single subpath prefix each key may write
//! under, per repository. The registry is loaded once at gateway startup
//! and is immutable for the lifetime of the process, so it can be shared
//! freely between request handlers without synchronization.
//!
//! The configuration file is JSON:
//!
//! ```json
//! {
//!   "repos": [
//!     {
//!       "name": "test.repo.org",
//!       "keys": [
//!         { "id": "key1", "path": "/" },
//!         { "id": "key2", "path": "/restricted/to/subdir" }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::path::is_path_prefix;

/// Key ID to allowed-subpath-prefix mapping for one repository.
pub type KeyPaths = HashMap<String, String>;

/// Errors from authorization checks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// The repository is not present in the access configuration.
    #[error("unknown repository: {repo}")]
    UnknownRepo {
        /// The repository that was requested.
        repo: String,
    },

    /// The key is not registered for the repository.
    #[error("key {key_id} is not registered for repository {repo}")]
    UnauthorizedKey {
        /// The requesting key.
        key_id: String,
        /// The repository the key is not registered for.
        repo: String,
    },

    /// The key is registered, but the requested subpath falls outside its
    /// allowed prefix.
    #[error("key {key_id} may not write under {sub_path}")]
    SubpathOutsideAllowed {
        /// The requesting key.
        key_id: String,
        /// The subpath that was requested.
        sub_path: String,
    },
}

/// Errors from loading the access configuration file.
#[derive(Debug, Error)]
pub enum AccessConfigError {
    /// The file could not be read.
    #[error("could not read access configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON of the expected shape.
    #[error("could not parse access configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A repository appears more than once.
    #[error("duplicate repository in access configuration: {repo}")]
    DuplicateRepo {
        /// The repeated repository name.
        repo: String,
    },

    /// A key's allowed path does not start with `/`.
    #[error("allowed path for key {key_id} in repository {repo} must start with '/'")]
    InvalidAllowedPath {
        /// The offending key.
        key_id: String,
        /// The repository it belongs to.
        repo: String,
    },
}

#[derive(Debug, Deserialize)]
struct AccessFile {
    repos: Vec<RepoSpec>,
}

#[derive(Debug, Deserialize)]
struct RepoSpec {
    name: String,
    keys: Vec<KeySpec>,
}

#[derive(Debug, Deserialize)]
struct KeySpec {
    id: String,
    path: String,
}

/// The loaded repository access registry.
#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    repos: HashMap<String, KeyPaths>,
}

impl AccessConfig {
    /// Loads the registry from a JSON configuration file.
    ///
    /// Allowed paths are normalized the same way lease subpaths are: a
    /// single leading `/`, no trailing `/` (the root stays `/`).
    ///
    /// # Errors
    ///
    /// Returns [`AccessConfigError`] if the file cannot be read or parsed,
    /// a repository is listed twice, or an allowed path is not absolute.
    pub fn load(path: &Path) -> Result<Self, AccessConfigError> {
        let data = std::fs::read_to_string(path)?;
        let file: AccessFile = serde_json::from_str(&data)?;

        let mut repos: HashMap<String, KeyPaths> = HashMap::new();
        for repo in file.repos {
            if repos.contains_key(&repo.name) {
                return Err(AccessConfigError::DuplicateRepo { repo: repo.name });
            }
            let mut keys = KeyPaths::new();
            for key in repo.keys {
                if !key.path.starts_with('/') {
                    return Err(AccessConfigError::InvalidAllowedPath {
                        key_id: key.id,
                        repo: repo.name,
                    });
                }
                let trimmed = key.path.trim_matches('/');
                let normalized = if trimmed.is_empty() {
                    "/".to_string()
                } else {
                    format!("/{trimmed}")
                };
                keys.insert(key.id, normalized);
            }
            repos.insert(repo.name, keys);
        }

        debug!(repos = repos.len(), "access configuration loaded");
        Ok(Self { repos })
    }

    /// Builds a registry from an already-parsed mapping. Intended for
    /// frontends that manage configuration themselves, and for tests.
    #[must_use]
    pub fn from_repos(repos: HashMap<String, KeyPaths>) -> Self {
        Self { repos }
    }

    /// Checks whether `key_id` may take a lease on `sub_path` of
    /// `repo_name`.
    ///
    /// Succeeds iff the repository is known, the key is registered under
    /// it, and the key's allowed prefix is a segment-aware path prefix of
    /// `sub_path`.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::UnknownRepo`], [`AccessError::UnauthorizedKey`]
    /// or [`AccessError::SubpathOutsideAllowed`].
    pub fn check(&self, key_id: &str, sub_path: &str, repo_name: &str) -> Result<(), AccessError> {
        let keys = self.repos.get(repo_name).ok_or_else(|| AccessError::UnknownRepo {
            repo: repo_name.to_string(),
        })?;

        let allowed = keys.get(key_id).ok_or_else(|| AccessError::UnauthorizedKey {
            key_id: key_id.to_string(),
            repo: repo_name.to_string(),
        })?;

        if !is_path_prefix(allowed, sub_path) {
            return Err(AccessError::SubpathOutsideAllowed {
                key_id: key_id.to_string(),
                sub_path: sub_path.to_string(),
            });
        }

        Ok(())
    }

    /// Returns the key mapping for one repository, if known.
    #[must_use]
    pub fn get_repo(&self, repo_name: &str) -> Option<&KeyPaths> {
        self.repos.get(repo_name)
    }

    /// Returns the full repository mapping for read-only introspection.
    #[must_use]
    pub fn repos(&self) -> &HashMap<String, KeyPaths> {
        &self.repos
    }
}
