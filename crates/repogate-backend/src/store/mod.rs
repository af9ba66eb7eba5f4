//! Persistent lease storage.
//!
//! The store presents one logical map `lease path -> Lease` behind the
//! [`LeaseStore`] trait. Two interchangeable backends exist, selected by
//! configuration at construction time:
//!
//! - [`EmbeddedLeaseStore`]: a single-instance gateway persists leases in a
//!   local SQLite database with write-ahead journaling.
//! - [`EtcdLeaseStore`]: multiple gateway instances share an etcd cluster
//!   and delegate all coordination to its transaction primitives.
//!
//! # Conflict detection
//!
//! `new_lease` must be atomic: within one atomic section it enumerates the
//! existing leases of the target repository, rejects the insert with
//! [`StoreError::PathBusy`] when any non-expired lease's subpath equals,
//! prefixes, or extends the requested subpath, garbage-collects expired
//! entries it encountered, and inserts the new record. Repository names are
//! a hard boundary: leases in different repositories never conflict.
//!
//! Expiration is lazy. No background task reaps expired leases; they are
//! removed opportunistically during conflict checks and explicit
//! cancellation, and [`LeaseStore::get_leases`] may therefore still return
//! them. Higher layers filter by token validity.

mod embedded;
mod etcd;

pub use embedded::EmbeddedLeaseStore;
pub use etcd::EtcdLeaseStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repogate_core::path::is_path_prefix;
use repogate_core::token::LeaseToken;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::GatewayConfig;

/// Errors from the lease store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested path overlaps an active lease. Carries the path of
    /// the conflicting lease; this is a normal outcome, not a server
    /// error.
    #[error("path busy: conflicting lease on {existing}")]
    PathBusy {
        /// The lease path of the existing, conflicting lease.
        existing: String,
    },

    /// No lease matched the given path or token.
    #[error("lease not found")]
    NotFound,

    /// The backing store failed or is unreachable. May be retried.
    #[error("lease store unavailable: {0}")]
    Unavailable(String),

    /// Unexpected internal failure.
    #[error("internal lease store error: {0}")]
    Internal(String),
}

/// A persisted lease record. The lease path is the store key and lives
/// outside the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// The identity the lease was issued to.
    pub key_id: String,
    /// The token representing the lease, including its server-side secret.
    pub token: LeaseToken,
}

impl Lease {
    /// Whether the lease's token expiration has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.token.expiration <= now
    }
}

/// The lease store contract shared by all backends.
///
/// Every operation is atomic with respect to concurrent callers. Writers
/// for the same repository are serialized against each other; readers
/// observe a consistent snapshot. Both cancel operations return
/// [`StoreError::NotFound`] when nothing matched - cancelling twice is
/// harmless and leaves the store unchanged.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Inserts a lease for `lease_path` iff no conflicting lease exists.
    ///
    /// Expired leases of the same repository that the conflict scan
    /// encounters are deleted within the same atomic section, so an
    /// expired lease on the exact same path never blocks the insert.
    ///
    /// # Errors
    ///
    /// [`StoreError::PathBusy`] when a non-expired lease overlaps the
    /// requested path; the store is left unmodified in that case.
    async fn new_lease(
        &self,
        key_id: &str,
        lease_path: &str,
        token: LeaseToken,
    ) -> Result<(), StoreError>;

    /// Returns a snapshot of all leases, keyed by lease path. May include
    /// expired entries; callers filter by token validity.
    async fn get_leases(&self) -> Result<HashMap<String, Lease>, StoreError>;

    /// Exact lookup by lease path.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no lease exists at `lease_path`.
    async fn get_lease_for_path(&self, lease_path: &str) -> Result<Lease, StoreError>;

    /// Finds the lease whose token string equals `token_str`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no lease carries the token.
    async fn get_lease_for_token(&self, token_str: &str) -> Result<(String, Lease), StoreError>;

    /// Deletes the lease at `lease_path`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no lease exists at `lease_path`.
    async fn cancel_lease_for_path(&self, lease_path: &str) -> Result<(), StoreError>;

    /// Deletes the lease whose token string equals `token_str`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no lease carries the token.
    async fn cancel_lease_for_token(&self, token_str: &str) -> Result<(), StoreError>;

    /// Deletes all leases.
    async fn cancel_leases(&self) -> Result<(), StoreError>;

    /// Flushes and releases backend resources. Idempotent.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Opens the lease store selected by `config`.
///
/// # Errors
///
/// Propagates backend construction failures as [`StoreError`].
pub async fn open_lease_store(config: &GatewayConfig) -> Result<Box<dyn LeaseStore>, StoreError> {
    if config.use_etcd {
        let store = EtcdLeaseStore::connect(&config.etcd_endpoints).await?;
        Ok(Box::new(store))
    } else {
        let store = EmbeddedLeaseStore::open(&config.data_dir)?;
        Ok(Box::new(store))
    }
}

/// One existing same-repository lease observed during a `new_lease`
/// conflict scan.
pub(crate) struct ScannedLease<'a> {
    /// Full lease path (store key).
    pub lease_path: &'a str,
    /// The lease's subpath within the repository.
    pub subpath: &'a str,
    /// Whether the lease's expiration has passed.
    pub expired: bool,
}

/// Applies the conflict rule to the scanned same-repository leases.
///
/// Returns the lease paths of expired entries to garbage-collect, or
/// [`StoreError::PathBusy`] naming the first non-expired lease whose
/// subpath equals, prefixes, or extends `new_subpath`. When a conflict is
/// found nothing must be deleted; callers only apply the garbage-collect
/// list on success.
pub(crate) fn check_conflicts<'a>(
    new_subpath: &str,
    scanned: impl IntoIterator<Item = ScannedLease<'a>>,
) -> Result<Vec<String>, StoreError> {
    let mut expired = Vec::new();
    for lease in scanned {
        if lease.expired {
            expired.push(lease.lease_path.to_string());
            continue;
        }
        if is_path_prefix(lease.subpath, new_subpath) || is_path_prefix(new_subpath, lease.subpath)
        {
            return Err(StoreError::PathBusy {
                existing: lease.lease_path.to_string(),
            });
        }
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanned(entries: &[(&'static str, &'static str, bool)]) -> Vec<ScannedLease<'static>> {
        entries
            .iter()
            .map(|&(lease_path, subpath, expired)| ScannedLease {
                lease_path,
                subpath,
                expired,
            })
            .collect()
    }

    #[test]
    fn test_no_existing_leases_is_free() {
        let gc = check_conflicts("/path/one", scanned(&[])).unwrap();
        assert!(gc.is_empty());
    }

    #[test]
    fn test_equal_subpath_conflicts() {
        let err = check_conflicts(
            "/path/one",
            scanned(&[("test.repo.org/path/one", "/path/one", false)]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StoreError::PathBusy { existing } if existing == "test.repo.org/path/one"
        ));
    }

    #[test]
    fn test_parent_and_child_conflict() {
        // Existing child blocks a parent request.
        assert!(check_conflicts(
            "/path",
            scanned(&[("test.repo.org/path/one", "/path/one", false)]),
        )
        .is_err());

        // Existing parent blocks a child request.
        assert!(check_conflicts(
            "/path/one/below",
            scanned(&[("test.repo.org/path/one", "/path/one", false)]),
        )
        .is_err());
    }

    #[test]
    fn test_sibling_does_not_conflict() {
        let gc = check_conflicts(
            "/path/two",
            scanned(&[("test.repo.org/path/one", "/path/one", false)]),
        )
        .unwrap();
        assert!(gc.is_empty());
    }

    #[test]
    fn test_expired_leases_are_collected_not_conflicting() {
        let gc = check_conflicts(
            "/path/one",
            scanned(&[
                ("test.repo.org/path/one", "/path/one", true),
                ("test.repo.org/unrelated", "/unrelated", true),
                ("test.repo.org/other", "/other", false),
            ]),
        )
        .unwrap();
        assert_eq!(
            gc,
            vec![
                "test.repo.org/path/one".to_string(),
                "test.repo.org/unrelated".to_string()
            ]
        );
    }

    #[test]
    fn test_conflict_reported_before_gc_applies() {
        // A conflict must win even when expired entries were seen first.
        let err = check_conflicts(
            "/path/one",
            scanned(&[
                ("test.repo.org/stale", "/stale", true),
                ("test.repo.org/path", "/path", false),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::PathBusy { .. }));
    }
}
