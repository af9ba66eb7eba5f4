//! Replicated lease store backed by etcd.
//!
//! Every gateway instance talks to the same etcd cluster; multi-instance
//! coordination is delegated entirely to etcd's transaction primitives.
//! Keys are `lease/<leasePath>` and values are JSON lease records.
//!
//! `new_lease` follows a software-transactional-memory pattern: it reads
//! the repository's whole key range, runs the conflict check client-side,
//! and commits a transaction that only succeeds if none of the keys it
//! examined changed in the meantime (mod-revision compares, plus a
//! create-revision guard on the key being inserted). On contention the
//! operation retries with a fresh read, up to a bounded attempt count.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use etcd_client::{Client, Compare, CompareOp, DeleteOptions, GetOptions, Txn, TxnOp};
use repogate_core::path::split_lease_path;
use repogate_core::token::LeaseToken;
use tracing::{debug, warn};

use super::{check_conflicts, Lease, LeaseStore, ScannedLease, StoreError};

/// Key prefix shared by all lease records.
const KEY_PREFIX: &str = "lease/";

/// Attempts before a contended transaction gives up.
const MAX_TXN_ATTEMPTS: usize = 8;

/// Lease store persisting to a replicated etcd cluster.
pub struct EtcdLeaseStore {
    client: Client,
}

/// A same-repository lease record read during the conflict scan, together
/// with the etcd revision that guards it.
struct ReadLease {
    lease_path: String,
    subpath: String,
    expired: bool,
    mod_revision: i64,
}

impl EtcdLeaseStore {
    /// Connects to the etcd cluster at `endpoints`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if no endpoint can be reached.
    pub async fn connect(endpoints: &[String]) -> Result<Self, StoreError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(unavailable)?;
        debug!(endpoints = ?endpoints, "etcd lease store connected");
        Ok(Self { client })
    }

    fn lease_key(lease_path: &str) -> String {
        format!("{KEY_PREFIX}{lease_path}")
    }

    /// Reads all lease records of one repository along with their guard
    /// revisions.
    async fn read_repository(
        client: &mut Client,
        repository: &str,
    ) -> Result<Vec<ReadLease>, StoreError> {
        let prefix = format!("{KEY_PREFIX}{repository}/");
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let now = Utc::now();
        let mut leases = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(corrupt)?;
            let Some(lease_path) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            let (_, subpath) =
                split_lease_path(lease_path).map_err(|e| StoreError::Internal(e.to_string()))?;
            let lease: Lease = serde_json::from_slice(kv.value()).map_err(corrupt)?;
            leases.push(ReadLease {
                lease_path: lease_path.to_string(),
                subpath,
                expired: lease.is_expired(now),
                mod_revision: kv.mod_revision(),
            });
        }
        Ok(leases)
    }

    /// Scans all lease records for one whose token string matches.
    async fn find_by_token(
        client: &mut Client,
        token_str: &str,
    ) -> Result<Option<(String, Lease, i64)>, StoreError> {
        let resp = client
            .get(KEY_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        for kv in resp.kvs() {
            let lease: Lease = serde_json::from_slice(kv.value()).map_err(corrupt)?;
            if lease.token.token_str == token_str {
                let key = kv.key_str().map_err(corrupt)?;
                let lease_path = key
                    .strip_prefix(KEY_PREFIX)
                    .unwrap_or(key)
                    .to_string();
                return Ok(Some((lease_path, lease, kv.mod_revision())));
            }
        }
        Ok(None)
    }
}

fn unavailable(e: etcd_client::Error) -> StoreError {
    warn!(error = %e, "etcd lease store failure");
    StoreError::Unavailable(e.to_string())
}

fn corrupt<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Internal(format!("corrupt lease record: {e}"))
}

#[async_trait]
impl LeaseStore for EtcdLeaseStore {
    async fn new_lease(
        &self,
        key_id: &str,
        lease_path: &str,
        token: LeaseToken,
    ) -> Result<(), StoreError> {
        let (repository, subpath) =
            split_lease_path(lease_path).map_err(|e| StoreError::Internal(e.to_string()))?;
        let new_key = Self::lease_key(lease_path);

        let record = Lease {
            key_id: key_id.to_string(),
            token,
        };
        let value = serde_json::to_vec(&record)
            .map_err(|e| StoreError::Internal(format!("could not encode lease record: {e}")))?;

        let mut client = self.client.clone();
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let read = Self::read_repository(&mut client, &repository).await?;

            let scanned = read.iter().map(|lease| ScannedLease {
                lease_path: &lease.lease_path,
                subpath: &lease.subpath,
                expired: lease.expired,
            });
            let expired = check_conflicts(&subpath, scanned)?;

            // Guard every key the scan examined: if any of them changed
            // since the read, the transaction fails and we retry.
            let mut compares: Vec<Compare> = read
                .iter()
                .map(|lease| {
                    Compare::mod_revision(
                        Self::lease_key(&lease.lease_path),
                        CompareOp::Equal,
                        lease.mod_revision,
                    )
                })
                .collect();
            if !read.iter().any(|lease| lease.lease_path == lease_path) {
                // The key must still be absent at commit time.
                compares.push(Compare::create_revision(
                    new_key.clone(),
                    CompareOp::Equal,
                    0,
                ));
            }

            // etcd rejects duplicate keys within one transaction, so the
            // put stands in for deleting an expired record at the same
            // path.
            let mut ops: Vec<TxnOp> = expired
                .iter()
                .filter(|stale| stale.as_str() != lease_path)
                .map(|stale| TxnOp::delete(Self::lease_key(stale), None))
                .collect();
            ops.push(TxnOp::put(new_key.clone(), value.clone(), None));

            let resp = client
                .txn(Txn::new().when(compares).and_then(ops))
                .await
                .map_err(unavailable)?;
            if resp.succeeded() {
                debug!(path = %lease_path, key_id, "lease inserted");
                return Ok(());
            }
            debug!(path = %lease_path, attempt, "lease transaction contended; retrying");
        }

        warn!(path = %lease_path, "lease transaction kept contending");
        Err(StoreError::Unavailable(
            "etcd transaction contention".to_string(),
        ))
    }

    async fn get_leases(&self) -> Result<HashMap<String, Lease>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(KEY_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let mut leases = HashMap::new();
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(corrupt)?;
            let Some(lease_path) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            let lease: Lease = serde_json::from_slice(kv.value()).map_err(corrupt)?;
            leases.insert(lease_path.to_string(), lease);
        }
        Ok(leases)
    }

    async fn get_lease_for_path(&self, lease_path: &str) -> Result<Lease, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(Self::lease_key(lease_path), None)
            .await
            .map_err(unavailable)?;

        match resp.kvs().first() {
            Some(kv) => serde_json::from_slice(kv.value()).map_err(corrupt),
            None => Err(StoreError::NotFound),
        }
    }

    async fn get_lease_for_token(&self, token_str: &str) -> Result<(String, Lease), StoreError> {
        let mut client = self.client.clone();
        match Self::find_by_token(&mut client, token_str).await? {
            Some((lease_path, lease, _)) => Ok((lease_path, lease)),
            None => Err(StoreError::NotFound),
        }
    }

    async fn cancel_lease_for_path(&self, lease_path: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .delete(Self::lease_key(lease_path), None)
            .await
            .map_err(unavailable)?;
        if resp.deleted() == 0 {
            return Err(StoreError::NotFound);
        }
        debug!(path = %lease_path, "lease cancelled");
        Ok(())
    }

    async fn cancel_lease_for_token(&self, token_str: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        for _attempt in 1..=MAX_TXN_ATTEMPTS {
            let Some((lease_path, _, mod_revision)) =
                Self::find_by_token(&mut client, token_str).await?
            else {
                return Err(StoreError::NotFound);
            };

            // Delete only if the record is still the one we matched;
            // otherwise re-scan.
            let key = Self::lease_key(&lease_path);
            let txn = Txn::new()
                .when(vec![Compare::mod_revision(
                    key.clone(),
                    CompareOp::Equal,
                    mod_revision,
                )])
                .and_then(vec![TxnOp::delete(key, None)]);
            let resp = client.txn(txn).await.map_err(unavailable)?;
            if resp.succeeded() {
                return Ok(());
            }
        }
        Err(StoreError::Unavailable(
            "etcd transaction contention".to_string(),
        ))
    }

    async fn cancel_leases(&self) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client
            .delete(KEY_PREFIX, Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        // Dropping the client tears down its channels; nothing to flush.
        Ok(())
    }
}
