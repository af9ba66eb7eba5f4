//! Embedded lease store backed by `SQLite`.
//!
//! The database lives in a single file under the gateway data directory.
//! Write-ahead journaling with `synchronous = FULL` makes a committed
//! `new_lease` durable before the call returns, and reopening the database
//! after a restart recovers every record.
//!
//! The conflict check and insert for `new_lease` run inside one IMMEDIATE
//! transaction. Together with the connection mutex this serializes all
//! writers, which is sufficient for a single-instance gateway; expired
//! leases found during the scan are deleted in the same transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repogate_core::path::split_lease_path;
use repogate_core::token::{LeaseToken, TokenSecret};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use super::{check_conflicts, Lease, LeaseStore, ScannedLease, StoreError};

/// Database filename inside the gateway data directory.
const DB_FILENAME: &str = "leases.db";

/// Lease store persisting to a local `SQLite` database.
pub struct EmbeddedLeaseStore {
    conn: Arc<Mutex<Connection>>,
}

impl EmbeddedLeaseStore {
    /// Opens (or creates) the lease database under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the directory or database
    /// cannot be opened.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| StoreError::Unavailable(format!("could not create data dir: {e}")))?;

        let conn = Connection::open(data_dir.join(DB_FILENAME)).map_err(unavailable)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(unavailable)?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(unavailable)?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(unavailable)?;
        Self::init_schema(&conn).map_err(unavailable)?;

        debug!(path = %data_dir.display(), "embedded lease store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Initializes the database schema.
    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS leases (
                lease_path TEXT PRIMARY KEY,
                repository TEXT NOT NULL,
                subpath TEXT NOT NULL,
                key_id TEXT NOT NULL,
                token_str TEXT NOT NULL,
                secret BLOB NOT NULL,
                expiration TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_leases_repository ON leases(repository)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_leases_token ON leases(token_str)",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Internal("connection lock poisoned".to_string()))
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    warn!(error = %e, "embedded lease store failure");
    StoreError::Unavailable(e.to_string())
}

/// Reconstructs a [`Lease`] from one row of the `leases` table:
/// `(key_id, token_str, secret, expiration)`.
fn lease_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lease> {
    let key_id: String = row.get(0)?;
    let token_str: String = row.get(1)?;
    let secret: Vec<u8> = row.get(2)?;
    let expiration: String = row.get(3)?;

    let expiration = DateTime::parse_from_rfc3339(&expiration)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?
        .with_timezone(&Utc);

    Ok(Lease {
        key_id,
        token: LeaseToken {
            token_str,
            secret: TokenSecret::from_bytes(secret),
            expiration,
        },
    })
}

#[async_trait]
impl LeaseStore for EmbeddedLeaseStore {
    async fn new_lease(
        &self,
        key_id: &str,
        lease_path: &str,
        token: LeaseToken,
    ) -> Result<(), StoreError> {
        let (repository, subpath) =
            split_lease_path(lease_path).map_err(|e| StoreError::Internal(e.to_string()))?;
        let now = Utc::now();

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;

        let existing: Vec<(String, String, String)> = {
            let mut stmt = tx
                .prepare("SELECT lease_path, subpath, expiration FROM leases WHERE repository = ?1")
                .map_err(unavailable)?;
            let rows = stmt
                .query_map(params![repository], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(unavailable)?;
            rows.collect::<rusqlite::Result<_>>().map_err(unavailable)?
        };

        let scanned = existing.iter().map(|(path, sub, expiration)| ScannedLease {
            lease_path: path,
            subpath: sub,
            expired: DateTime::parse_from_rfc3339(expiration)
                .map_or(true, |e| e.with_timezone(&Utc) <= now),
        });
        let expired = check_conflicts(&subpath, scanned)?;

        for stale in &expired {
            tx.execute("DELETE FROM leases WHERE lease_path = ?1", params![stale])
                .map_err(unavailable)?;
        }
        if !expired.is_empty() {
            debug!(
                repository = %repository,
                count = expired.len(),
                "collected expired leases"
            );
        }

        tx.execute(
            "INSERT INTO leases (lease_path, repository, subpath, key_id, token_str, secret, expiration)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                lease_path,
                repository,
                subpath,
                key_id,
                token.token_str,
                token.secret.as_bytes(),
                token.expiration.to_rfc3339(),
            ],
        )
        .map_err(unavailable)?;

        tx.commit().map_err(unavailable)?;
        debug!(path = %lease_path, key_id, "lease inserted");
        Ok(())
    }

    async fn get_leases(&self) -> Result<HashMap<String, Lease>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT lease_path, key_id, token_str, secret, expiration FROM leases")
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], |row| {
                let path: String = row.get(0)?;
                let key_id: String = row.get(1)?;
                let token_str: String = row.get(2)?;
                let secret: Vec<u8> = row.get(3)?;
                let expiration: String = row.get(4)?;
                Ok((path, key_id, token_str, secret, expiration))
            })
            .map_err(unavailable)?;

        let mut leases = HashMap::new();
        for row in rows {
            let (path, key_id, token_str, secret, expiration) = row.map_err(unavailable)?;
            let expiration = DateTime::parse_from_rfc3339(&expiration)
                .map_err(|e| StoreError::Internal(format!("corrupt expiration column: {e}")))?
                .with_timezone(&Utc);
            leases.insert(
                path,
                Lease {
                    key_id,
                    token: LeaseToken {
                        token_str,
                        secret: TokenSecret::from_bytes(secret),
                        expiration,
                    },
                },
            );
        }
        Ok(leases)
    }

    async fn get_lease_for_path(&self, lease_path: &str) -> Result<Lease, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT key_id, token_str, secret, expiration FROM leases WHERE lease_path = ?1",
            params![lease_path],
            lease_from_row,
        )
        .optional()
        .map_err(unavailable)?
        .ok_or(StoreError::NotFound)
    }

    async fn get_lease_for_token(&self, token_str: &str) -> Result<(String, Lease), StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT lease_path, key_id, token_str, secret, expiration FROM leases WHERE token_str = ?1",
            params![token_str],
            |row| {
                let path: String = row.get(0)?;
                let key_id: String = row.get(1)?;
                let token_str: String = row.get(2)?;
                let secret: Vec<u8> = row.get(3)?;
                let expiration: String = row.get(4)?;
                Ok((path, key_id, token_str, secret, expiration))
            },
        )
        .optional()
        .map_err(unavailable)?
        .map(|(path, key_id, token_str, secret, expiration)| {
            let expiration = DateTime::parse_from_rfc3339(&expiration)
                .map_err(|e| StoreError::Internal(format!("corrupt expiration column: {e}")))?
                .with_timezone(&Utc);
            Ok((
                path,
                Lease {
                    key_id,
                    token: LeaseToken {
                        token_str,
                        secret: TokenSecret::from_bytes(secret),
                        expiration,
                    },
                },
            ))
        })
        .transpose()?
        .ok_or(StoreError::NotFound)
    }

    async fn cancel_lease_for_path(&self, lease_path: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM leases WHERE lease_path = ?1",
                params![lease_path],
            )
            .map_err(unavailable)?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        debug!(path = %lease_path, "lease cancelled");
        Ok(())
    }

    async fn cancel_lease_for_token(&self, token_str: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute("DELETE FROM leases WHERE token_str = ?1", params![token_str])
            .map_err(unavailable)?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn cancel_leases(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM leases", []).map_err(unavailable)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            warn!(error = %e, "wal checkpoint on close failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tempfile::TempDir;

    use super::*;

    fn max_lease_time() -> Duration {
        Duration::seconds(100)
    }

    fn open_store() -> (TempDir, EmbeddedLeaseStore) {
        let dir = TempDir::new().unwrap();
        let store = EmbeddedLeaseStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_open_creates_database() {
        let (dir, _store) = open_store();
        assert!(dir.path().join(DB_FILENAME).exists());
    }

    #[tokio::test]
    async fn test_crud_lifecycle() {
        let (_dir, store) = open_store();
        let path = "test.repo.org/path/one";
        let token = LeaseToken::new(path, max_lease_time()).unwrap();

        store.new_lease("key1", path, token.clone()).await.unwrap();

        let leases = store.get_leases().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert!(leases.contains_key(path));

        let lease = store.get_lease_for_path(path).await.unwrap();
        assert_eq!(lease.key_id, "key1");
        assert_eq!(lease.token.token_str, token.token_str);
        assert_eq!(lease.token.secret, token.secret);

        let (found_path, lease) = store.get_lease_for_token(&token.token_str).await.unwrap();
        assert_eq!(found_path, path);
        assert_eq!(lease.key_id, "key1");

        store.cancel_lease_for_path(path).await.unwrap();
        assert!(store.get_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_for_token() {
        let (_dir, store) = open_store();
        let path = "test.repo.org/path/three";
        let token = LeaseToken::new(path, max_lease_time()).unwrap();

        store.new_lease("key1", path, token.clone()).await.unwrap();
        store
            .cancel_lease_for_token(&token.token_str)
            .await
            .unwrap();
        assert!(store.get_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (_dir, store) = open_store();
        for sub in ["one", "two", "three"] {
            let path = format!("test.repo.org/path/{sub}");
            let token = LeaseToken::new(&path, max_lease_time()).unwrap();
            store.new_lease("key1", &path, token).await.unwrap();
        }

        store.cancel_leases().await.unwrap();
        assert!(store.get_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_missing_is_not_found() {
        let (_dir, store) = open_store();

        let err = store
            .cancel_lease_for_path("test.repo.org/none")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));

        let err = store.cancel_lease_for_token("no-such-token").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (_dir, store) = open_store();
        let path = "test.repo.org/path/one";
        let token = LeaseToken::new(path, max_lease_time()).unwrap();
        store.new_lease("key1", path, token).await.unwrap();

        store.cancel_lease_for_path(path).await.unwrap();
        let err = store.cancel_lease_for_path(path).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        assert!(store.get_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exact_path_conflict() {
        let (_dir, store) = open_store();
        let path = "test.repo.org/path/one";
        let first = LeaseToken::new(path, max_lease_time()).unwrap();
        store.new_lease("key1", path, first).await.unwrap();

        let second = LeaseToken::new(path, max_lease_time()).unwrap();
        let err = store.new_lease("key1", path, second).await.unwrap_err();
        assert!(matches!(err, StoreError::PathBusy { existing } if existing == path));

        // The failed insert must not have changed anything.
        assert_eq!(store.get_leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_parent_and_child_conflicts() {
        let (_dir, store) = open_store();
        let held = "test.repo.org/path/one";
        let token = LeaseToken::new(held, max_lease_time()).unwrap();
        store.new_lease("key1", held, token).await.unwrap();

        let parent = "test.repo.org/path";
        let token = LeaseToken::new(parent, max_lease_time()).unwrap();
        let err = store.new_lease("key1", parent, token).await.unwrap_err();
        assert!(matches!(err, StoreError::PathBusy { existing } if existing == held));

        let child = "test.repo.org/path/one/below";
        let token = LeaseToken::new(child, max_lease_time()).unwrap();
        let err = store.new_lease("key1", child, token).await.unwrap_err();
        assert!(matches!(err, StoreError::PathBusy { existing } if existing == held));
    }

    #[tokio::test]
    async fn test_sibling_coexists() {
        let (_dir, store) = open_store();
        for path in ["test.repo.org/path/one", "test.repo.org/path/two"] {
            let token = LeaseToken::new(path, max_lease_time()).unwrap();
            store.new_lease("key1", path, token).await.unwrap();
        }
        assert_eq!(store.get_leases().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_same_subpath_in_other_repository_coexists() {
        let (_dir, store) = open_store();
        for path in ["test1.repo.org/path/one", "test2.repo.org/path/one"] {
            let token = LeaseToken::new(path, max_lease_time()).unwrap();
            store.new_lease("key1", path, token).await.unwrap();
        }
        assert_eq!(store.get_leases().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_lease_is_replaced() {
        let (_dir, store) = open_store();
        let path = "test.repo.org/path/one";
        let short = LeaseToken::new(path, Duration::milliseconds(1)).unwrap();
        store.new_lease("key1", path, short).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let fresh = LeaseToken::new(path, max_lease_time()).unwrap();
        store.new_lease("key2", path, fresh).await.unwrap();

        let lease = store.get_lease_for_path(path).await.unwrap();
        assert_eq!(lease.key_id, "key2");
        assert_eq!(store.get_leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_sibling_is_collected_during_insert() {
        let (_dir, store) = open_store();
        let stale = "test.repo.org/stale";
        let token = LeaseToken::new(stale, Duration::milliseconds(1)).unwrap();
        store.new_lease("key1", stale, token).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let path = "test.repo.org/fresh";
        let token = LeaseToken::new(path, max_lease_time()).unwrap();
        store.new_lease("key1", path, token).await.unwrap();

        let leases = store.get_leases().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert!(leases.contains_key(path));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquisitions_grant_one_winner() {
        let (_dir, store) = open_store();
        let store = Arc::new(store);
        let path = "test.repo.org/contended";

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let token = LeaseToken::new(path, max_lease_time()).unwrap();
                store.new_lease(&format!("key{i}"), path, token).await
            }));
        }

        let mut won = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => won += 1,
                Err(StoreError::PathBusy { .. }) => {}
                Err(e) => panic!("unexpected store error: {e}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(store.get_leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_durability_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = "test.repo.org/path/one";
        let token = LeaseToken::new(path, max_lease_time()).unwrap();

        {
            let store = EmbeddedLeaseStore::open(dir.path()).unwrap();
            store.new_lease("key1", path, token.clone()).await.unwrap();
            store.close().await.unwrap();
        }

        let store = EmbeddedLeaseStore::open(dir.path()).unwrap();
        let lease = store.get_lease_for_path(path).await.unwrap();
        assert_eq!(lease.key_id, "key1");
        assert_eq!(lease.token.token_str, token.token_str);
        assert_eq!(lease.token.secret, token.secret);
        assert_eq!(lease.token.expiration, token.expiration);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_dir, store) = open_store();
        store.close().await.unwrap();
        store.close().await.unwrap();
    }
}
