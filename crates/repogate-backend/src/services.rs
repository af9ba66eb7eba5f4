//! Gateway services facade.
//!
//! Composes the access registry, the token service and the lease store
//! into the operations the HTTP frontend invokes. [`Services`] is the only
//! long-lived object of the coordination core: it is constructed by
//! [`Services::start`], passed explicitly to request handlers, and released
//! by [`Services::close`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use repogate_core::access::{AccessConfig, AccessConfigError, AccessError};
use repogate_core::path::{split_lease_path, PathError};
use repogate_core::token::{check_token, peek_path, LeaseToken, TokenError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigError, GatewayConfig};
use crate::store::{open_lease_store, Lease, LeaseStore, StoreError};

/// Errors surfaced by the services facade.
///
/// The variants wrap the taxonomy of the lower components so the frontend
/// can discriminate recoverable outcomes ([`StoreError::PathBusy`], token
/// expiry) from authorization failures and server errors.
#[derive(Debug, Error)]
pub enum ServicesError {
    /// The lease path does not split into `(repository, subpath)`.
    #[error(transparent)]
    Path(#[from] PathError),

    /// The requesting key is not authorized for the path.
    #[error(transparent)]
    Access(#[from] AccessError),

    /// The token failed verification or expired.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// The lease store rejected or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The gateway configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The access configuration could not be loaded.
    #[error("loading repository access configuration failed: {0}")]
    AccessConfig(#[from] AccessConfigError),
}

/// Lease projection handed to the frontend. Never carries the secret.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseReturn {
    /// The identity the lease was issued to.
    pub key_id: String,

    /// The lease path; set by token-based lookups where the caller does
    /// not already know it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_path: Option<String>,

    /// The token string; set by enumeration, where the caller holds no
    /// token yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_str: Option<String>,

    /// Expiration instant, RFC 3339.
    pub expires: String,
}

/// Container for the backend services of the gateway.
pub struct Services {
    access: AccessConfig,
    store: Box<dyn LeaseStore>,
    config: GatewayConfig,
    closed: AtomicBool,
}

impl Services {
    /// Initializes the backend services: loads the access registry and
    /// opens the lease store selected by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ServicesError`] when the configuration is invalid, the
    /// access file cannot be loaded, or the store cannot be opened.
    pub async fn start(config: GatewayConfig) -> Result<Self, ServicesError> {
        config.validate()?;
        let access = AccessConfig::load(&config.access_config_file)?;
        let store = open_lease_store(&config).await?;

        info!(
            repositories = access.repos().len(),
            backend = if config.use_etcd { "etcd" } else { "embedded" },
            "gateway services started"
        );

        Ok(Self {
            access,
            store,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// The access registry, for read-only introspection by the frontend.
    #[must_use]
    pub fn access(&self) -> &AccessConfig {
        &self.access
    }

    /// The lease store, for read-only introspection by the frontend.
    #[must_use]
    pub fn store(&self) -> &dyn LeaseStore {
        self.store.as_ref()
    }

    /// Flushes and releases the backend services. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates store shutdown failures.
    pub async fn close(&self) -> Result<(), ServicesError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.close().await?;
        Ok(())
    }

    /// Acquires a new lease on `lease_path` for `key_id` and returns the
    /// token string representing it.
    ///
    /// # Errors
    ///
    /// - [`PathError::Malformed`] when the path does not parse.
    /// - [`AccessError`] variants when `key_id` may not write there.
    /// - [`StoreError::PathBusy`] when a non-expired lease overlaps the
    ///   path; the conflicting path is reported to the client, not
    ///   treated as a server error.
    pub async fn new_lease(&self, key_id: &str, lease_path: &str) -> Result<String, ServicesError> {
        let (repo_name, sub_path) = split_lease_path(lease_path)?;

        // Only authorized keys ever reach the store.
        self.access.check(key_id, &sub_path, &repo_name)?;

        let token = LeaseToken::new(lease_path, self.config.max_lease_time())?;
        let token_str = token.token_str.clone();
        self.store.new_lease(key_id, lease_path, token).await?;

        debug!(key_id, path = %lease_path, "lease issued");
        Ok(token_str)
    }

    /// Returns all active, valid leases keyed by lease path.
    ///
    /// Entries whose token no longer verifies (expired or corrupt) are
    /// filtered out; they remain in the store until lazy collection
    /// removes them.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_leases(&self) -> Result<HashMap<String, LeaseReturn>, ServicesError> {
        let leases = self.store.get_leases().await?;

        let mut ret = HashMap::new();
        for (path, lease) in leases {
            if check_token(&lease.token.token_str, &lease.token.secret).is_ok() {
                ret.insert(
                    path,
                    LeaseReturn {
                        key_id: lease.key_id,
                        lease_path: None,
                        token_str: Some(lease.token.token_str),
                        expires: lease.token.expiration.to_rfc3339(),
                    },
                );
            }
        }
        Ok(ret)
    }

    /// Locates the lease a presented token refers to.
    ///
    /// A token whose tag was corrupted in transit no longer matches any
    /// stored token string, but its payload still names a real path. In
    /// that case the unverified path claim serves as a lookup hint; MAC
    /// verification against the stored secret then decides authenticity,
    /// so a tampered token is reported as invalid rather than unknown.
    async fn find_lease(&self, token_str: &str) -> Result<(String, Lease), ServicesError> {
        match self.store.get_lease_for_token(token_str).await {
            Ok(found) => Ok(found),
            Err(StoreError::NotFound) => {
                let Some(path) = peek_path(token_str) else {
                    return Err(StoreError::NotFound.into());
                };
                let lease = self.store.get_lease_for_path(&path).await?;
                Ok((path, lease))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the lease associated with `token_str`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] when no lease carries the token.
    /// - [`TokenError::Invalid`] / [`TokenError::Expired`] when the token
    ///   fails verification under the stored secret.
    pub async fn get_lease(&self, token_str: &str) -> Result<LeaseReturn, ServicesError> {
        let (lease_path, lease) = self.find_lease(token_str).await?;
        check_token(token_str, &lease.token.secret)?;

        Ok(LeaseReturn {
            key_id: lease.key_id,
            lease_path: Some(lease_path),
            token_str: None,
            expires: lease.token.expiration.to_rfc3339(),
        })
    }

    /// Cancels the lease associated with `token_str`.
    ///
    /// The token is verified against the stored secret first; a token that
    /// fails verification never deletes anything.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`Services::get_lease`].
    pub async fn cancel_lease(&self, token_str: &str) -> Result<(), ServicesError> {
        let (lease_path, lease) = self.find_lease(token_str).await?;
        check_token(token_str, &lease.token.secret)?;

        self.store.cancel_lease_for_token(token_str).await?;
        debug!(path = %lease_path, "lease cancelled by token");
        Ok(())
    }
}
