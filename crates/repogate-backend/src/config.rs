//! Gateway configuration.
//!
//! Only the subset the coordination core consumes lives here; frontend
//! concerns (listen addresses, TLS, payload limits) are configured
//! elsewhere.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default maximum lease lifetime, in seconds.
const DEFAULT_MAX_LEASE_TIME_SECS: u64 = 7200;

/// Errors from loading or validating the gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("could not read gateway configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid JSON of the expected shape.
    #[error("could not parse gateway configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// `max_lease_time_secs` must be positive.
    #[error("max_lease_time_secs must be positive")]
    NonPositiveLeaseTime,

    /// The etcd backend was selected without any endpoints.
    #[error("use_etcd is set but etcd_endpoints is empty")]
    MissingEtcdEndpoints,
}

/// Configuration consumed by the lease coordination core.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Path to the repository access configuration file.
    pub access_config_file: PathBuf,

    /// Maximum lifetime of an issued lease, in seconds.
    #[serde(default = "default_max_lease_time_secs")]
    pub max_lease_time_secs: u64,

    /// Select the replicated (etcd) lease store instead of the embedded
    /// one.
    #[serde(default)]
    pub use_etcd: bool,

    /// etcd endpoints, consumed only when `use_etcd` is set.
    #[serde(default)]
    pub etcd_endpoints: Vec<String>,

    /// Directory holding the embedded lease store's files.
    pub data_dir: PathBuf,
}

const fn default_max_lease_time_secs() -> u64 {
    DEFAULT_MAX_LEASE_TIME_SECS
}

impl GatewayConfig {
    /// Loads and validates the configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NonPositiveLeaseTime`] or
    /// [`ConfigError::MissingEtcdEndpoints`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_lease_time_secs == 0 {
            return Err(ConfigError::NonPositiveLeaseTime);
        }
        if self.use_etcd && self.etcd_endpoints.is_empty() {
            return Err(ConfigError::MissingEtcdEndpoints);
        }
        Ok(())
    }

    /// The maximum lease lifetime as a [`chrono::Duration`].
    ///
    /// Values beyond the representable range are clamped; lease expirations
    /// that far out behave the same either way.
    #[must_use]
    pub fn max_lease_time(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(i64::try_from(self.max_lease_time_secs).unwrap_or(i64::MAX))
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> GatewayConfig {
        GatewayConfig {
            access_config_file: PathBuf::from("/etc/repogate/access.json"),
            max_lease_time_secs: 60,
            use_etcd: false,
            etcd_endpoints: Vec::new(),
            data_dir: PathBuf::from("/var/lib/repogate"),
        }
    }

    #[test]
    fn test_validate_accepts_embedded_defaults() {
        base_config().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_lease_time() {
        let mut config = base_config();
        config.max_lease_time_secs = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::NonPositiveLeaseTime
        ));
    }

    #[test]
    fn test_validate_rejects_etcd_without_endpoints() {
        let mut config = base_config();
        config.use_etcd = true;
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::MissingEtcdEndpoints
        ));
    }

    #[test]
    fn test_from_file_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(
            &path,
            r#"{
                "access_config_file": "/etc/repogate/access.json",
                "data_dir": "/var/lib/repogate"
            }"#,
        )
        .unwrap();

        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.max_lease_time_secs, DEFAULT_MAX_LEASE_TIME_SECS);
        assert!(!config.use_etcd);
        assert!(config.etcd_endpoints.is_empty());
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(
            &path,
            r#"{
                "access_config_file": "/etc/repogate/access.json",
                "data_dir": "/var/lib/repogate",
                "max_lease_time_secs": 0
            }"#,
        )
        .unwrap();

        assert!(matches!(
            GatewayConfig::from_file(&path).unwrap_err(),
            ConfigError::NonPositiveLeaseTime
        ));
    }

    #[test]
    fn test_max_lease_time_conversion() {
        let config = base_config();
        assert_eq!(config.max_lease_time(), chrono::Duration::seconds(60));
    }
}
