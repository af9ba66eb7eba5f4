//! Shared helpers for backend integration tests.

use repogate_backend::{GatewayConfig, Services};
use tempfile::TempDir;

/// Access rules shared by the integration suites: `key1` may write
/// anywhere in both repositories, `key2` only under its restricted subdir.
const ACCESS_JSON: &str = r#"{
    "repos": [
        {
            "name": "test.repo.org",
            "keys": [
                { "id": "key1", "path": "/" },
                { "id": "key2", "path": "/restricted/to/subdir" }
            ]
        },
        {
            "name": "test2.repo.org",
            "keys": [
                { "id": "key1", "path": "/" }
            ]
        }
    ]
}"#;

/// A started gateway plus the temp directory holding its state.
///
/// The directory must outlive the services, so it rides along.
pub struct TestGateway {
    _dir: TempDir,
    pub services: Services,
}

/// Builds a gateway configuration rooted in a fresh temp directory with
/// the shared access rules written out.
pub fn gateway_config(dir: &TempDir, max_lease_time_secs: u64) -> GatewayConfig {
    let access_path = dir.path().join("access.json");
    std::fs::write(&access_path, ACCESS_JSON).unwrap();

    GatewayConfig {
        access_config_file: access_path,
        max_lease_time_secs,
        use_etcd: false,
        etcd_endpoints: Vec::new(),
        data_dir: dir.path().join("leases"),
    }
}

/// Starts gateway services on the embedded store.
pub async fn start_gateway(max_lease_time_secs: u64) -> TestGateway {
    let dir = TempDir::new().unwrap();
    let config = gateway_config(&dir, max_lease_time_secs);
    let services = Services::start(config).await.unwrap();
    TestGateway {
        _dir: dir,
        services,
    }
}
