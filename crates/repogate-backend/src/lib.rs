//! # repogate-backend
//!
//! Backend services for repogate - persistent lease storage, gateway
//! configuration and the services facade invoked by the HTTP frontend.
//!
//! # Modules
//!
//! - [`config`]: the configuration subset the coordination core consumes
//! - [`store`]: the [`store::LeaseStore`] contract and its embedded
//!   (SQLite) and replicated (etcd) backends
//! - [`services`]: the facade composing access checks, token minting and
//!   lease storage into frontend-facing operations
//!
//! # Example
//!
//! ```rust,no_run
//! use repogate_backend::{GatewayConfig, Services};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::from_file("/etc/repogate/gateway.json".as_ref())?;
//! let services = Services::start(config).await?;
//!
//! let token = services.new_lease("key1", "test.repo.org/path/one").await?;
//! services.cancel_lease(&token).await?;
//! services.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod services;
pub mod store;

pub use config::{ConfigError, GatewayConfig};
pub use services::{LeaseReturn, Services, ServicesError};
pub use store::{Lease, LeaseStore, StoreError};
