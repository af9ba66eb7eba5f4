//! # repogate-core
//!
//! Core library for repogate - the lease coordination core of a publishing
//! gateway for a content-addressed distributed filesystem.
//!
//! Clients that want to publish into a named repository first acquire an
//! exclusive lease on a subpath of that repository. This crate provides the
//! building blocks that make lease exclusivity enforceable:
//!
//! - **Path utilities** ([`path`]): parse lease paths into
//!   `(repository, subpath)` and decide segment-aware prefix relationships.
//! - **Token service** ([`token`]): mint and verify time-bounded, signed
//!   bearer tokens bound to a lease path.
//! - **Access registry** ([`access`]): answer "may key K write under subpath
//!   P of repository R?" from an immutable configuration.
//!
//! Persistent lease storage and the frontend-facing services facade live in
//! the `repogate-backend` crate.
//!
//! ## Example
//!
//! ```rust
//! use repogate_core::path::split_lease_path;
//! use repogate_core::token::{check_token, LeaseToken};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (repo, subpath) = split_lease_path("test.repo.org/path/one")?;
//! assert_eq!(repo, "test.repo.org");
//! assert_eq!(subpath, "/path/one");
//!
//! let token = LeaseToken::new("test.repo.org/path/one", chrono::Duration::seconds(60))?;
//! let payload = check_token(&token.token_str, &token.secret)?;
//! assert_eq!(payload.path, "test.repo.org/path/one");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod access;
pub mod path;
pub mod token;

pub use access::{AccessConfig, AccessConfigError, AccessError};
pub use path::{is_path_prefix, split_lease_path, PathError};
pub use token::{check_token, peek_path, LeaseToken, TokenError, TokenPayload, TokenSecret};
