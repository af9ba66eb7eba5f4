//! Signed bearer tokens for leases.
//!
//! A lease is represented to clients by an opaque token string. The token
//! carries the lease path, an expiration timestamp and a random nonce; the
//! server retains a per-token shared secret used to authenticate it.
//!
//! # Token layout
//!
//! ```text
//! payload_bytes = canonical JSON {"expiration": <RFC 3339 UTC>,
//!                                 "nonce": <base64>,
//!                                 "path": <lease path>}
//! tag           = HMAC-SHA256(secret, payload_bytes)
//! token_str     = base64url(canonical JSON {"payload": base64(payload_bytes),
//!                                           "tag": base64(tag)})
//! ```
//!
//! Canonical means sorted keys and no whitespace, so verification can
//! recompute the MAC over the exact payload bytes. The secret is never part
//! of the token string: holding a token alone does not permit forgery, and
//! verifying one needs no store access beyond secret retrieval.
//!
//! # Security properties
//!
//! - Secrets and nonces come from the operating system CSPRNG.
//! - MAC comparison is constant-time ([`subtle::ConstantTimeEq`]).
//! - Secret bytes are zeroized on drop and redacted from `Debug` output.

mod error;
mod secret;

pub use error::TokenError;
pub use secret::TokenSecret;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Number of random bytes in a token nonce.
const NONCE_LEN: usize = 16;

/// The authenticated claims carried by a token.
///
/// Field order is the canonical encoding order (sorted keys); serde emits
/// struct fields in declaration order, so the declaration must stay sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Instant past which the token no longer verifies.
    pub expiration: DateTime<Utc>,
    /// Base64-encoded random nonce, making every token string unique.
    pub nonce: String,
    /// The lease path this token is bound to.
    pub path: String,
}

/// Outer record encoded into the token string handed to clients.
#[derive(Serialize, Deserialize)]
struct TokenEnvelope {
    /// Base64 of the canonical payload bytes.
    payload: String,
    /// Base64 of the HMAC-SHA256 tag over the payload bytes.
    tag: String,
}

/// A minted lease token: the opaque string delivered to the client plus the
/// server-side material needed to verify it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseToken {
    /// Opaque token string presented to clients.
    pub token_str: String,
    /// Per-token shared secret keying the MAC. Server-side only.
    pub secret: TokenSecret,
    /// Expiration instant, also embedded in the token payload.
    pub expiration: DateTime<Utc>,
}

impl LeaseToken {
    /// Mints a token for `lease_path` valid for `max_lifetime` from now.
    ///
    /// Generates a fresh 256-bit secret and a 128-bit nonce from the OS
    /// CSPRNG, computes `expiration = now + max_lifetime` and signs the
    /// canonical payload.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidLifetime`] if `max_lifetime` is zero,
    /// negative, or pushes the expiration outside the representable range.
    pub fn new(lease_path: &str, max_lifetime: Duration) -> Result<Self, TokenError> {
        if max_lifetime <= Duration::zero() {
            return Err(TokenError::InvalidLifetime {
                seconds: max_lifetime.num_seconds(),
            });
        }
        let expiration =
            Utc::now()
                .checked_add_signed(max_lifetime)
                .ok_or(TokenError::InvalidLifetime {
                    seconds: max_lifetime.num_seconds(),
                })?;

        let secret = TokenSecret::generate();

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let payload = TokenPayload {
            expiration,
            nonce: STANDARD.encode(nonce),
            path: lease_path.to_string(),
        };
        let payload_bytes = encode_canonical(&payload)?;
        let tag = compute_tag(&secret, &payload_bytes)?;

        let envelope = TokenEnvelope {
            payload: STANDARD.encode(&payload_bytes),
            tag: STANDARD.encode(tag),
        };
        let token_str = URL_SAFE_NO_PAD.encode(encode_canonical(&envelope)?);

        Ok(Self {
            token_str,
            secret,
            expiration,
        })
    }
}

/// Verifies a token string against the per-token secret.
///
/// Decodes the envelope, recomputes the MAC over the payload bytes in
/// constant time, and checks that the expiration is still in the future.
/// Returns the authenticated payload on success.
///
/// # Errors
///
/// - [`TokenError::Invalid`] if the encoding is malformed or the MAC does
///   not verify under `secret`.
/// - [`TokenError::Expired`] if the MAC verifies but the expiration has
///   passed.
pub fn check_token(token_str: &str, secret: &TokenSecret) -> Result<TokenPayload, TokenError> {
    let envelope_bytes = URL_SAFE_NO_PAD
        .decode(token_str)
        .map_err(|_| TokenError::Invalid)?;
    let envelope: TokenEnvelope =
        serde_json::from_slice(&envelope_bytes).map_err(|_| TokenError::Invalid)?;

    let payload_bytes = STANDARD
        .decode(&envelope.payload)
        .map_err(|_| TokenError::Invalid)?;
    let tag = STANDARD
        .decode(&envelope.tag)
        .map_err(|_| TokenError::Invalid)?;

    let expected = compute_tag(secret, &payload_bytes)?;
    if !bool::from(expected.as_slice().ct_eq(&tag)) {
        return Err(TokenError::Invalid);
    }

    // Only authenticated bytes are parsed into claims.
    let payload: TokenPayload =
        serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::Invalid)?;

    if Utc::now() >= payload.expiration {
        return Err(TokenError::Expired {
            expired_at: payload.expiration,
        });
    }

    Ok(payload)
}

/// Extracts the lease path claim from a token string WITHOUT verifying the
/// MAC.
///
/// The result is untrusted and must only ever be used as a lookup hint;
/// any decision about the token's authenticity belongs to [`check_token`].
/// Returns `None` when the string does not decode into a token envelope.
#[must_use]
pub fn peek_path(token_str: &str) -> Option<String> {
    let envelope_bytes = URL_SAFE_NO_PAD.decode(token_str).ok()?;
    let envelope: TokenEnvelope = serde_json::from_slice(&envelope_bytes).ok()?;
    let payload_bytes = STANDARD.decode(&envelope.payload).ok()?;
    let payload: TokenPayload = serde_json::from_slice(&payload_bytes).ok()?;
    Some(payload.path)
}

/// Serializes `value` to canonical JSON bytes (declaration-ordered fields,
/// no whitespace).
fn encode_canonical<T: Serialize>(value: &T) -> Result<Vec<u8>, TokenError> {
    serde_json::to_vec(value).map_err(|_| TokenError::Invalid)
}

fn compute_tag(secret: &TokenSecret, payload_bytes: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| TokenError::Invalid)?;
    mac.update(payload_bytes);
    Ok(mac.finalize().into_bytes().to_vec())
}
