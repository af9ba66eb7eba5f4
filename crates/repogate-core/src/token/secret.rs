//! Per-token secret material.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Number of random bytes in a freshly generated secret.
const SECRET_LEN: usize = 32;

/// The shared secret keying a token's MAC.
///
/// Lives server-side only: it is persisted alongside the lease and never
/// enters the token string, log output, or frontend projections. The bytes
/// are zeroized on drop, `Debug` is redacted, and serde represents the
/// value as base64 for stores that persist JSON records.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TokenSecret(Vec<u8>);

impl TokenSecret {
    /// Generates a fresh secret from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps existing secret bytes, e.g. read back from a store.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrows the raw secret bytes for MAC computation or persistence.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenSecret(..)")
    }
}

impl Serialize for TokenSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for TokenSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| D::Error::custom("invalid base64 secret"))?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_random_and_sized() {
        let a = TokenSecret::generate();
        let b = TokenSecret::generate();
        assert_eq!(a.as_bytes().len(), SECRET_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_is_redacted() {
        let secret = TokenSecret::generate();
        let rendered = format!("{secret:?}");
        assert_eq!(rendered, "TokenSecret(..)");
    }

    #[test]
    fn test_serde_roundtrip() {
        let secret = TokenSecret::from_bytes(vec![1, 2, 3, 4]);
        let json = serde_json::to_string(&secret).unwrap();
        let back: TokenSecret = serde_json::from_str(&json).unwrap();
        assert_eq!(secret, back);
        // The JSON holds base64, not raw bytes.
        assert!(!json.contains("[1,2,3,4]"));
    }
}
