//! Identifiers, content digests and keyed signatures.
//!
//! Identifiers name per-job workspaces and storage keys, so they must be safe
//! as both a path component and an object key segment. Digests and signatures
//! are encoded as unpadded base64url.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;
use uuid::Uuid;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors raised by the signing helpers.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid HMAC key: {0}")]
    InvalidKey(String),

    #[error("Unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Digest algorithm used by [`hash`] and [`hmac_digest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Generate a new globally unique identifier (UUID v4, hyphenated).
pub fn new_identifier() -> String {
    Uuid::new_v4().to_string()
}

/// Compute a deterministic digest of `payload`.
pub fn hash(payload: impl AsRef<[u8]>, algorithm: HashAlgorithm) -> String {
    let payload = payload.as_ref();
    let digest = match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(payload).to_vec(),
        HashAlgorithm::Sha384 => Sha384::digest(payload).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(payload).to_vec(),
    };
    URL_SAFE_NO_PAD.encode(digest)
}

/// Check `payload` against a digest produced with the default algorithm.
pub fn compare_with_hash(payload: impl AsRef<[u8]>, expected: &str) -> bool {
    hash(payload, HashAlgorithm::default()) == expected
}

macro_rules! keyed_mac {
    ($digest:ty, $secret:expr) => {
        Hmac::<$digest>::new_from_slice($secret).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    };
}

fn mac_bytes(secret: &[u8], payload: &[u8], algorithm: HashAlgorithm) -> CryptoResult<Vec<u8>> {
    let bytes = match algorithm {
        HashAlgorithm::Sha256 => {
            let mut mac = keyed_mac!(Sha256, secret)?;
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        HashAlgorithm::Sha384 => {
            let mut mac = keyed_mac!(Sha384, secret)?;
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        HashAlgorithm::Sha512 => {
            let mut mac = keyed_mac!(Sha512, secret)?;
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
    };
    Ok(bytes)
}

/// Keyed digest of `payload`, base64url encoded.
pub fn hmac_digest(secret: &str, payload: &str, algorithm: HashAlgorithm) -> CryptoResult<String> {
    let bytes = mac_bytes(secret.as_bytes(), payload.as_bytes(), algorithm)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Sign `payload` as `<payload>.<HMAC-SHA256 signature>`.
pub fn sign(secret: &str, payload: &str) -> CryptoResult<String> {
    let signature = hmac_digest(secret, payload, HashAlgorithm::Sha256)?;
    Ok(format!("{}.{}", payload, signature))
}

/// Verify a payload produced by [`sign`].
///
/// Returns `Ok(None)` when the input is malformed or the signature does not
/// match. Returns an error only for an unusable key.
pub fn verify(secret: &str, signed: &str) -> CryptoResult<Option<String>> {
    // The signature alphabet never contains '.', so the last separator is authoritative.
    let Some((payload, sig_encoded)) = signed.rsplit_once('.') else {
        return Ok(None);
    };

    let sig_bytes = match URL_SAFE_NO_PAD.decode(sig_encoded) {
        Ok(bytes) => bytes,
        Err(_) => return Ok(None),
    };

    let mut mac = keyed_mac!(Sha256, secret.as_bytes())?;
    mac.update(payload.as_bytes());

    if mac.verify_slice(&sig_bytes).is_err() {
        return Ok(None);
    }

    Ok(Some(payload.to_string()))
}

/// Random numeric code of `length` decimal digits.
pub fn random_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}
