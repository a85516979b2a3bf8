//! Content digests used as generation keys

use crate::error::{StowageError, StowageResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// An `algorithm:hex` content hash identifying one immutable version of
/// bundle content.
///
/// Parsing is strict because the string form is used verbatim as a
/// directory name inside the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    /// Build a sha256 digest from raw hash output
    pub fn sha256_from_bytes(hash: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            encoded: hex::encode(hash),
        }
    }

    /// Hash an in-memory buffer
    pub fn sha256_of(data: &[u8]) -> Self {
        Self::sha256_from_bytes(&Sha256::digest(data))
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Short form for display (first 12 hex chars)
    pub fn short(&self) -> &str {
        let end = self.encoded.len().min(12);
        &self.encoded[..end]
    }

    fn expected_len(algorithm: &str) -> Option<usize> {
        match algorithm {
            "sha256" => Some(64),
            "sha384" => Some(96),
            "sha512" => Some(128),
            _ => None,
        }
    }
}

impl FromStr for Digest {
    type Err = StowageError;

    fn from_str(value: &str) -> StowageResult<Self> {
        let invalid = |reason: &str| StowageError::InvalidDigest {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let (algorithm, encoded) = value
            .split_once(':')
            .ok_or_else(|| invalid("expected algorithm:hex"))?;

        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-'))
        {
            return Err(invalid("malformed algorithm"));
        }
        if encoded.is_empty() || !encoded.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(invalid("encoded part must be lowercase hex"));
        }
        if let Some(len) = Self::expected_len(algorithm) {
            if encoded.len() != len {
                return Err(invalid(&format!("{} digest must be {} hex characters", algorithm, len)));
            }
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = StowageError;

    fn try_from(value: String) -> StowageResult<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}
