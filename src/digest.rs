//! Content digests and hashing helpers
//!
//! Every content identifier in the pull pipeline is a [`Digest`] of the form
//! `algorithm:hex`. Layers carry two of them: the digest of the gzipped bytes
//! as served by the registry (the manifest's `blobSum`) and the digest of the
//! uncompressed tar payload (the `DiffID` feeding the rootfs chain).

use crate::error::{PullError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// The only algorithm registries use in practice, and the one we compute.
pub const CANONICAL_ALGORITHM: &str = "sha256";

/// A parsed `algorithm:hex` content identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Parse a digest string of the form `algorithm:hex`
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            PullError::Validation(format!("Digest missing algorithm prefix: {}", s))
        })?;
        if algorithm.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PullError::Validation(format!("Invalid digest format: {}", s)));
        }
        if algorithm == CANONICAL_ALGORITHM && hex.len() != 64 {
            return Err(PullError::Validation(format!(
                "Invalid SHA256 digest length: expected 64 hex characters, got {}",
                hex.len()
            )));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_lowercase(),
        })
    }

    /// Compute the canonical (sha256) digest of a byte slice
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            algorithm: CANONICAL_ALGORITHM.to_string(),
            hex: hex::encode(hasher.finalize()),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The hex part without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Truncated form for log lines
    pub fn short(&self) -> String {
        format!("{}:{}", self.algorithm, &self.hex[..12.min(self.hex.len())])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl TryFrom<String> for Digest {
    type Error = PullError;

    fn try_from(value: String) -> Result<Self> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

/// Incremental sha256 digester for streamed content
#[derive(Default)]
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest {
            algorithm: CANONICAL_ALGORITHM.to_string(),
            hex: hex::encode(self.hasher.finalize()),
        }
    }
}

/// Derive the chain id identifying the stacked filesystem state after
/// applying `diff_ids` in order. The chain over a single diff id is the
/// diff id itself; each further layer hashes `"<chain> <diff-id>"`.
pub fn chain_id(diff_ids: &[Digest]) -> Option<Digest> {
    let mut iter = diff_ids.iter();
    let mut chain = iter.next()?.clone();
    for diff_id in iter {
        chain = Digest::from_bytes(format!("{} {}", chain, diff_id).as_bytes());
    }
    Some(chain)
}
