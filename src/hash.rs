// src/hash.rs

//! Checksums for sources, bottles and installed files
//!
//! Recipes declare checksums either bare (64 hex chars, SHA-256) or with an
//! algorithm prefix:
//!
//! | Form | Algorithm |
//! |------|-----------|
//! | `529c6a58...` | SHA-256 |
//! | `sha256:529c6a58...` | SHA-256 |
//! | `xxh128:0f3a...` | XXH128 |
//!
//! Source checksums must be SHA-256. XXH128 is accepted for bottle entries,
//! which are verified the same way.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_128;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// SHA-256 (cryptographic, used for every integrity decision)
    #[default]
    Sha256,
    /// XXH128 (non-cryptographic, fast fingerprints)
    Xxh128,
}

impl HashAlgorithm {
    /// Hash output length in hex characters
    #[inline]
    pub const fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Xxh128 => 32,
        }
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Xxh128 => "xxh128",
        }
    }

    #[inline]
    pub const fn is_cryptographic(&self) -> bool {
        matches!(self, Self::Sha256)
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "xxh128" | "xxh3" => Ok(Self::Xxh128),
            _ => Err(HashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Checksum parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid hash length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("invalid hex in hash: {0}")]
    InvalidHex(String),
}

/// A checksum value together with its algorithm
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    algorithm: HashAlgorithm,
    value: String,
}

impl Checksum {
    /// Create a checksum, validating length and hex digits
    pub fn new(algorithm: HashAlgorithm, value: impl Into<String>) -> Result<Self, HashError> {
        let value = value.into();
        if value.len() != algorithm.hex_len() {
            return Err(HashError::InvalidLength {
                expected: algorithm.hex_len(),
                got: value.len(),
            });
        }
        if hex::decode(&value).is_err() {
            return Err(HashError::InvalidHex(value));
        }
        Ok(Self {
            algorithm,
            value: value.to_lowercase(),
        })
    }

    /// Parse `sha256:<hex>`, `xxh128:<hex>` or bare SHA-256 hex
    pub fn parse(s: &str) -> Result<Self, HashError> {
        match s.trim().split_once(':') {
            Some((algo, value)) => Self::new(algo.parse()?, value),
            None => Self::new(HashAlgorithm::Sha256, s.trim()),
        }
    }

    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hex digest without prefix
    #[inline]
    pub fn hex(&self) -> &str {
        &self.value
    }

    /// `algorithm:hex`, the canonical persisted form
    pub fn to_prefixed_string(&self) -> String {
        format!("{}:{}", self.algorithm.name(), self.value)
    }

    /// Whether `data` hashes to this checksum
    pub fn matches(&self, data: &[u8]) -> bool {
        hash_bytes(self.algorithm, data) == *self
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

impl FromStr for Checksum {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Incremental hasher over any supported algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    // xxh3 one-shot API only
    Xxh128(Vec<u8>),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Xxh128 => HasherState::Xxh128(Vec::new()),
        };
        Self { algorithm, state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Xxh128(buffer) => buffer.extend_from_slice(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        let value = match self.state {
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Xxh128(buffer) => format!("{:032x}", xxh3_128(&buffer)),
        };
        Checksum {
            algorithm: self.algorithm,
            value,
        }
    }
}

/// Hash a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Checksum {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Hash everything a reader yields
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<Checksum> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Stream a file through the hasher
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> io::Result<Checksum> {
    let mut file = File::open(path)?;
    hash_reader(algorithm, &mut file)
}

/// SHA-256 of `data` as hex
#[inline]
pub fn sha256(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha256, data).value
}
