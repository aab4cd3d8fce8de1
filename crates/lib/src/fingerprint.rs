//! Order-independent 64-bit identities.
//!
//! A `Fingerprint` identifies a piece of content (a version string, a partition key, a stored
//! value) or a combination of other fingerprints. Combination is XOR, so:
//! - it is commutative and associative, fingerprints of an unordered set are well defined
//! - `0` is the identity element and drops out when combined
//!
//! Content hashing takes the first 8 bytes (big-endian) of a SHA-256 digest. The result is
//! identical on every platform, which matters because fingerprints are persisted in the ledger
//! and compared across runs and machines.

use std::fmt;
use std::ops::BitXor;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A 64-bit, combinable content identity.
///
/// Displays as 16 lowercase hex digits, e.g. `"00c0ffee00c0ffee"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint(u64);

/// Error parsing a fingerprint from its hex form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid fingerprint `{input}`: expected 16 hex digits")]
pub struct ParseFingerprintError {
  pub input: String,
}

impl Fingerprint {
  /// The identity value. Combining with it is a no-op.
  pub const fn empty() -> Self {
    Self(0)
  }

  /// Wrap a raw 64-bit value.
  pub const fn from_u64(raw: u64) -> Self {
    Self(raw)
  }

  pub const fn as_u64(&self) -> u64 {
    self.0
  }

  /// Content-hash an arbitrary byte sequence.
  pub fn of(bytes: &[u8]) -> Self {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    Self(u64::from_be_bytes(head))
  }

  pub fn of_str(s: &str) -> Self {
    Self::of(s.as_bytes())
  }

  /// Fingerprint an integer by its decimal representation.
  pub fn of_i64(value: i64) -> Self {
    Self::of_str(&value.to_string())
  }

  /// XOR-combine two fingerprints.
  #[must_use]
  pub const fn combine(self, other: Self) -> Self {
    Self(self.0 ^ other.0)
  }

  /// Combine any number of fingerprints; an empty iterator yields `empty()`.
  pub fn combine_all<I>(fingerprints: I) -> Self
  where
    I: IntoIterator<Item = Fingerprint>,
  {
    fingerprints.into_iter().fold(Self::empty(), Self::combine)
  }

  pub const fn is_identity(&self) -> bool {
    self.0 == 0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0.to_be_bytes())
  }
}

impl BitXor for Fingerprint {
  type Output = Fingerprint;

  fn bitxor(self, rhs: Self) -> Self::Output {
    self.combine(rhs)
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:016x}", self.0)
  }
}

impl FromStr for Fingerprint {
  type Err = ParseFingerprintError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let err = || ParseFingerprintError { input: s.to_string() };
    let bytes = hex::decode(s).map_err(|_| err())?;
    let raw: [u8; 8] = bytes.try_into().map_err(|_| err())?;
    Ok(Self(u64::from_be_bytes(raw)))
  }
}

impl From<Fingerprint> for String {
  fn from(fp: Fingerprint) -> Self {
    fp.to_hex()
  }
}

impl TryFrom<String> for Fingerprint {
  type Error = ParseFingerprintError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}
