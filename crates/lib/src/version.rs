//! Producer versions.
//!
//! A version is an opaque tag whose kind and canonical string form are hashed into a
//! [`Fingerprint`], so `string("abc")` and `git_commit("abc")` are different versions.
//! Rebuild decisions compare canonical forms, not semantic meaning: `1.0.0` and `1.0.0+build`
//! are different versions if their canonical forms differ.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;

#[derive(Debug, Error)]
pub enum VersionError {
  #[error("invalid semantic version `{input}`: {source}")]
  SemVer {
    input: String,
    #[source]
    source: semver::Error,
  },

  #[error("environment variable {0} is not set")]
  MissingEnv(String),
}

/// The identity of a producer's logic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Version {
  /// Free-form revision string.
  String { value: String },

  /// A source control revision.
  GitCommit { sha: String },

  /// Semantic version. Only the major component is significant once `major > 0`, so minor and
  /// patch bumps do not trigger backfills. Schema or methodology changes must bump major.
  SemVer { major: u64, minor: u64, patch: u64 },

  /// Whole seconds since the Unix epoch.
  Timestamp { secs: i64 },
}

impl Version {
  pub fn string(value: impl Into<String>) -> Self {
    Version::String { value: value.into() }
  }

  pub fn git_commit(sha: impl Into<String>) -> Self {
    Version::GitCommit { sha: sha.into() }
  }

  /// Read the commit sha from an environment variable (e.g. `GIT_SHA` in CI).
  pub fn git_commit_from_env(var: &str) -> Result<Self, VersionError> {
    std::env::var(var)
      .map(Self::git_commit)
      .map_err(|_| VersionError::MissingEnv(var.to_string()))
  }

  /// Parse a `major.minor.patch` string. Pre-release and build metadata are accepted by the
  /// parser but are not part of the canonical form.
  pub fn semver(input: &str) -> Result<Self, VersionError> {
    let parsed = semver::Version::parse(input).map_err(|source| VersionError::SemVer {
      input: input.to_string(),
      source,
    })?;
    Ok(Version::SemVer {
      major: parsed.major,
      minor: parsed.minor,
      patch: parsed.patch,
    })
  }

  pub fn timestamp(secs: i64) -> Self {
    Version::Timestamp { secs }
  }

  /// The representation that is hashed. Two versions with equal canonical forms are the same
  /// version for rebuild purposes.
  pub fn canonical(&self) -> String {
    match self {
      Version::String { value } => value.clone(),
      Version::GitCommit { sha } => sha.clone(),
      Version::SemVer { major: 0, minor, patch } => format!("0.{}.{}", minor, patch),
      Version::SemVer { major, .. } => major.to_string(),
      Version::Timestamp { secs } => secs.to_string(),
    }
  }

  /// The serialized `kind` tag.
  pub fn kind(&self) -> &'static str {
    match self {
      Version::String { .. } => "string",
      Version::GitCommit { .. } => "git_commit",
      Version::SemVer { .. } => "sem_ver",
      Version::Timestamp { .. } => "timestamp",
    }
  }

  pub fn fingerprint(&self) -> Fingerprint {
    Fingerprint::of_str(&format!("{}:{}", self.kind(), self.canonical()))
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Version::SemVer { major, minor, patch } => write!(f, "{}.{}.{}", major, minor, patch),
      Version::GitCommit { sha } => write!(f, "git:{}", sha),
      Version::Timestamp { secs } => write!(f, "ts:{}", secs),
      Version::String { value } => write!(f, "{}", value),
    }
  }
}
