use std::collections::BTreeMap;
use std::fmt;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::MANIFEST_INDEX_VERSION;
use crate::environment::{Environment, EnvironmentEntry, EnvironmentStatus, PackagePin};
use crate::execute::lock::LockError;
use crate::hash::{HashError, Hashable, ObjectHash};
use crate::request::EnvironmentId;

/// Identifier of a saved manifest: creation time plus a content hash prefix,
/// e.g. `20240611T093015123456789-3f2a9c1b`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(String);

impl ManifestId {
  fn generate(created_at: &DateTime<Utc>, hash: &ObjectHash) -> Self {
    let prefix: String = hash.0.chars().take(8).collect();
    Self(format!("{}-{}", created_at.format("%Y%m%dT%H%M%S%9f"), prefix))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ManifestId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ManifestId {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

/// The hashed part of a manifest: which packages, at which versions, from
/// which driver. Identical builds produce identical content hashes.
#[derive(Serialize)]
struct ManifestContent<'a> {
  environment: &'a EnvironmentId,
  packages: &'a BTreeMap<String, PackagePin>,
}

impl Hashable for ManifestContent<'_> {}

/// Immutable record of a completed environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
  pub id: ManifestId,
  pub environment: EnvironmentId,
  pub created_at: DateTime<Utc>,
  pub content_hash: ObjectHash,
  pub status: EnvironmentStatus,
  pub entries: Vec<EnvironmentEntry>,
  pub packages: BTreeMap<String, PackagePin>,
}

impl Manifest {
  pub fn from_environment(environment: &Environment, created_at: DateTime<Utc>) -> Result<Self, PersistenceError> {
    let packages = environment.packages();
    let content_hash = ManifestContent {
      environment: &environment.id,
      packages: &packages,
    }
    .compute_hash()
    .map_err(PersistenceError::Hash)?;

    Ok(Self {
      id: ManifestId::generate(&created_at, &content_hash),
      environment: environment.id.clone(),
      created_at,
      content_hash,
      status: environment.status,
      entries: environment.entries().to_vec(),
      packages,
    })
  }

  pub fn to_environment(&self) -> Environment {
    Environment::from_entries(self.environment.clone(), self.status, self.entries.clone())
  }

  pub fn to_metadata(&self) -> ManifestMetadata {
    ManifestMetadata {
      id: self.id.clone(),
      environment: self.environment.clone(),
      created_at: self.created_at,
      content_hash: self.content_hash.clone(),
      package_count: self.packages.len(),
    }
  }
}

/// Index entry for a saved manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMetadata {
  pub id: ManifestId,
  pub environment: EnvironmentId,
  pub created_at: DateTime<Utc>,
  pub content_hash: ObjectHash,
  pub package_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestIndex {
  pub version: u32,
  pub manifests: Vec<ManifestMetadata>,
}

impl Default for ManifestIndex {
  fn default() -> Self {
    Self::new()
  }
}

impl ManifestIndex {
  pub fn new() -> Self {
    Self {
      version: MANIFEST_INDEX_VERSION,
      manifests: Vec::new(),
    }
  }

  /// Add an entry, keeping the list in creation order.
  pub fn add(&mut self, metadata: ManifestMetadata) {
    let pos = self
      .manifests
      .partition_point(|m| (m.created_at, &m.id) <= (metadata.created_at, &metadata.id));
    self.manifests.insert(pos, metadata);
  }

  pub fn contains(&self, id: &ManifestId) -> bool {
    self.manifests.iter().any(|m| &m.id == id)
  }

  /// Most recent manifest of one environment.
  pub fn latest(&self, environment: &EnvironmentId) -> Option<&ManifestMetadata> {
    self.manifests.iter().rev().find(|m| &m.environment == environment)
  }

  pub fn len(&self) -> usize {
    self.manifests.len()
  }

  pub fn is_empty(&self) -> bool {
    self.manifests.is_empty()
  }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
  #[error("failed to create manifest directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to read manifest store: {0}")]
  Read(#[source] io::Error),

  #[error("failed to write manifest store: {0}")]
  Write(#[source] io::Error),

  #[error("failed to parse manifest store file: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize manifest: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("failed to hash manifest content: {0}")]
  Hash(#[source] HashError),

  #[error("manifest not found: {0}")]
  NotFound(String),

  #[error("manifest already exists: {0}")]
  AlreadyExists(String),

  #[error("unsupported manifest index version {0}")]
  UnsupportedVersion(u32),

  #[error("failed to lock manifest store: {0}")]
  Lock(#[from] LockError),
}
