//! Manifest storage.
//!
//! # Storage Layout
//!
//! ```text
//! {data_root}/manifests/
//! ├── .lock               # serializes index updates across processes
//! ├── index.json          # ManifestIndex
//! └── <id>.json           # Individual manifests, read-only once written
//! ```
//!
//! The store is append-only: a manifest file is never rewritten or removed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use crate::consts::MANIFEST_INDEX_VERSION;
use crate::environment::Environment;
use crate::execute::lock::FileLock;
use crate::paths;
use crate::request::EnvironmentId;

use super::types::{Manifest, ManifestId, ManifestIndex, ManifestMetadata, PersistenceError};

const INDEX_FILENAME: &str = "index.json";

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone)]
pub struct ManifestStore {
  base_path: PathBuf,
}

impl ManifestStore {
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }

  /// Store under the default data root (`METABUILD_HOME` or the XDG data dir).
  pub fn default_store() -> Self {
    Self::new(paths::manifests_dir())
  }

  pub fn base_path(&self) -> &Path {
    &self.base_path
  }

  fn index_path(&self) -> PathBuf {
    self.base_path.join(INDEX_FILENAME)
  }

  fn manifest_path(&self, id: &ManifestId) -> PathBuf {
    self.base_path.join(format!("{}.json", id))
  }

  fn ensure_dir(&self) -> Result<(), PersistenceError> {
    fs::create_dir_all(&self.base_path).map_err(PersistenceError::CreateDir)
  }

  /// Load the index. Returns an empty index if none was written yet.
  pub fn load_index(&self) -> Result<ManifestIndex, PersistenceError> {
    let content = match fs::read_to_string(self.index_path()) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ManifestIndex::new()),
      Err(e) => return Err(PersistenceError::Read(e)),
    };

    let index: ManifestIndex = serde_json::from_str(&content).map_err(PersistenceError::Parse)?;
    if index.version != MANIFEST_INDEX_VERSION {
      return Err(PersistenceError::UnsupportedVersion(index.version));
    }
    Ok(index)
  }

  /// Replace the index atomically (write to temp, then rename).
  fn save_index(&self, index: &ManifestIndex) -> Result<(), PersistenceError> {
    let temp_path = self.base_path.join(format!("{}.tmp", INDEX_FILENAME));
    let content = serde_json::to_string_pretty(index).map_err(PersistenceError::Serialize)?;
    fs::write(&temp_path, &content).map_err(PersistenceError::Write)?;
    fs::rename(&temp_path, self.index_path()).map_err(PersistenceError::Write)?;
    Ok(())
  }

  /// Snapshot an environment into a new manifest.
  pub fn save(&self, environment: &Environment) -> Result<ManifestId, PersistenceError> {
    let manifest = Manifest::from_environment(environment, Utc::now())?;
    self.save_manifest(&manifest)?;
    Ok(manifest.id)
  }

  /// Write a manifest and add it to the index.
  ///
  /// # Errors
  ///
  /// `AlreadyExists` if a manifest with the same id was saved before; the
  /// existing file is left untouched.
  pub fn save_manifest(&self, manifest: &Manifest) -> Result<(), PersistenceError> {
    self.ensure_dir()?;
    let _lock = FileLock::acquire_blocking(&self.base_path.join(LOCK_FILENAME), "manifest store")?;

    let path = self.manifest_path(&manifest.id);
    let temp_path = self.base_path.join(format!("{}.json.tmp", manifest.id));
    let content = serde_json::to_string_pretty(manifest).map_err(PersistenceError::Serialize)?;
    fs::write(&temp_path, &content).map_err(PersistenceError::Write)?;

    // A hard link never replaces an existing file, unlike rename.
    let linked = fs::hard_link(&temp_path, &path);
    let _ = fs::remove_file(&temp_path);
    match linked {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
        return Err(PersistenceError::AlreadyExists(manifest.id.to_string()));
      }
      Err(e) => return Err(PersistenceError::Write(e)),
    }

    let mut permissions = fs::metadata(&path).map_err(PersistenceError::Write)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(&path, permissions).map_err(PersistenceError::Write)?;

    let mut index = self.load_index()?;
    index.add(manifest.to_metadata());
    self.save_index(&index)?;

    info!(
      manifest = %manifest.id,
      environment = %manifest.environment,
      packages = manifest.packages.len(),
      "saved manifest"
    );
    Ok(())
  }

  pub fn load_manifest(&self, id: &ManifestId) -> Result<Manifest, PersistenceError> {
    let content = fs::read_to_string(self.manifest_path(id)).map_err(|e| {
      if e.kind() == io::ErrorKind::NotFound {
        PersistenceError::NotFound(id.to_string())
      } else {
        PersistenceError::Read(e)
      }
    })?;

    let manifest: Manifest = serde_json::from_str(&content).map_err(PersistenceError::Parse)?;
    debug!(manifest = %id, "loaded manifest");
    Ok(manifest)
  }

  /// Load a saved manifest back as an environment.
  pub fn load(&self, id: &ManifestId) -> Result<Environment, PersistenceError> {
    Ok(self.load_manifest(id)?.to_environment())
  }

  /// All manifests, oldest first.
  pub fn list(&self) -> Result<Vec<ManifestMetadata>, PersistenceError> {
    Ok(self.load_index()?.manifests)
  }

  /// The most recent manifest saved for an environment.
  pub fn latest(&self, environment: &EnvironmentId) -> Result<Option<Manifest>, PersistenceError> {
    let index = self.load_index()?;
    match index.latest(environment) {
      Some(metadata) => Ok(Some(self.load_manifest(&metadata.id)?)),
      None => Ok(None),
    }
  }
}
