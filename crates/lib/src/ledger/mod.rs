//! Status ledger: the last known result of every request, per environment.
//!
//! # Storage Layout
//!
//! ```text
//! {data_root}/status/
//! └── <environment>.json   # EnvironmentLedger, replaced atomically
//! ```
//!
//! The orchestrator reads it before building to reuse earlier successes and
//! to avoid retrying requests that already failed or were skipped.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::LEDGER_VERSION;
use crate::driver::DriverKind;
use crate::environment::{InstalledPackage, Outcome, OutcomeStatus};
use crate::paths;
use crate::request::EnvironmentId;

#[derive(Debug, Error)]
pub enum LedgerError {
  #[error("failed to create ledger directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to read ledger {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write ledger {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse ledger {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize ledger: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported ledger version {0}")]
  UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
  #[default]
  Unknown,
  Skipped,
  Success,
  Error,
}

impl fmt::Display for LedgerStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      LedgerStatus::Unknown => "unknown",
      LedgerStatus::Skipped => "skipped",
      LedgerStatus::Success => "success",
      LedgerStatus::Error => "error",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
  pub status: LedgerStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub returncode: Option<i32>,
  /// Failed runs since the last success.
  #[serde(default)]
  pub errorcount: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tried_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub build_seconds: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub driver: Option<DriverKind>,
  #[serde(default)]
  pub installed: Vec<InstalledPackage>,
}

impl StatusRecord {
  /// Fold a final outcome into the previous record for the same request.
  pub fn next(previous: Option<&StatusRecord>, outcome: &Outcome, driver: Option<DriverKind>) -> Self {
    let errors_so_far = previous.map_or(0, |p| p.errorcount);
    let (status, errorcount) = match outcome.status {
      OutcomeStatus::Succeeded => (LedgerStatus::Success, 0),
      OutcomeStatus::Failed => (LedgerStatus::Error, errors_so_far + 1),
      OutcomeStatus::Skipped => (LedgerStatus::Skipped, errors_so_far),
    };

    Self {
      status,
      reason: outcome.reason.clone(),
      returncode: outcome.exit_code,
      errorcount,
      tried_at: Some(Utc::now()),
      build_seconds: outcome.duration.as_secs_f64(),
      driver,
      installed: outcome.installed.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentLedger {
  pub version: u32,
  pub environment: EnvironmentId,
  /// Keyed by request key (`name@constraint`).
  pub records: BTreeMap<String, StatusRecord>,
}

impl EnvironmentLedger {
  pub fn new(environment: EnvironmentId) -> Self {
    Self {
      version: LEDGER_VERSION,
      environment,
      records: BTreeMap::new(),
    }
  }

  pub fn get(&self, key: &str) -> Option<&StatusRecord> {
    self.records.get(key)
  }

  pub fn status(&self, key: &str) -> LedgerStatus {
    self.get(key).map(|r| r.status).unwrap_or_default()
  }

  pub fn record(&mut self, key: &str, outcome: &Outcome, driver: Option<DriverKind>) {
    let record = StatusRecord::next(self.records.get(key), outcome, driver);
    self.records.insert(key.to_string(), record);
  }

  pub fn count(&self, status: LedgerStatus) -> usize {
    self.records.values().filter(|r| r.status == status).count()
  }
}

#[derive(Debug, Clone)]
pub struct StatusLedger {
  dir: PathBuf,
}

impl StatusLedger {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn default_ledger() -> Self {
    Self::new(paths::ledger_dir())
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn path(&self, environment: &EnvironmentId) -> PathBuf {
    self.dir.join(format!("{}.json", environment))
  }

  /// Load an environment's ledger. Returns an empty ledger if none exists.
  pub fn load(&self, environment: &EnvironmentId) -> Result<EnvironmentLedger, LedgerError> {
    let path = self.path(environment);
    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(EnvironmentLedger::new(environment.clone())),
      Err(source) => return Err(LedgerError::Read { path, source }),
    };

    let ledger: EnvironmentLedger =
      serde_json::from_str(&content).map_err(|source| LedgerError::Parse { path: path.clone(), source })?;
    if ledger.version != LEDGER_VERSION {
      return Err(LedgerError::UnsupportedVersion(ledger.version));
    }
    Ok(ledger)
  }

  /// Replace the ledger file atomically.
  pub fn save(&self, ledger: &EnvironmentLedger) -> Result<(), LedgerError> {
    fs::create_dir_all(&self.dir).map_err(LedgerError::CreateDir)?;

    let path = self.path(&ledger.environment);
    let temp_path = self.dir.join(format!("{}.json.tmp", ledger.environment));
    let content = serde_json::to_string_pretty(ledger).map_err(LedgerError::Serialize)?;
    fs::write(&temp_path, &content).map_err(|source| LedgerError::Write {
      path: temp_path.clone(),
      source,
    })?;
    fs::rename(&temp_path, &path).map_err(|source| LedgerError::Write {
      path: path.clone(),
      source,
    })?;

    debug!(ledger = %path.display(), records = ledger.records.len(), "saved status ledger");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::environment::FailureKind;
  use crate::request::Version;
  use std::time::Duration;
  use tempfile::TempDir;

  fn env() -> EnvironmentId {
    EnvironmentId::new("bio").unwrap()
  }

  fn temp_ledger() -> (TempDir, StatusLedger) {
    let temp = TempDir::new().unwrap();
    let ledger = StatusLedger::new(temp.path().join("status"));
    (temp, ledger)
  }

  #[test]
  fn missing_ledger_is_empty() {
    let (_temp, store) = temp_ledger();
    let ledger = store.load(&env()).unwrap();
    assert!(ledger.records.is_empty());
    assert_eq!(ledger.status("zlib@1.3"), LedgerStatus::Unknown);
  }

  #[test]
  fn records_roundtrip() {
    let (_temp, store) = temp_ledger();
    let mut ledger = store.load(&env()).unwrap();

    let installed = vec![InstalledPackage::new("zlib", Version::parse("1.3").unwrap(), DriverKind::Spack)];
    let success = Outcome::succeeded(installed.clone()).with_duration(Duration::from_secs(90));
    ledger.record("zlib@1.3", &success, Some(DriverKind::Spack));
    ledger.record("gimp@2.10", &Outcome::skipped("module class excluded via exclude"), None);
    store.save(&ledger).unwrap();

    let loaded = store.load(&env()).unwrap();
    assert_eq!(loaded, ledger);
    let zlib = loaded.get("zlib@1.3").unwrap();
    assert_eq!(zlib.status, LedgerStatus::Success);
    assert_eq!(zlib.installed, installed);
    assert_eq!(zlib.build_seconds, 90.0);
    assert!(zlib.tried_at.is_some());
    assert_eq!(loaded.count(LedgerStatus::Skipped), 1);
  }

  #[test]
  fn errorcount_accumulates_and_resets() {
    let mut ledger = EnvironmentLedger::new(env());
    let failure = Outcome::failed(FailureKind::Fatal, "install failed with exit code 2").with_exit_code(Some(2));

    ledger.record("zlib@1.3", &failure, Some(DriverKind::EasyBuild));
    ledger.record("zlib@1.3", &failure, Some(DriverKind::EasyBuild));
    let record = ledger.get("zlib@1.3").unwrap();
    assert_eq!(record.status, LedgerStatus::Error);
    assert_eq!(record.errorcount, 2);
    assert_eq!(record.returncode, Some(2));

    ledger.record("zlib@1.3", &Outcome::succeeded(Vec::new()), Some(DriverKind::EasyBuild));
    assert_eq!(ledger.get("zlib@1.3").unwrap().errorcount, 0);
  }

  #[test]
  fn rejects_unknown_version() {
    let (_temp, store) = temp_ledger();
    fs::create_dir_all(store.dir()).unwrap();
    fs::write(
      store.path(&env()),
      r#"{"version": 42, "environment": "bio", "records": {}}"#,
    )
    .unwrap();
    assert!(matches!(store.load(&env()), Err(LedgerError::UnsupportedVersion(42))));
  }

  #[test]
  fn corrupt_ledger_is_a_parse_error() {
    let (_temp, store) = temp_ledger();
    fs::create_dir_all(store.dir()).unwrap();
    fs::write(store.path(&env()), "{").unwrap();
    assert!(matches!(store.load(&env()), Err(LedgerError::Parse { .. })));
  }
}
