//! Target environments and the outcomes recorded into them.
//!
//! An `Environment` accumulates one entry per build request. Its package map
//! is the union of every successful entry's installed set, and it never holds
//! the same package at two different versions.

mod outcome;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::driver::DriverKind;
use crate::error::ConflictError;
use crate::request::{BuildRequest, EnvironmentId, Version};

pub use outcome::{FailureKind, InstalledPackage, Outcome, OutcomeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
  Pending,
  Building,
  Succeeded,
  Failed,
  Cancelled,
}

impl fmt::Display for EnvironmentStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      EnvironmentStatus::Pending => "pending",
      EnvironmentStatus::Building => "building",
      EnvironmentStatus::Succeeded => "succeeded",
      EnvironmentStatus::Failed => "failed",
      EnvironmentStatus::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentEntry {
  pub request: BuildRequest,
  /// `None` when the request was skipped before a driver was chosen.
  pub driver: Option<DriverKind>,
  pub outcome: Outcome,
}

/// Version and origin of a package present in an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePin {
  pub version: Version,
  pub driver: DriverKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
  pub id: EnvironmentId,
  pub status: EnvironmentStatus,
  entries: Vec<EnvironmentEntry>,
}

impl Environment {
  pub fn new(id: EnvironmentId) -> Self {
    Self {
      id,
      status: EnvironmentStatus::Pending,
      entries: Vec::new(),
    }
  }

  pub(crate) fn from_entries(id: EnvironmentId, status: EnvironmentStatus, entries: Vec<EnvironmentEntry>) -> Self {
    Self { id, status, entries }
  }

  pub fn entries(&self) -> &[EnvironmentEntry] {
    &self.entries
  }

  pub fn entry(&self, name: &str) -> Option<&EnvironmentEntry> {
    self.entries.iter().find(|e| e.request.name() == name)
  }

  /// Append an outcome. Rejects it when a reported package is already
  /// present at a different version, leaving the environment unchanged.
  pub fn record(
    &mut self,
    request: BuildRequest,
    driver: Option<DriverKind>,
    outcome: Outcome,
  ) -> Result<(), ConflictError> {
    let mut incoming: BTreeMap<&str, &Version> = BTreeMap::new();
    for pkg in &outcome.installed {
      if let Some(previous) = incoming.insert(&pkg.name, &pkg.version)
        && previous != &pkg.version
      {
        return Err(ConflictError::InstalledVersion {
          package: pkg.name.clone(),
          existing: previous.to_string(),
          incoming: pkg.version.to_string(),
        });
      }
    }

    let current = self.packages();
    for (name, version) in &incoming {
      if let Some(pin) = current.get(*name)
        && &pin.version != *version
      {
        return Err(ConflictError::InstalledVersion {
          package: name.to_string(),
          existing: pin.version.to_string(),
          incoming: version.to_string(),
        });
      }
    }

    self.entries.push(EnvironmentEntry {
      request,
      driver,
      outcome,
    });
    Ok(())
  }

  /// Every package installed by a successful entry.
  pub fn packages(&self) -> BTreeMap<String, PackagePin> {
    self
      .entries
      .iter()
      .filter(|e| e.outcome.is_success())
      .flat_map(|e| e.outcome.installed.iter())
      .map(|pkg| {
        (
          pkg.name.clone(),
          PackagePin {
            version: pkg.version.clone(),
            driver: pkg.driver,
          },
        )
      })
      .collect()
  }

  pub fn count(&self, status: OutcomeStatus) -> usize {
    self.entries.iter().filter(|e| e.outcome.status == status).count()
  }
}
