//! The result of one build request.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::DriverKind;
use crate::error::{BuildError, FatalBuildError, TransientBuildError};
use crate::request::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
  Succeeded,
  Failed,
  Skipped,
}

impl fmt::Display for OutcomeStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OutcomeStatus::Succeeded => write!(f, "succeeded"),
      OutcomeStatus::Failed => write!(f, "failed"),
      OutcomeStatus::Skipped => write!(f, "skipped"),
    }
  }
}

/// Whether a failed build is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
  Transient,
  Fatal,
}

/// A package a driver reports as present in the environment prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstalledPackage {
  pub name: String,
  pub version: Version,
  pub driver: DriverKind,
}

impl InstalledPackage {
  pub fn new(name: impl Into<String>, version: Version, driver: DriverKind) -> Self {
    Self {
      name: name.into(),
      version,
      driver,
    }
  }
}

impl fmt::Display for InstalledPackage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{} ({})", self.name, self.version, self.driver)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
  pub status: OutcomeStatus,
  pub reason: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failure: Option<FailureKind>,
  /// Captured tool output for the attempt that produced this outcome.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub log: Option<PathBuf>,
  #[serde(default)]
  pub installed: Vec<InstalledPackage>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub exit_code: Option<i32>,
  #[serde(default)]
  pub duration: Duration,
}

impl Outcome {
  pub fn succeeded(installed: Vec<InstalledPackage>) -> Self {
    Self {
      status: OutcomeStatus::Succeeded,
      reason: None,
      failure: None,
      log: None,
      installed,
      exit_code: Some(0),
      duration: Duration::ZERO,
    }
  }

  pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
    Self {
      status: OutcomeStatus::Failed,
      reason: Some(reason.into()),
      failure: Some(kind),
      log: None,
      installed: Vec::new(),
      exit_code: None,
      duration: Duration::ZERO,
    }
  }

  pub fn transient(reason: impl Into<String>) -> Self {
    Self::failed(FailureKind::Transient, reason)
  }

  pub fn fatal(reason: impl Into<String>) -> Self {
    Self::failed(FailureKind::Fatal, reason)
  }

  pub fn skipped(reason: impl Into<String>) -> Self {
    Self {
      status: OutcomeStatus::Skipped,
      reason: Some(reason.into()),
      failure: None,
      log: None,
      installed: Vec::new(),
      exit_code: None,
      duration: Duration::ZERO,
    }
  }

  pub fn with_log(mut self, log: PathBuf) -> Self {
    self.log = Some(log);
    self
  }

  pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
    self.exit_code = code;
    self
  }

  pub fn with_duration(mut self, duration: Duration) -> Self {
    self.duration = duration;
    self
  }

  pub fn is_success(&self) -> bool {
    self.status == OutcomeStatus::Succeeded
  }

  pub fn is_transient(&self) -> bool {
    self.failure == Some(FailureKind::Transient)
  }

  /// The error form of a failed outcome, keyed by request.
  pub fn error(&self, request: &str, attempts: u32) -> Option<BuildError> {
    if self.status != OutcomeStatus::Failed {
      return None;
    }
    let reason = self.reason.clone().unwrap_or_else(|| "unknown failure".to_string());
    Some(match self.failure {
      Some(FailureKind::Transient) => TransientBuildError {
        request: request.to_string(),
        reason,
      }
      .into(),
      _ => FatalBuildError {
        request: request.to_string(),
        reason,
        attempts,
      }
      .into(),
    })
  }
}
