//! Error taxonomy shared across the crate.
//!
//! Module-level errors (`ResolveError`, `PersistenceError`, `LedgerError`,
//! `LockError`, `ConfigError`) live next to the code that raises them; this
//! module holds the cross-cutting ones and the crate-level [`Error`].

use thiserror::Error;

use crate::config::ConfigError;
use crate::driver::DriverKind;
use crate::execute::lock::LockError;
use crate::ledger::LedgerError;
use crate::manifest::PersistenceError;
use crate::request::RequestError;
use crate::resolve::ResolveError;

/// Requests that cannot coexist in one environment. Always raised before any
/// tool is invoked, except `InstalledVersion`, which `Environment::record`
/// raises when tool-reported package sets disagree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
  #[error("requests target different environments: {first} and {second}")]
  MixedEnvironments { first: String, second: String },

  #[error("{package} requested with incompatible versions {first} and {second}")]
  IncompatibleVersions {
    package: String,
    first: String,
    second: String,
  },

  #[error("{package} requested with different variants")]
  VariantMismatch { package: String },

  #[error("{package} requested with different toolchains {first} and {second}")]
  ToolchainMismatch {
    package: String,
    first: String,
    second: String,
  },

  #[error("{package} requested with different drivers {first} and {second}")]
  DriverMismatch {
    package: String,
    first: DriverKind,
    second: DriverKind,
  },

  #[error("dependency cycle between {}", members.join(", "))]
  Cycle { members: Vec<String> },

  #[error("{package} is installed at {existing}, cannot also install {incoming}")]
  InstalledVersion {
    package: String,
    existing: String,
    incoming: String,
  },
}

/// A failure worth retrying: network hiccups, timeouts, lock contention.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transient failure building {request}: {reason}")]
pub struct TransientBuildError {
  pub request: String,
  pub reason: String,
}

impl TransientBuildError {
  /// Give up on a transient failure after `attempts` tries.
  pub fn escalate(self, attempts: u32) -> FatalBuildError {
    FatalBuildError {
      request: self.request,
      reason: format!("{} (gave up after {} attempts)", self.reason, attempts),
      attempts,
    }
  }
}

/// A failure that retrying will not fix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fatal failure building {request}: {reason}")]
pub struct FatalBuildError {
  pub request: String,
  pub reason: String,
  pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  #[error(transparent)]
  Transient(#[from] TransientBuildError),

  #[error(transparent)]
  Fatal(#[from] FatalBuildError),
}

impl BuildError {
  pub fn is_transient(&self) -> bool {
    matches!(self, BuildError::Transient(_))
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Request(#[from] RequestError),

  #[error(transparent)]
  Conflict(#[from] ConflictError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Persistence(#[from] PersistenceError),

  #[error(transparent)]
  Ledger(#[from] LedgerError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cycle_error_lists_members() {
    let err = ConflictError::Cycle {
      members: vec!["a".to_string(), "b".to_string(), "c".to_string()],
    };
    assert_eq!(err.to_string(), "dependency cycle between a, b, c");
  }

  #[test]
  fn escalate_keeps_request_and_counts_attempts() {
    let transient = TransientBuildError {
      request: "zlib@1.3".to_string(),
      reason: "timed out".to_string(),
    };
    let fatal = transient.escalate(3);
    assert_eq!(fatal.request, "zlib@1.3");
    assert_eq!(fatal.attempts, 3);
    assert_eq!(fatal.reason, "timed out (gave up after 3 attempts)");
  }

  #[test]
  fn crate_error_wraps_conflict_transparently() {
    let err: Error = ConflictError::VariantMismatch {
      package: "hdf5".to_string(),
    }
    .into();
    assert_eq!(err.to_string(), "hdf5 requested with different variants");
  }
}
