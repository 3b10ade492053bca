//! Types for orchestrating a build run.
//!
//! Per-request state machine, skip causes and the report handed back to the
//! caller once a run finishes.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::warn;

use crate::driver::DriverKind;
use crate::environment::{Environment, EnvironmentStatus, Outcome};
use crate::error::FatalBuildError;
use crate::ledger::{LedgerError, LedgerStatus};
use crate::manifest::{ManifestId, PersistenceError};
use crate::request::BuildRequest;

/// Lifecycle of one request.
///
/// ```text
/// Pending -> Running -> Succeeded
///               |  \--> Failed
///               v        ^
///           Retrying ----/
///               |
///               v
///            Running
/// Pending -> Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
  Pending,
  Running,
  Retrying,
  Succeeded,
  Failed,
  Skipped,
}

impl RequestState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, RequestState::Succeeded | RequestState::Failed | RequestState::Skipped)
  }

  pub fn can_transition_to(&self, next: RequestState) -> bool {
    use RequestState::*;
    matches!(
      (self, next),
      (Pending, Running)
        | (Pending, Skipped)
        | (Running, Succeeded)
        | (Running, Failed)
        | (Running, Retrying)
        | (Retrying, Running)
        // Cancelled while waiting to retry.
        | (Retrying, Failed)
    )
  }
}

impl fmt::Display for RequestState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      RequestState::Pending => "pending",
      RequestState::Running => "running",
      RequestState::Retrying => "retrying",
      RequestState::Succeeded => "succeeded",
      RequestState::Failed => "failed",
      RequestState::Skipped => "skipped",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
  #[error("unknown request: {0}")]
  UnknownRequest(String),

  #[error("illegal transition for {request}: {from} -> {to}")]
  IllegalTransition {
    request: String,
    from: RequestState,
    to: RequestState,
  },
}

/// Current state of every request in a run.
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
  states: BTreeMap<String, RequestState>,
}

impl StateTracker {
  pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
    Self {
      states: names.into_iter().map(|n| (n.to_string(), RequestState::Pending)).collect(),
    }
  }

  pub fn state(&self, name: &str) -> Option<RequestState> {
    self.states.get(name).copied()
  }

  /// Move a request to `next`. Illegal moves leave the state untouched.
  pub fn transition(&mut self, name: &str, next: RequestState) -> Result<RequestState, StateError> {
    let current = self
      .states
      .get_mut(name)
      .ok_or_else(|| StateError::UnknownRequest(name.to_string()))?;
    let previous = *current;
    if !previous.can_transition_to(next) {
      warn!(request = %name, from = %previous, to = %next, "rejected state transition");
      return Err(StateError::IllegalTransition {
        request: name.to_string(),
        from: previous,
        to: next,
      });
    }
    *current = next;
    Ok(previous)
  }

  pub fn count(&self, state: RequestState) -> usize {
    self.states.values().filter(|s| **s == state).count()
  }

  pub fn all_terminal(&self) -> bool {
    self.states.values().all(RequestState::is_terminal)
  }
}

/// Why a request was never built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipCause {
  /// Build policy, or no driver for an optional request.
  Policy,
  /// A dependency was skipped without failing.
  SkippedDependency(String),
  /// A dependency failed or was skipped because of a failure.
  FailedDependency(String),
  /// The run was cancelled before the request started.
  Cancelled,
  /// The status ledger recorded a previous error or skip.
  Ledger(LedgerStatus),
}

impl SkipCause {
  /// Whether this skip makes a required request count as not built.
  pub fn fails_environment(&self) -> bool {
    match self {
      SkipCause::Policy | SkipCause::SkippedDependency(_) | SkipCause::Cancelled => false,
      SkipCause::FailedDependency(_) => true,
      SkipCause::Ledger(status) => *status == LedgerStatus::Error,
    }
  }
}

impl fmt::Display for SkipCause {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SkipCause::Policy => f.write_str("policy"),
      SkipCause::SkippedDependency(dep) => write!(f, "skipped dependency {}", dep),
      SkipCause::FailedDependency(dep) => write!(f, "failed dependency {}", dep),
      SkipCause::Cancelled => f.write_str("cancelled"),
      SkipCause::Ledger(status) => write!(f, "ledger status {}", status),
    }
  }
}

/// Final record of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestReport {
  pub request: BuildRequest,
  pub driver: Option<DriverKind>,
  pub state: RequestState,
  /// Driver invocations made; 0 for skipped and reused requests.
  pub attempts: u32,
  pub outcome: Outcome,
  /// Set when the request ended `Failed`.
  pub error: Option<FatalBuildError>,
  pub skip: Option<SkipCause>,
  /// Success taken from the status ledger without running the driver.
  pub reused: bool,
}

impl RequestReport {
  pub fn name(&self) -> &str {
    self.request.name()
  }

  pub fn key(&self) -> String {
    self.request.key()
  }

  /// Whether this request keeps a required environment from succeeding.
  pub fn blocks_environment(&self) -> bool {
    if self.request.is_optional() {
      return false;
    }
    match self.state {
      RequestState::Failed => true,
      RequestState::Skipped => self.skip.as_ref().is_some_and(SkipCause::fails_environment),
      _ => false,
    }
  }
}

#[derive(Debug)]
pub enum ManifestStatus {
  Saved(ManifestId),
  /// The environment did not succeed, or no store is configured.
  NotSaved,
  /// Every request succeeded but the manifest could not be written.
  Degraded(PersistenceError),
}

impl ManifestStatus {
  pub fn id(&self) -> Option<&ManifestId> {
    match self {
      ManifestStatus::Saved(id) => Some(id),
      _ => None,
    }
  }
}

/// Result of running a build plan.
#[derive(Debug)]
pub struct BuildReport {
  /// Recorded outcomes, including failed and skipped entries.
  pub environment: Environment,
  /// One report per plan step, in plan order.
  pub requests: Vec<RequestReport>,
  pub manifest: ManifestStatus,
  /// Set when the status ledger could not be written back.
  pub ledger_error: Option<LedgerError>,
}

impl BuildReport {
  pub fn status(&self) -> EnvironmentStatus {
    self.environment.status
  }

  pub fn is_success(&self) -> bool {
    self.status() == EnvironmentStatus::Succeeded
  }

  /// Success whose manifest could not be persisted.
  pub fn is_degraded(&self) -> bool {
    self.is_success() && matches!(self.manifest, ManifestStatus::Degraded(_))
  }

  pub fn request(&self, name: &str) -> Option<&RequestReport> {
    self.requests.iter().find(|r| r.name() == name)
  }

  pub fn in_state(&self, state: RequestState) -> impl Iterator<Item = &RequestReport> {
    self.requests.iter().filter(move |r| r.state == state)
  }

  pub fn count(&self, state: RequestState) -> usize {
    self.in_state(state).count()
  }
}
