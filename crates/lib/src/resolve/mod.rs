//! Environment resolver.
//!
//! Turns a set of [`BuildRequest`]s for one environment into a [`BuildPlan`]:
//! duplicates are merged, conflicts rejected, the dependency graph ordered and
//! a driver chosen for every request. Everything here runs before any tool is
//! invoked, so a `ConflictError` never leaves a half-built environment behind.

mod dag;
mod plan;
mod policy;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, info};

use crate::driver::{DriverKind, DriverRegistry};
use crate::error::ConflictError;
use crate::request::BuildRequest;

pub use dag::RequestDag;
pub use plan::{BuildPlan, Disposition, PlanStep};
pub use policy::BuildPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
  #[error(transparent)]
  Conflict(#[from] ConflictError),

  #[error("no build requests given")]
  Empty,

  #[error("no driver can build {request}")]
  NoDriver { request: String },

  #[error("driver {driver} cannot build {request}")]
  DriverUnavailable { request: String, driver: DriverKind },
}

impl ResolveError {
  pub fn is_conflict(&self) -> bool {
    matches!(self, ResolveError::Conflict(_))
  }
}

pub struct Resolver<'a> {
  registry: &'a DriverRegistry,
  policy: &'a BuildPolicy,
}

impl<'a> Resolver<'a> {
  pub fn new(registry: &'a DriverRegistry, policy: &'a BuildPolicy) -> Self {
    Self { registry, policy }
  }

  /// Resolve requests into a plan.
  ///
  /// # Errors
  ///
  /// - `Conflict` when requests span environments, disagree on a package or
  ///   form a dependency cycle.
  /// - `NoDriver` / `DriverUnavailable` when a required request cannot be
  ///   built. Optional requests are skipped instead.
  pub fn resolve(&self, requests: Vec<BuildRequest>) -> Result<BuildPlan, ResolveError> {
    let environment = requests.first().ok_or(ResolveError::Empty)?.environment().clone();
    for request in &requests {
      if request.environment() != &environment {
        return Err(
          ConflictError::MixedEnvironments {
            first: environment.to_string(),
            second: request.environment().to_string(),
          }
          .into(),
        );
      }
    }

    let submitted = requests.len();
    let mut merged = merge(requests)?;
    let dag = RequestDag::from_requests(merged.values())?;

    let mut steps = Vec::with_capacity(merged.len());
    let mut skipped: BTreeSet<String> = BTreeSet::new();
    for name in dag.topological_order() {
      let Some(request) = merged.remove(&name) else {
        continue;
      };
      let dependencies = dag.dependencies(&name);

      let disposition = if let Some(dep) = dependencies.iter().find(|d| skipped.contains(*d)) {
        Disposition::SkipDependency(dep.clone())
      } else if let Some(reason) = self.policy.check(&request) {
        Disposition::Skip(reason)
      } else {
        match self.select_driver(&request) {
          Ok(kind) => Disposition::Build(kind),
          Err(e) if request.is_optional() => {
            info!(request = %request.key(), reason = %e, "skipping optional request");
            Disposition::Skip(e.to_string())
          }
          Err(e) => return Err(e),
        }
      };

      if !matches!(disposition, Disposition::Build(_)) {
        skipped.insert(name.clone());
      }
      debug!(request = %request.key(), disposition = %disposition, "planned");
      steps.push(PlanStep {
        request,
        disposition,
        dependencies,
      });
    }

    info!(
      environment = %environment,
      requests = submitted,
      steps = steps.len(),
      skipped = skipped.len(),
      "resolved build plan"
    );
    Ok(BuildPlan::new(environment, steps, dag.waves()))
  }

  /// Explicit driver first, then the registry's priority order.
  fn select_driver(&self, request: &BuildRequest) -> Result<DriverKind, ResolveError> {
    if let Some(kind) = request.preferred_driver() {
      return match self.registry.get(kind) {
        Some(driver) if driver.can_satisfy(request) => Ok(kind),
        _ => Err(ResolveError::DriverUnavailable {
          request: request.key(),
          driver: kind,
        }),
      };
    }

    self
      .registry
      .priority()
      .into_iter()
      .find(|driver| driver.can_satisfy(request))
      .map(|driver| driver.kind())
      .ok_or_else(|| ResolveError::NoDriver { request: request.key() })
  }
}

/// Collapse requests for the same package into one, rejecting the ones that
/// cannot coexist.
fn merge(requests: Vec<BuildRequest>) -> Result<BTreeMap<String, BuildRequest>, ConflictError> {
  let mut merged: BTreeMap<String, BuildRequest> = BTreeMap::new();

  for request in requests {
    match merged.entry(request.name().to_string()) {
      Entry::Vacant(slot) => {
        slot.insert(request);
      }
      Entry::Occupied(mut slot) => {
        let existing = slot.get();
        let package = request.name().to_string();

        if existing.variants() != request.variants() {
          return Err(ConflictError::VariantMismatch { package });
        }
        if let (Some(first), Some(second)) = (existing.preferred_driver(), request.preferred_driver())
          && first != second
        {
          return Err(ConflictError::DriverMismatch { package, first, second });
        }
        if let (Some(first), Some(second)) = (existing.toolchain(), request.toolchain())
          && first != second
        {
          return Err(ConflictError::ToolchainMismatch {
            package,
            first: first.to_string(),
            second: second.to_string(),
          });
        }

        let combined = existing
          .merged_with(&request)
          .ok_or_else(|| ConflictError::IncompatibleVersions {
            package: package.clone(),
            first: existing.version().to_string(),
            second: request.version().to_string(),
          })?;
        debug!(package = %package, version = %combined.version(), "merged duplicate request");
        slot.insert(combined);
      }
    }
  }

  Ok(merged)
}
