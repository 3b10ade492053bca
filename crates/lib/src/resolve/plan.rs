//! The resolver's output: what to build, with which driver, in which order.

use std::collections::BTreeSet;
use std::fmt;

use crate::driver::DriverKind;
use crate::request::{BuildRequest, EnvironmentId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
  Build(DriverKind),
  /// Not built; the reason ends up in the request's outcome.
  Skip(String),
  /// Not built because this in-plan dependency is skipped.
  SkipDependency(String),
}

impl fmt::Display for Disposition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Disposition::Build(kind) => write!(f, "build with {}", kind),
      Disposition::Skip(reason) => write!(f, "skip ({})", reason),
      Disposition::SkipDependency(dep) => write!(f, "skip (dependency skipped: {})", dep),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
  pub request: BuildRequest,
  pub disposition: Disposition,
  /// Names of in-plan packages this step waits for.
  pub dependencies: BTreeSet<String>,
}

impl PlanStep {
  pub fn name(&self) -> &str {
    self.request.name()
  }

  pub fn driver(&self) -> Option<DriverKind> {
    match self.disposition {
      Disposition::Build(kind) => Some(kind),
      Disposition::Skip(_) | Disposition::SkipDependency(_) => None,
    }
  }

  pub fn skip_reason(&self) -> Option<String> {
    match &self.disposition {
      Disposition::Skip(reason) => Some(reason.clone()),
      Disposition::SkipDependency(dep) => Some(format!("dependency skipped: {}", dep)),
      Disposition::Build(_) => None,
    }
  }
}

/// Steps in topological order plus the parallel waves they form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
  environment: EnvironmentId,
  steps: Vec<PlanStep>,
  waves: Vec<Vec<String>>,
}

impl BuildPlan {
  pub(crate) fn new(environment: EnvironmentId, steps: Vec<PlanStep>, waves: Vec<Vec<String>>) -> Self {
    Self {
      environment,
      steps,
      waves,
    }
  }

  pub fn environment(&self) -> &EnvironmentId {
    &self.environment
  }

  pub fn steps(&self) -> &[PlanStep] {
    &self.steps
  }

  pub fn waves(&self) -> &[Vec<String>] {
    &self.waves
  }

  pub fn step(&self, name: &str) -> Option<&PlanStep> {
    self.steps.iter().find(|s| s.name() == name)
  }

  /// Names in build order.
  pub fn order(&self) -> Vec<&str> {
    self.steps.iter().map(PlanStep::name).collect()
  }

  pub fn to_build(&self) -> impl Iterator<Item = &PlanStep> {
    self.steps.iter().filter(|s| s.driver().is_some())
  }

  pub fn skipped(&self) -> impl Iterator<Item = &PlanStep> {
    self.steps.iter().filter(|s| s.driver().is_none())
  }

  /// Direct dependents of `name` within the plan.
  pub fn dependents(&self, name: &str) -> Vec<&str> {
    self
      .steps
      .iter()
      .filter(|s| s.dependencies.contains(name))
      .map(PlanStep::name)
      .collect()
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }
}
