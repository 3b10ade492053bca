//! Build requests: what the caller asks to have installed.
//!
//! A `BuildRequest` names one package, a version constraint, tool-neutral
//! variants and the target environment it installs into. Requests are built
//! once with the `with_*` methods and never mutated after submission.

pub mod version;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::DriverKind;

pub use version::{Version, VersionConstraint, VersionError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
  #[error("invalid package name {0:?}")]
  InvalidName(String),

  #[error("invalid environment id {0:?}: use letters, digits, '.', '-' or '_'")]
  InvalidEnvironment(String),

  #[error(transparent)]
  Version(#[from] VersionError),
}

/// Identifier of a target environment, safe to use as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvironmentId(String);

impl EnvironmentId {
  pub fn new(id: impl Into<String>) -> Result<Self, RequestError> {
    let id = id.into();
    let valid = !id.is_empty()
      && !id.starts_with('.')
      && id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
      Ok(Self(id))
    } else {
      Err(RequestError::InvalidEnvironment(id))
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for EnvironmentId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl FromStr for EnvironmentId {
  type Err = RequestError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::new(s)
  }
}

impl TryFrom<String> for EnvironmentId {
  type Error = RequestError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::new(value)
  }
}

impl From<EnvironmentId> for String {
  fn from(value: EnvironmentId) -> Self {
    value.0
  }
}

/// Compiler toolchain a package is built with, e.g. `foss/2023a` or `GCCcore/13.2.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Toolchain {
  pub name: String,
  pub version: Version,
}

impl Toolchain {
  pub fn new(name: impl Into<String>, version: &str) -> Result<Self, RequestError> {
    Ok(Self {
      name: name.into(),
      version: Version::parse(version)?,
    })
  }

  /// The `system` toolchain means "no toolchain" to EasyBuild.
  pub fn is_system(&self) -> bool {
    self.name == "system"
  }
}

impl fmt::Display for Toolchain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.name, self.version)
  }
}

/// A request to install one package into one target environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
  name: String,
  version: VersionConstraint,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  variants: BTreeMap<String, String>,
  environment: EnvironmentId,
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  dependencies: BTreeSet<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  driver: Option<DriverKind>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  toolchain: Option<Toolchain>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  category: Option<String>,
  #[serde(default)]
  optional: bool,
}

impl BuildRequest {
  pub fn new(name: impl Into<String>, version: VersionConstraint, environment: EnvironmentId) -> Result<Self, RequestError> {
    let name = name.into();
    if !is_valid_name(&name) {
      return Err(RequestError::InvalidName(name));
    }
    Ok(Self {
      name,
      version,
      variants: BTreeMap::new(),
      environment,
      dependencies: BTreeSet::new(),
      driver: None,
      toolchain: None,
      category: None,
      optional: false,
    })
  }

  /// Shorthand for `new` with the constraint given as text (`"1.0"`, `">=2,<3"`, `"*"`).
  pub fn parse(name: impl Into<String>, version: &str, environment: &EnvironmentId) -> Result<Self, RequestError> {
    Self::new(name, VersionConstraint::parse(version)?, environment.clone())
  }

  pub fn with_variant(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.variants.insert(key.into(), value.into());
    self
  }

  pub fn depends_on(mut self, package: impl Into<String>) -> Self {
    self.dependencies.insert(package.into());
    self
  }

  pub fn with_driver(mut self, driver: DriverKind) -> Self {
    self.driver = Some(driver);
    self
  }

  pub fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
    self.toolchain = Some(toolchain);
    self
  }

  pub fn with_category(mut self, category: impl Into<String>) -> Self {
    self.category = Some(category.into());
    self
  }

  /// Optional requests may fail without failing the environment.
  pub fn optional(mut self) -> Self {
    self.optional = true;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn version(&self) -> &VersionConstraint {
    &self.version
  }

  pub fn variants(&self) -> &BTreeMap<String, String> {
    &self.variants
  }

  pub fn environment(&self) -> &EnvironmentId {
    &self.environment
  }

  pub fn dependencies(&self) -> &BTreeSet<String> {
    &self.dependencies
  }

  pub fn preferred_driver(&self) -> Option<DriverKind> {
    self.driver
  }

  pub fn toolchain(&self) -> Option<&Toolchain> {
    self.toolchain.as_ref()
  }

  pub fn category(&self) -> Option<&str> {
    self.category.as_deref()
  }

  pub fn is_optional(&self) -> bool {
    self.optional
  }

  /// `name@constraint`, the identity used by the ledger and in logs.
  pub fn key(&self) -> String {
    format!("{}@{}", self.name, self.version)
  }

  /// Filesystem-safe form of the key for build directories.
  pub fn slug(&self) -> String {
    self
      .key()
      .chars()
      .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
      .collect()
  }

  /// Merge a compatible duplicate into this request: constraints are
  /// intersected and dependencies unioned. Returns `None` when the version
  /// constraints are disjoint.
  pub(crate) fn merged_with(&self, other: &BuildRequest) -> Option<BuildRequest> {
    let version = self.version.intersect(&other.version)?;
    let mut merged = self.clone();
    merged.version = version;
    merged.dependencies.extend(other.dependencies.iter().cloned());
    merged.driver = self.driver.or(other.driver);
    merged.toolchain = self.toolchain.clone().or_else(|| other.toolchain.clone());
    merged.category = self.category.clone().or_else(|| other.category.clone());
    merged.optional = self.optional && other.optional;
    Some(merged)
  }
}

impl fmt::Display for BuildRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.key())?;
    if let Some(tc) = &self.toolchain {
      write!(f, " ({})", tc)?;
    }
    Ok(())
  }
}

fn is_valid_name(name: &str) -> bool {
  !name.is_empty()
    && name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'))
}
