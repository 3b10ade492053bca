//! Plan-time rules that skip requests instead of building them.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::config::PolicyConfig;
use crate::request::{BuildRequest, Version};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildPolicy {
  min_toolchains: Option<BTreeMap<String, Version>>,
  include: BTreeSet<String>,
  exclude: BTreeSet<String>,
}

impl BuildPolicy {
  /// A policy that skips nothing.
  pub fn permissive() -> Self {
    Self::default()
  }

  pub fn from_config(config: &PolicyConfig) -> Self {
    Self {
      min_toolchains: config.min_toolchains.clone(),
      include: config.include.iter().cloned().collect(),
      exclude: config.exclude.iter().cloned().collect(),
    }
  }

  pub fn with_min_toolchain(mut self, name: impl Into<String>, version: Version) -> Self {
    self
      .min_toolchains
      .get_or_insert_with(BTreeMap::new)
      .insert(name.into(), version);
    self
  }

  pub fn including(mut self, category: impl Into<String>) -> Self {
    self.include.insert(category.into());
    self
  }

  pub fn excluding(mut self, category: impl Into<String>) -> Self {
    self.exclude.insert(category.into());
    self
  }

  /// The reason `request` should be skipped, if any.
  pub fn check(&self, request: &BuildRequest) -> Option<String> {
    let reason = self.check_toolchain(request).or_else(|| self.check_category(request));
    if let Some(reason) = &reason {
      debug!(request = %request.key(), reason = %reason, "policy skip");
    }
    reason
  }

  fn check_toolchain(&self, request: &BuildRequest) -> Option<String> {
    let minimums = self.min_toolchains.as_ref()?;

    if let Some(toolchain) = request.toolchain() {
      match minimums.get(&toolchain.name) {
        None => return Some(format!("toolchain not supported: {}", toolchain)),
        Some(min) if toolchain.version < *min => return Some(format!("toolchain version too old: {}", toolchain)),
        Some(_) => {}
      }
    }

    // Building a toolchain itself is subject to the same minimum.
    if let (Some(min), Some(pin)) = (minimums.get(request.name()), request.version().pinned())
      && pin < min
    {
      return Some(format!("toolchain version too old: {}/{}", request.name(), pin));
    }

    None
  }

  /// A non-empty include list replaces the exclude list entirely.
  fn check_category(&self, request: &BuildRequest) -> Option<String> {
    let category = request.category();
    if !self.include.is_empty() {
      return (!category.is_some_and(|c| self.include.contains(c)))
        .then(|| "module class not included via include".to_string());
    }
    if category.is_some_and(|c| self.exclude.contains(c)) {
      return Some("module class excluded via exclude".to_string());
    }
    None
  }
}
