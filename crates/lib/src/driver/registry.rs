//! The set of drivers available to a resolver and orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::DriversConfig;

use super::{Driver, DriverKind, ToolDriver};

#[derive(Clone)]
pub struct DriverRegistry {
  drivers: BTreeMap<DriverKind, Arc<dyn Driver>>,
  priority: Vec<DriverKind>,
}

impl std::fmt::Debug for DriverRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DriverRegistry")
      .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
      .field("priority", &self.priority)
      .finish()
  }
}

impl DriverRegistry {
  /// An empty registry. Kinds missing from `priority` are tried last, in
  /// [`DriverKind`] order.
  pub fn new(priority: Vec<DriverKind>) -> Self {
    Self {
      drivers: BTreeMap::new(),
      priority,
    }
  }

  /// One [`ToolDriver`] per kind, configured from `config`.
  pub fn from_config(config: &DriversConfig) -> Self {
    let mut registry = Self::new(config.priority.clone());
    for kind in DriverKind::ALL {
      let driver = ToolDriver::new(kind, config.settings(kind), &config.passthrough_env);
      registry.register(Arc::new(driver));
    }
    registry
  }

  /// Add a driver, replacing any previous driver of the same kind.
  pub fn register(&mut self, driver: Arc<dyn Driver>) {
    let kind = driver.kind();
    if self.drivers.insert(kind, driver).is_some() {
      debug!(driver = %kind, "replaced driver");
    }
  }

  pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
    self.register(driver);
    self
  }

  pub fn get(&self, kind: DriverKind) -> Option<&Arc<dyn Driver>> {
    self.drivers.get(&kind)
  }

  /// Registered drivers in the order they should be tried.
  pub fn priority(&self) -> Vec<&Arc<dyn Driver>> {
    let mut order: Vec<DriverKind> = Vec::new();
    for kind in self.priority.iter().copied().chain(DriverKind::ALL) {
      if !order.contains(&kind) {
        order.push(kind);
      }
    }
    order.into_iter().filter_map(|kind| self.drivers.get(&kind)).collect()
  }

  pub fn is_empty(&self) -> bool {
    self.drivers.is_empty()
  }
}
