//! Test utilities for metabuild-lib.
//!
//! A scriptable in-memory driver and helpers for writing fake tool
//! executables.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{BuildContext, Driver, DriverKind};
use crate::environment::{InstalledPackage, Outcome};
use crate::request::{BuildRequest, Version};

/// A driver that never spawns anything. Outcomes are scripted per package
/// name; unscripted builds succeed with the request's pinned version.
#[derive(Debug)]
pub struct FakeDriver {
  kind: DriverKind,
  accepts: Option<BTreeSet<String>>,
  scripted: Mutex<HashMap<String, VecDeque<Outcome>>>,
  fixed: HashMap<String, Outcome>,
  panics: BTreeSet<String>,
  delay: Option<Duration>,
  calls: Mutex<Vec<String>>,
  running: AtomicUsize,
  max_running: AtomicUsize,
}

impl FakeDriver {
  pub fn new(kind: DriverKind) -> Self {
    Self {
      kind,
      accepts: None,
      scripted: Mutex::new(HashMap::new()),
      fixed: HashMap::new(),
      panics: BTreeSet::new(),
      delay: None,
      calls: Mutex::new(Vec::new()),
      running: AtomicUsize::new(0),
      max_running: AtomicUsize::new(0),
    }
  }

  /// Only satisfy these package names.
  pub fn accepting(mut self, names: &[&str]) -> Self {
    self.accepts = Some(names.iter().map(|n| n.to_string()).collect());
    self
  }

  /// Outcomes returned for `name` in order, one per call.
  pub fn with_outcomes(self, name: &str, outcomes: Vec<Outcome>) -> Self {
    self
      .scripted
      .lock()
      .unwrap()
      .insert(name.to_string(), outcomes.into());
    self
  }

  /// Outcome returned for `name` on every call once scripted ones run out.
  pub fn always(mut self, name: &str, outcome: Outcome) -> Self {
    self.fixed.insert(name.to_string(), outcome);
    self
  }

  /// Building `name` panics.
  pub fn panicking_on(mut self, name: &str) -> Self {
    self.panics.insert(name.to_string());
    self
  }

  /// Each build sleeps this long, or until cancelled.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  /// Package names in the order builds started.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, name: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
  }

  /// Highest number of builds that were running at once.
  pub fn max_concurrency(&self) -> usize {
    self.max_running.load(Ordering::SeqCst)
  }

  fn next_outcome(&self, request: &BuildRequest) -> Outcome {
    if let Some(outcome) = self
      .scripted
      .lock()
      .unwrap()
      .get_mut(request.name())
      .and_then(VecDeque::pop_front)
    {
      return outcome;
    }
    if let Some(outcome) = self.fixed.get(request.name()) {
      return outcome.clone();
    }
    let version = request
      .version()
      .pinned()
      .cloned()
      .unwrap_or_else(|| Version::parse("1.0").unwrap());
    Outcome::succeeded(vec![InstalledPackage::new(request.name(), version, self.kind)])
  }
}

#[async_trait]
impl Driver for FakeDriver {
  fn kind(&self) -> DriverKind {
    self.kind
  }

  fn can_satisfy(&self, request: &BuildRequest) -> bool {
    self.accepts.as_ref().is_none_or(|a| a.contains(request.name()))
  }

  async fn build(&self, request: &BuildRequest, ctx: &BuildContext) -> Outcome {
    self.calls.lock().unwrap().push(request.name().to_string());
    if self.panics.contains(request.name()) {
      panic!("fake driver panicked building {}", request.name());
    }
    let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_running.fetch_max(now, Ordering::SeqCst);

    let cancelled = match self.delay {
      Some(delay) => {
        tokio::select! {
          _ = tokio::time::sleep(delay) => false,
          _ = ctx.cancel.cancelled() => true,
        }
      }
      None => false,
    };

    self.running.fetch_sub(1, Ordering::SeqCst);
    if cancelled {
      return Outcome::fatal("install cancelled");
    }
    self.next_outcome(request)
  }
}

/// Write an executable script into `dir` and return its path.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
  use std::os::unix::fs::PermissionsExt;

  let path = dir.join(name);
  std::fs::write(&path, body).unwrap();
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  path
}
