//! Build orchestration.
//!
//! The [`Orchestrator`] runs a [`BuildPlan`]:
//! - requests whose dependencies have all succeeded are started right away,
//!   bounded by a semaphore of `parallelism` permits
//! - transient failures are retried with exponential backoff, then escalated
//! - a failed or skipped request skips everything that depends on it
//! - cancellation stops scheduling and lets running tools wind down
//!
//! The resulting environment is saved to the manifest store when every
//! required request succeeded.

pub mod cancel;
pub mod lock;
mod types;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{BuildSettings, Config, ConfigError, LedgerSettings};
use crate::driver::{BuildContext, Driver, DriverKind, DriverRegistry};
use crate::environment::{Environment, EnvironmentStatus, FailureKind, InstalledPackage, Outcome, OutcomeStatus};
use crate::error::{BuildError, Error, FatalBuildError};
use crate::ledger::{EnvironmentLedger, LedgerStatus, StatusLedger};
use crate::manifest::{ManifestStore, PersistenceError};
use crate::paths::DataLayout;
use crate::request::BuildRequest;
use crate::resolve::{BuildPlan, BuildPolicy, Disposition, PlanStep, ResolveError, Resolver};

use cancel::CancelSignal;
use lock::{EnvironmentLock, EnvironmentLocks};

pub use types::{
  BuildReport, ManifestStatus, RequestReport, RequestState, SkipCause, StateError, StateTracker,
};

#[derive(Debug, Clone)]
pub struct Orchestrator {
  registry: Arc<DriverRegistry>,
  policy: BuildPolicy,
  settings: BuildSettings,
  layout: DataLayout,
  store: Option<ManifestStore>,
  ledger: Option<StatusLedger>,
  ledger_settings: LedgerSettings,
  locks: EnvironmentLocks,
}

impl Orchestrator {
  /// An orchestrator with default settings, a permissive policy, a manifest
  /// store under `layout` and no status ledger.
  pub fn new(registry: DriverRegistry, layout: DataLayout) -> Self {
    Self {
      registry: Arc::new(registry),
      policy: BuildPolicy::permissive(),
      settings: BuildSettings::default(),
      store: Some(ManifestStore::new(layout.manifests())),
      ledger: None,
      ledger_settings: LedgerSettings::default(),
      layout,
      locks: EnvironmentLocks::new(),
    }
  }

  /// Everything from a loaded config: tool drivers, policy, settings, data
  /// root, manifest store and (when enabled) the status ledger.
  pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
    config.validate()?;
    let layout = DataLayout::new(config.data_root());
    let mut orchestrator = Self::new(DriverRegistry::from_config(&config.drivers), layout)
      .with_policy(BuildPolicy::from_config(&config.policy))
      .with_settings(config.build.clone());
    if config.ledger.enabled {
      let ledger = StatusLedger::new(orchestrator.layout.ledger());
      orchestrator = orchestrator.with_ledger(ledger, config.ledger.clone());
    }
    Ok(orchestrator)
  }

  pub fn with_policy(mut self, policy: BuildPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_settings(mut self, settings: BuildSettings) -> Self {
    self.settings = settings;
    self
  }

  pub fn with_store(mut self, store: ManifestStore) -> Self {
    self.store = Some(store);
    self
  }

  /// Never save manifests.
  pub fn without_store(mut self) -> Self {
    self.store = None;
    self
  }

  pub fn with_ledger(mut self, ledger: StatusLedger, settings: LedgerSettings) -> Self {
    self.ledger = Some(ledger);
    self.ledger_settings = settings;
    self
  }

  pub fn registry(&self) -> &DriverRegistry {
    &self.registry
  }

  pub fn settings(&self) -> &BuildSettings {
    &self.settings
  }

  pub fn layout(&self) -> &DataLayout {
    &self.layout
  }

  pub fn store(&self) -> Option<&ManifestStore> {
    self.store.as_ref()
  }

  /// Resolve requests without building anything.
  pub fn plan(&self, requests: Vec<BuildRequest>) -> Result<BuildPlan, ResolveError> {
    Resolver::new(&self.registry, &self.policy).resolve(requests)
  }

  /// Resolve and build. Conflicts surface here before any tool runs.
  pub async fn run(&self, requests: Vec<BuildRequest>) -> Result<BuildReport, Error> {
    self.run_with_cancel(requests, CancelSignal::never()).await
  }

  pub async fn run_with_cancel(&self, requests: Vec<BuildRequest>, cancel: CancelSignal) -> Result<BuildReport, Error> {
    let plan = self.plan(requests)?;
    self.execute(&plan, cancel).await
  }

  /// Build a resolved plan.
  ///
  /// Build failures never make this return `Err`; they are in the report.
  /// Errors are limited to an unreadable status ledger.
  pub async fn execute(&self, plan: &BuildPlan, cancel: CancelSignal) -> Result<BuildReport, Error> {
    let env_id = plan.environment().clone();
    let prefix = self.layout.environments().join(env_id.as_str());
    let build_root = self.layout.builds().join(env_id.as_str());
    let env_lock = self.locks.handle(&env_id, &prefix).await;
    let ledger = match &self.ledger {
      Some(store) => Some(store.load(&env_id)?),
      None => None,
    };

    info!(
      environment = %env_id,
      requests = plan.len(),
      waves = plan.waves().len(),
      parallelism = self.settings.parallelism,
      "starting build run"
    );

    let mut run = Run::new(plan, ledger, cancel.clone());
    let mut pending: Vec<&PlanStep> = Vec::new();
    for step in plan.steps() {
      if let Some(reason) = step.skip_reason() {
        let cause = match &step.disposition {
          Disposition::SkipDependency(dep) => SkipCause::SkippedDependency(dep.clone()),
          _ => SkipCause::Policy,
        };
        run.skip(step, cause, reason);
        continue;
      }
      match run.ledger.as_ref().and_then(|l| self.ledger_decision(l, step)) {
        Some(LedgerDecision::Reuse { installed, driver }) => run.reuse(step, installed, driver),
        Some(LedgerDecision::Skip { status, reason }) => run.skip(step, SkipCause::Ledger(status), reason),
        None => pending.push(step),
      }
    }

    let shared = Shared {
      semaphore: Arc::new(Semaphore::new(self.settings.parallelism.max(1))),
      cancel: cancel.clone(),
      env_lock,
      prefix,
      build_root,
    };
    let mut tasks = Tasks::default();

    loop {
      let mut waiting = Vec::with_capacity(pending.len());
      for step in pending.drain(..) {
        if let Some((cause, reason)) = run.blocked_by(step) {
          run.skip(step, cause, reason);
        } else if cancel.is_cancelled() || !run.dependencies_succeeded(step) {
          waiting.push(step);
        } else {
          self.spawn(&mut tasks, &mut run, step, &shared);
        }
      }
      pending = waiting;

      match tasks.join_next().await {
        Some(result) => run.finish(result),
        None => break,
      }
    }

    for step in pending {
      if !cancel.is_cancelled() {
        warn!(request = %step.request.key(), "request never became ready");
      }
      run.skip(step, SkipCause::Cancelled, "cancelled".to_string());
    }
    if !run.tracker.all_terminal() {
      error!(environment = %env_id, "run ended with requests in a non-terminal state");
    }

    let (mut report, ledger) = run.into_report();
    if let (Some(store), Some(ledger)) = (&self.ledger, ledger)
      && let Err(e) = store.save(&ledger)
    {
      warn!(environment = %env_id, error = %e, "failed to update status ledger");
      report.ledger_error = Some(e);
    }

    if report.is_success() {
      report.manifest = self.save_manifest(&report.environment).await;
    }

    info!(
      environment = %env_id,
      status = %report.status(),
      succeeded = report.count(RequestState::Succeeded),
      failed = report.count(RequestState::Failed),
      skipped = report.count(RequestState::Skipped),
      manifest = ?report.manifest.id(),
      "build run complete"
    );
    Ok(report)
  }

  fn ledger_decision(&self, ledger: &EnvironmentLedger, step: &PlanStep) -> Option<LedgerDecision> {
    let record = ledger.get(&step.request.key())?;
    let reason = record.reason.as_deref().unwrap_or("no reason recorded");
    match record.status {
      LedgerStatus::Success => Some(LedgerDecision::Reuse {
        installed: record.installed.clone(),
        driver: record.driver,
      }),
      LedgerStatus::Error if !self.ledger_settings.retry_failed => Some(LedgerDecision::Skip {
        status: LedgerStatus::Error,
        reason: format!("previous build failed: {}", reason),
      }),
      LedgerStatus::Skipped if !self.ledger_settings.recheck_skipped => Some(LedgerDecision::Skip {
        status: LedgerStatus::Skipped,
        reason: format!("previously skipped: {}", reason),
      }),
      _ => None,
    }
  }

  fn spawn(&self, tasks: &mut Tasks, run: &mut Run<'_>, step: &PlanStep, shared: &Shared) {
    let driver = step.driver().and_then(|kind| self.registry.get(kind).cloned().map(|d| (kind, d)));
    let Some((kind, driver)) = driver else {
      let reason = format!("driver {:?} is not registered", step.driver());
      error!(request = %step.request.key(), "{}", reason);
      run.transition(step.name(), RequestState::Running);
      run.settle(step, Settled::failed(step.driver(), 0, Outcome::fatal(reason)));
      return;
    };

    debug!(request = %step.request.key(), driver = %kind, "scheduling");
    let job = Job {
      request: step.request.clone(),
      kind,
      driver,
      settings: self.settings.clone(),
      semaphore: shared.semaphore.clone(),
      cancel: shared.cancel.clone(),
      env_lock: shared.env_lock.clone(),
      prefix: shared.prefix.clone(),
      build_root: shared.build_root.join(step.request.slug()),
    };
    tasks.spawn(job);
  }

  async fn save_manifest(&self, environment: &Environment) -> ManifestStatus {
    let Some(store) = self.store.clone() else {
      return ManifestStatus::NotSaved;
    };
    let environment = environment.clone();
    let saved = tokio::task::spawn_blocking(move || store.save(&environment))
      .await
      .unwrap_or_else(|e| Err(PersistenceError::Write(io::Error::other(e.to_string()))));
    match saved {
      Ok(id) => ManifestStatus::Saved(id),
      Err(e) => {
        error!(error = %e, "environment built but manifest could not be saved");
        ManifestStatus::Degraded(e)
      }
    }
  }
}

/// Delay before retry number `retry` (0-based): `retry_delay * 2^retry`,
/// capped at `max_retry_delay`.
pub fn backoff(settings: &BuildSettings, retry: u32) -> Duration {
  settings
    .retry_delay
    .saturating_mul(2u32.saturating_pow(retry))
    .min(settings.max_retry_delay)
}

/// Per-run resources handed to every job.
struct Shared {
  semaphore: Arc<Semaphore>,
  cancel: CancelSignal,
  env_lock: EnvironmentLock,
  prefix: PathBuf,
  build_root: PathBuf,
}

/// Jobs of one run. Dropping this aborts every job still running, which in
/// turn kills the tools they started.
#[derive(Default)]
struct Tasks {
  set: JoinSet<TaskResult>,
  running: HashMap<task::Id, (String, DriverKind)>,
}

impl Tasks {
  fn spawn(&mut self, job: Job) {
    let owner = (job.request.name().to_string(), job.kind);
    let handle = self.set.spawn(job.run());
    self.running.insert(handle.id(), owner);
  }

  /// The next finished job; a job whose task died is reported as failed.
  async fn join_next(&mut self) -> Option<TaskResult> {
    loop {
      let error = match self.set.join_next_with_id().await? {
        Ok((id, result)) => {
          self.running.remove(&id);
          return Some(result);
        }
        Err(e) => e,
      };
      let Some((name, kind)) = self.running.remove(&error.id()) else {
        error!(error = %error, "unknown build task failed to join");
        continue;
      };
      let reason = if error.is_panic() {
        format!("build task panicked: {}", error)
      } else {
        format!("build task aborted: {}", error)
      };
      return Some(TaskResult::died(name, kind, reason));
    }
  }
}

enum LedgerDecision {
  Reuse {
    installed: Vec<InstalledPackage>,
    driver: Option<DriverKind>,
  },
  Skip {
    status: LedgerStatus,
    reason: String,
  },
}

/// One request's retry loop, run as its own task.
struct Job {
  request: BuildRequest,
  kind: DriverKind,
  driver: Arc<dyn Driver>,
  settings: BuildSettings,
  semaphore: Arc<Semaphore>,
  cancel: CancelSignal,
  env_lock: EnvironmentLock,
  prefix: PathBuf,
  build_root: PathBuf,
}

struct TaskResult {
  name: String,
  end: TaskEnd,
}

enum TaskEnd {
  /// Cancelled before the first attempt got a permit.
  NotStarted,
  Finished {
    /// States entered after `Pending`, in order; the last one is final.
    transitions: Vec<RequestState>,
    settled: Settled,
  },
}

impl TaskResult {
  fn died(name: String, kind: DriverKind, reason: String) -> Self {
    error!(request = %name, driver = %kind, "{}", reason);
    Self {
      name,
      end: TaskEnd::Finished {
        transitions: vec![RequestState::Running, RequestState::Failed],
        settled: Settled::failed(Some(kind), 1, Outcome::fatal(reason)),
      },
    }
  }
}

impl Job {
  async fn run(self) -> TaskResult {
    let key = self.request.key();
    let name = self.request.name().to_string();
    let mut transitions = Vec::new();
    let mut attempt: u32 = 0;

    loop {
      let permit = tokio::select! {
        biased;
        _ = self.cancel.cancelled() => None,
        permit = self.semaphore.clone().acquire_owned() => permit.ok(),
      };
      let Some(permit) = permit else {
        if attempt == 0 {
          debug!(request = %key, "cancelled before start");
          return TaskResult {
            name,
            end: TaskEnd::NotStarted,
          };
        }
        transitions.push(RequestState::Failed);
        let outcome = Outcome::fatal("cancelled while waiting to retry");
        return self.finished(name, transitions, attempt, outcome);
      };

      attempt += 1;
      transitions.push(RequestState::Running);
      let ctx = BuildContext {
        attempt,
        prefix: self.prefix.clone(),
        build_dir: self.build_root.join(format!("attempt-{}", attempt)),
        timeout: self.settings.invocation_timeout,
        cancel: self.cancel.clone(),
        cancel_grace: self.settings.cancel_grace,
        env_lock: self.env_lock.clone(),
        prefetch: self.settings.prefetch,
      };
      let mut outcome = self.driver.build(&self.request, &ctx).await;
      drop(permit);

      if outcome.status == OutcomeStatus::Skipped {
        let reason = format!(
          "driver skipped the request: {}",
          outcome.reason.as_deref().unwrap_or("no reason given")
        );
        warn!(request = %key, driver = %self.kind, "{}", reason);
        outcome.status = OutcomeStatus::Failed;
        outcome.failure = Some(FailureKind::Fatal);
        outcome.reason = Some(reason);
      }

      if outcome.is_success() {
        info!(request = %key, driver = %self.kind, attempt, "build succeeded");
        transitions.push(RequestState::Succeeded);
        return self.finished(name, transitions, attempt, outcome);
      }

      if outcome.is_transient() && !self.cancel.is_cancelled() && attempt <= self.settings.retry_limit {
        let delay = backoff(&self.settings, attempt - 1);
        warn!(
          request = %key,
          attempt,
          retry_in = ?delay,
          reason = outcome.reason.as_deref().unwrap_or_default(),
          "transient failure, retrying"
        );
        transitions.push(RequestState::Retrying);
        let cancelled = tokio::select! {
          biased;
          _ = self.cancel.cancelled() => true,
          _ = tokio::time::sleep(delay) => false,
        };
        if !cancelled {
          continue;
        }
        transitions.push(RequestState::Failed);
        outcome.failure = Some(FailureKind::Fatal);
        outcome.reason = Some("cancelled while waiting to retry".to_string());
        return self.finished(name, transitions, attempt, outcome);
      }

      transitions.push(RequestState::Failed);
      return self.finished(name, transitions, attempt, outcome);
    }
  }

  fn finished(&self, name: String, transitions: Vec<RequestState>, attempts: u32, outcome: Outcome) -> TaskResult {
    let settled = if outcome.is_success() {
      Settled::succeeded(Some(self.kind), attempts, outcome)
    } else {
      Settled::failed(Some(self.kind), attempts, outcome)
    };
    TaskResult {
      name,
      end: TaskEnd::Finished { transitions, settled },
    }
  }
}

/// Final result of a request before it is recorded.
struct Settled {
  state: RequestState,
  driver: Option<DriverKind>,
  attempts: u32,
  outcome: Outcome,
  skip: Option<SkipCause>,
  reused: bool,
}

impl Settled {
  fn succeeded(driver: Option<DriverKind>, attempts: u32, outcome: Outcome) -> Self {
    Self {
      state: RequestState::Succeeded,
      driver,
      attempts,
      outcome,
      skip: None,
      reused: false,
    }
  }

  fn failed(driver: Option<DriverKind>, attempts: u32, outcome: Outcome) -> Self {
    Self {
      state: RequestState::Failed,
      ..Self::succeeded(driver, attempts, outcome)
    }
  }
}

/// Mutable state of one `execute` call.
struct Run<'p> {
  plan: &'p BuildPlan,
  tracker: StateTracker,
  reports: BTreeMap<String, RequestReport>,
  environment: Environment,
  ledger: Option<EnvironmentLedger>,
  cancel: CancelSignal,
}

impl<'p> Run<'p> {
  fn new(plan: &'p BuildPlan, ledger: Option<EnvironmentLedger>, cancel: CancelSignal) -> Self {
    let mut environment = Environment::new(plan.environment().clone());
    environment.status = EnvironmentStatus::Building;
    Self {
      plan,
      tracker: StateTracker::new(plan.steps().iter().map(PlanStep::name)),
      reports: BTreeMap::new(),
      environment,
      ledger,
      cancel,
    }
  }

  fn transition(&mut self, name: &str, next: RequestState) {
    if let Err(e) = self.tracker.transition(name, next) {
      error!(error = %e, "state machine violation");
    }
  }

  /// The skip a request inherits from a dependency that ended without success.
  fn blocked_by(&self, step: &PlanStep) -> Option<(SkipCause, String)> {
    step.dependencies.iter().find_map(|dep| {
      let report = self.reports.get(dep)?;
      if report.state == RequestState::Succeeded {
        return None;
      }
      Some(match &report.skip {
        _ if self.cancel.is_cancelled() => (SkipCause::Cancelled, "cancelled".to_string()),
        Some(SkipCause::Cancelled) => (SkipCause::Cancelled, "cancelled".to_string()),
        Some(cause) if !cause.fails_environment() => (
          SkipCause::SkippedDependency(dep.clone()),
          format!("dependency skipped: {}", dep),
        ),
        _ => (SkipCause::FailedDependency(dep.clone()), format!("dependency failed: {}", dep)),
      })
    })
  }

  fn dependencies_succeeded(&self, step: &PlanStep) -> bool {
    step
      .dependencies
      .iter()
      .all(|dep| self.reports.get(dep).is_some_and(|r| r.state == RequestState::Succeeded))
  }

  fn skip(&mut self, step: &PlanStep, cause: SkipCause, reason: String) {
    match &cause {
      SkipCause::FailedDependency(dep) => {
        warn!(request = %step.request.key(), failed_dep = %dep, "skipping request due to failed dependency")
      }
      _ => info!(request = %step.request.key(), cause = %cause, reason = %reason, "skipping request"),
    }
    self.transition(step.name(), RequestState::Skipped);
    self.settle(
      step,
      Settled {
        state: RequestState::Skipped,
        driver: step.driver(),
        attempts: 0,
        outcome: Outcome::skipped(reason),
        skip: Some(cause),
        reused: false,
      },
    );
  }

  fn reuse(&mut self, step: &PlanStep, installed: Vec<InstalledPackage>, driver: Option<DriverKind>) {
    info!(request = %step.request.key(), "reusing previous success from status ledger");
    self.transition(step.name(), RequestState::Running);
    let mut outcome = Outcome::succeeded(installed);
    outcome.reason = Some("reused from status ledger".to_string());
    let mut settled = Settled::succeeded(driver.or(step.driver()), 0, outcome);
    settled.reused = true;
    self.settle(step, settled);
  }

  fn finish(&mut self, result: TaskResult) {
    let plan = self.plan;
    let Some(step) = plan.step(&result.name) else {
      error!(request = %result.name, "result for a request outside the plan");
      return;
    };
    match result.end {
      TaskEnd::NotStarted => self.skip(step, SkipCause::Cancelled, "cancelled".to_string()),
      TaskEnd::Finished { transitions, settled } => {
        if let Some((_, before)) = transitions.split_last() {
          for state in before {
            self.transition(step.name(), *state);
          }
        }
        self.settle(step, settled);
      }
    }
  }

  /// Record a final result: environment entry, state, ledger and report.
  fn settle(&mut self, step: &PlanStep, mut settled: Settled) {
    let key = step.request.key();

    if let Err(conflict) = self
      .environment
      .record(step.request.clone(), settled.driver, settled.outcome.clone())
    {
      error!(request = %key, error = %conflict, "installed packages conflict with the environment");
      let mut outcome = settled.outcome.clone();
      outcome.status = OutcomeStatus::Failed;
      outcome.failure = Some(FailureKind::Fatal);
      outcome.reason = Some(conflict.to_string());
      outcome.installed.clear();
      if let Err(e) = self
        .environment
        .record(step.request.clone(), settled.driver, outcome.clone())
      {
        error!(request = %key, error = %e, "could not record failed outcome");
      }
      settled.state = RequestState::Failed;
      settled.outcome = outcome;
    }

    if settled.state != RequestState::Skipped {
      self.transition(step.name(), settled.state);
    }

    let error = match settled.state {
      RequestState::Failed => Some(self.fatal_error(&key, &mut settled)),
      _ => None,
    };

    // Only a request's own result is written back; skips inherited from
    // dependencies or the ledger itself, reuses and cancellations are not.
    if let Some(ledger) = self.ledger.as_mut() {
      let from_build = !settled.reused && settled.skip.is_none();
      let cancelled_failure = settled.state == RequestState::Failed && self.cancel.is_cancelled();
      let policy_skip = settled.skip == Some(SkipCause::Policy);
      if (from_build && !cancelled_failure) || policy_skip {
        ledger.record(&key, &settled.outcome, settled.driver);
      }
    }

    self.reports.insert(
      step.name().to_string(),
      RequestReport {
        request: step.request.clone(),
        driver: settled.driver,
        state: settled.state,
        attempts: settled.attempts,
        outcome: settled.outcome,
        error,
        skip: settled.skip,
        reused: settled.reused,
      },
    );
  }

  /// Escalate a failed outcome to the error reported for it.
  fn fatal_error(&self, key: &str, settled: &mut Settled) -> FatalBuildError {
    let attempts = settled.attempts;
    let error = match settled.outcome.error(key, attempts) {
      Some(BuildError::Transient(transient)) if self.cancel.is_cancelled() => FatalBuildError {
        request: transient.request,
        reason: transient.reason,
        attempts,
      },
      Some(BuildError::Transient(transient)) => transient.escalate(attempts),
      Some(BuildError::Fatal(fatal)) => fatal,
      None => FatalBuildError {
        request: key.to_string(),
        reason: "unknown failure".to_string(),
        attempts,
      },
    };
    settled.outcome.failure = Some(FailureKind::Fatal);
    settled.outcome.reason = Some(error.reason.clone());
    error!(request = %key, attempts, reason = %error.reason, "build failed");
    error
  }

  fn into_report(self) -> (BuildReport, Option<EnvironmentLedger>) {
    let Run {
      plan,
      mut reports,
      mut environment,
      ledger,
      cancel,
      ..
    } = self;

    let requests: Vec<RequestReport> = plan.steps().iter().filter_map(|s| reports.remove(s.name())).collect();

    let interrupted = requests
      .iter()
      .any(|r| r.state == RequestState::Failed || r.skip == Some(SkipCause::Cancelled));
    environment.status = if cancel.is_cancelled() && interrupted {
      EnvironmentStatus::Cancelled
    } else if requests.iter().any(RequestReport::blocks_environment) {
      EnvironmentStatus::Failed
    } else {
      EnvironmentStatus::Succeeded
    };

    let report = BuildReport {
      environment,
      requests,
      manifest: ManifestStatus::NotSaved,
      ledger_error: None,
    };
    (report, ledger)
  }
}
