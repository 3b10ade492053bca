//! The subprocess-backed driver used for every real tool.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::DriverSettings;
use crate::environment::{InstalledPackage, Outcome};
use crate::request::BuildRequest;

use super::classify;
use super::invocation;
use super::process::{self, RunLimits, RunStatus, ToolCommand};
use super::{BuildContext, Driver, DriverKind};

/// Drives one external tool (`eb`, `spack`, `conda` or `mamba`).
#[derive(Debug, Clone)]
pub struct ToolDriver {
  kind: DriverKind,
  program: Option<PathBuf>,
  enabled: bool,
  packages: Option<BTreeSet<String>>,
  extra_args: Vec<String>,
  passthrough_env: Vec<String>,
}

impl ToolDriver {
  /// Resolve the executable from `settings.program` or the tool's usual
  /// name on PATH. A tool that cannot be found stays registered but never
  /// satisfies a request.
  pub fn new(kind: DriverKind, settings: &DriverSettings, passthrough_env: &[String]) -> Self {
    let wanted = settings
      .program
      .clone()
      .unwrap_or_else(|| PathBuf::from(kind.default_program()));
    let program = match which::which(&wanted) {
      Ok(path) => {
        debug!(driver = %kind, program = %path.display(), "found tool");
        Some(path)
      }
      Err(e) => {
        if settings.enabled {
          info!(driver = %kind, program = %wanted.display(), error = %e, "tool not available");
        }
        None
      }
    };

    Self {
      kind,
      program,
      enabled: settings.enabled,
      packages: settings.packages.as_ref().map(|p| p.iter().cloned().collect()),
      extra_args: settings.extra_args.clone(),
      passthrough_env: passthrough_env.to_vec(),
    }
  }

  pub fn program(&self) -> Option<&Path> {
    self.program.as_deref()
  }

  pub fn is_available(&self) -> bool {
    self.enabled && self.program.is_some()
  }

  fn command(&self, program: &Path, args: Vec<String>, ctx: &BuildContext) -> ToolCommand {
    ToolCommand::new(program, &ctx.build_dir)
      .args(args)
      .envs(process::isolated_env(&ctx.tmp_dir(), &self.passthrough_env))
  }

  async fn step(
    &self,
    name: &str,
    program: &Path,
    args: Vec<String>,
    ctx: &BuildContext,
    limits: &RunLimits,
  ) -> Result<(), Outcome> {
    let cmd = self.command(program, args, ctx);
    match process::run_logged(&cmd, &ctx.log_path(), limits).await {
      Ok(status) if status.success() => Ok(()),
      Ok(status) => Err(failure(name, status, ctx)),
      Err(e) => Err(Outcome::fatal(format!("failed to start {}: {}", program.display(), e))),
    }
  }

  async fn installed(
    &self,
    program: &Path,
    request: &BuildRequest,
    ctx: &BuildContext,
    limits: &RunLimits,
  ) -> Result<Vec<InstalledPackage>, Outcome> {
    let Some(args) = invocation::query_args(self.kind, &ctx.prefix) else {
      return Ok(invocation::requested_package(self.kind, request));
    };

    let cmd = self.command(program, args, ctx);
    let output = match process::run_captured(&cmd, &ctx.log_path(), limits).await {
      Ok((status, output)) if status.success() => output,
      Ok((status, _)) => return Err(failure("query", status, ctx)),
      Err(e) => return Err(Outcome::fatal(format!("failed to start {}: {}", program.display(), e))),
    };

    match self.kind {
      DriverKind::Spack => Ok(invocation::parse_spack_find(&output)),
      _ => invocation::parse_conda_list(self.kind, &output)
        .map_err(|e| Outcome::fatal(format!("could not parse installed packages: {}", e))),
    }
  }

  /// What the prefix already provides for `request`, when nothing needs
  /// building. A check that cannot run falls through to a normal build.
  async fn already_satisfied(
    &self,
    program: &Path,
    request: &BuildRequest,
    ctx: &BuildContext,
    limits: &RunLimits,
  ) -> Option<Vec<InstalledPackage>> {
    if self.kind != DriverKind::EasyBuild {
      // A prefix that still needs preparing holds nothing yet.
      if invocation::prepare_args(self.kind, &ctx.prefix).is_some() {
        return None;
      }
      let installed = self.installed(program, request, ctx, limits).await.ok()?;
      return invocation::satisfies(&installed, request).then_some(installed);
    }

    let args = invocation::missing_modules_args(request, &ctx.prefix)?;
    let cmd = self.command(program, args, ctx);
    match process::run_captured(&cmd, &ctx.log_path(), limits).await {
      Ok((status, output)) if status.success() => {
        let missing = invocation::parse_missing_modules(&output);
        if missing.is_empty() {
          return Some(invocation::requested_package(self.kind, request));
        }
        debug!(request = %request.key(), missing = ?missing, "modules missing");
        None
      }
      Ok((status, _)) => {
        debug!(request = %request.key(), status = ?status, "missing-modules check failed, building");
        None
      }
      Err(e) => {
        debug!(request = %request.key(), error = %e, "missing-modules check did not start, building");
        None
      }
    }
  }

  async fn run_steps(&self, request: &BuildRequest, ctx: &BuildContext) -> Result<Outcome, Outcome> {
    let Some(program) = self.program.clone() else {
      return Err(Outcome::fatal(format!("{} executable not found", self.kind.default_program())));
    };

    tokio::fs::create_dir_all(ctx.tmp_dir()).await.map_err(|e| {
      Outcome::fatal(format!(
        "failed to create build directory {}: {}",
        ctx.build_dir.display(),
        e
      ))
    })?;

    let limits = RunLimits {
      timeout: ctx.timeout,
      cancel: ctx.cancel.clone(),
      grace: ctx.cancel_grace,
    };
    let key = request.key();

    not_cancelled("fetch", ctx)?;
    if let Some(installed) = self.already_satisfied(&program, request, ctx, &limits).await {
      info!(request = %key, driver = %self.kind, "already installed, nothing to build");
      let mut outcome = Outcome::succeeded(installed);
      outcome.reason = Some("already installed".to_string());
      return Ok(outcome);
    }

    if ctx.prefetch
      && let Some(args) = invocation::fetch_args(self.kind, request, &ctx.build_dir)
    {
      not_cancelled("fetch", ctx)?;
      self.step("fetch", &program, args, ctx, &limits).await?;
    }

    not_cancelled("install", ctx)?;
    let _guard = match ctx.env_lock.acquire(&key).await {
      Ok(guard) => guard,
      Err(e) if e.is_contention() => {
        warn!(request = %key, error = %e, "environment locked by another process");
        return Err(Outcome::transient(e.to_string()));
      }
      Err(e) => return Err(Outcome::fatal(e.to_string())),
    };

    if let Some(args) = invocation::prepare_args(self.kind, &ctx.prefix) {
      not_cancelled("prepare", ctx)?;
      self.step("prepare", &program, args, ctx, &limits).await?;
    }

    let Some(args) = invocation::install_args(self.kind, request, &ctx.prefix, &self.extra_args) else {
      return Err(Outcome::fatal(format!("{} cannot express {}", self.kind, key)));
    };
    not_cancelled("install", ctx)?;
    self.step("install", &program, args, ctx, &limits).await?;

    self.installed(&program, request, ctx, &limits).await.map(Outcome::succeeded)
  }
}

/// Stop before starting `step` once the run is cancelled.
fn not_cancelled(step: &str, ctx: &BuildContext) -> Result<(), Outcome> {
  if ctx.cancel.is_cancelled() {
    debug!(step, "cancelled before start");
    return Err(Outcome::fatal(format!("{} cancelled", step)));
  }
  Ok(())
}

/// Turn a non-successful run into a failed outcome with a short reason.
fn failure(step: &str, status: RunStatus, ctx: &BuildContext) -> Outcome {
  if status == RunStatus::Cancelled || ctx.cancel.is_cancelled() {
    let code = match status {
      RunStatus::Exited(code) => code,
      _ => None,
    };
    return Outcome::fatal(format!("{} cancelled", step)).with_exit_code(code);
  }

  let tail = classify::read_log_tail(&ctx.log_path());
  let kind = classify::classify(status, &tail);
  match status {
    RunStatus::Exited(code) => {
      let code_text = code.map_or_else(|| "a signal".to_string(), |c| format!("exit code {}", c));
      let reason = match classify::last_line(&tail) {
        Some(line) => format!("{} failed with {}: {}", step, code_text, line),
        None => format!("{} failed with {}", step, code_text),
      };
      Outcome::failed(kind, reason).with_exit_code(code)
    }
    _ => Outcome::failed(kind, format!("{} timed out after {:?}", step, ctx.timeout)),
  }
}

#[async_trait]
impl Driver for ToolDriver {
  fn kind(&self) -> DriverKind {
    self.kind
  }

  fn can_satisfy(&self, request: &BuildRequest) -> bool {
    self.is_available()
      && self
        .packages
        .as_ref()
        .is_none_or(|allowed| allowed.contains(request.name()))
      && invocation::supports(self.kind, request)
  }

  async fn build(&self, request: &BuildRequest, ctx: &BuildContext) -> Outcome {
    let started = Instant::now();
    info!(request = %request.key(), driver = %self.kind, attempt = ctx.attempt, "building");
    let (Ok(outcome) | Err(outcome)) = self.run_steps(request, ctx).await;
    outcome
      .with_log(ctx.log_path())
      .with_duration(started.elapsed())
  }
}
