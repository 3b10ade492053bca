//! Spawning and supervising external tools.
//!
//! Every tool runs with a cleared environment rebuilt from a small pass-through
//! list, a private TMPDIR, a fixed locale and SOURCE_DATE_EPOCH. Output is
//! appended to the attempt's log file. A run ends in one of three ways: the
//! tool exits, the timeout expires, or the run is cancelled. A cancelled tool
//! gets a grace period to exit on its own. When a tool is stopped, its whole
//! process group is killed and the child is reaped before returning.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::consts::SOURCE_DATE_EPOCH;
use crate::execute::cancel::CancelSignal;

/// Variables copied from the caller's environment when present.
pub const DEFAULT_PASSTHROUGH: &[&str] = &[
  "PATH",
  "HOME",
  "USER",
  "LOGNAME",
  "TERM",
  "http_proxy",
  "https_proxy",
  "no_proxy",
  "HTTP_PROXY",
  "HTTPS_PROXY",
  "NO_PROXY",
  "SYSTEMROOT",
  "USERPROFILE",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
  pub program: PathBuf,
  pub args: Vec<String>,
  pub cwd: PathBuf,
  pub env: BTreeMap<String, String>,
}

impl ToolCommand {
  pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
      cwd: cwd.into(),
      env: BTreeMap::new(),
    }
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
    self.env.extend(env);
    self
  }

  /// Shell-like rendering for logs.
  pub fn display(&self) -> String {
    let mut out = self.program.display().to_string();
    for arg in &self.args {
      out.push(' ');
      out.push_str(arg);
    }
    out
  }
}

/// Build the environment for a tool invocation.
pub fn isolated_env(tmp_dir: &Path, extra_passthrough: &[String]) -> BTreeMap<String, String> {
  let mut env = BTreeMap::new();

  let names = DEFAULT_PASSTHROUGH
    .iter()
    .map(|s| s.to_string())
    .chain(extra_passthrough.iter().cloned());
  for name in names {
    if let Ok(value) = std::env::var(&name) {
      env.insert(name, value);
    }
  }

  let tmp = tmp_dir.display().to_string();
  for var in ["TMPDIR", "TMP", "TEMP", "TEMPDIR"] {
    env.insert(var.to_string(), tmp.clone());
  }
  env.insert("LANG".to_string(), "C".to_string());
  env.insert("LC_ALL".to_string(), "C".to_string());
  env.insert("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string());
  env
}

/// Bounds on a single run.
#[derive(Debug, Clone)]
pub struct RunLimits {
  pub timeout: Duration,
  pub cancel: CancelSignal,
  /// Time a cancelled tool gets to exit on its own before it is killed.
  pub grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
  Exited(Option<i32>),
  TimedOut,
  Cancelled,
}

impl RunStatus {
  pub fn success(&self) -> bool {
    matches!(self, RunStatus::Exited(Some(0)))
  }
}

/// Run a tool with stdout and stderr appended to `log_path`.
///
/// Returns `Err` only when the tool could not be started.
pub async fn run_logged(cmd: &ToolCommand, log_path: &Path, limits: &RunLimits) -> io::Result<RunStatus> {
  let log = open_log(log_path, cmd)?;
  let mut command = base_command(cmd, &log)?;
  command.stdout(Stdio::from(log.try_clone()?));

  info!(cmd = %cmd.display(), "running tool");
  let child = command.spawn()?;
  let status = supervise(child, cmd, limits).await?;
  debug!(cmd = %cmd.display(), status = ?status, "tool finished");
  Ok(status)
}

/// Run a tool capturing stdout; stderr still goes to `log_path`.
pub async fn run_captured(cmd: &ToolCommand, log_path: &Path, limits: &RunLimits) -> io::Result<(RunStatus, String)> {
  let log = open_log(log_path, cmd)?;
  let mut command = base_command(cmd, &log)?;
  command.stdout(Stdio::piped());

  debug!(cmd = %cmd.display(), "running tool query");
  let mut child = command.spawn()?;
  let mut stdout = child
    .stdout
    .take()
    .ok_or_else(|| io::Error::other("tool stdout was not captured"))?;
  let reader = tokio::spawn(async move {
    let mut buf = String::new();
    stdout.read_to_string(&mut buf).await.map(|_| buf)
  });

  let status = supervise(child, cmd, limits).await?;
  if !matches!(status, RunStatus::Exited(_)) {
    reader.abort();
    return Ok((status, String::new()));
  }

  // A grandchild may keep the pipe open after the tool itself exited.
  let output = match tokio::time::timeout(limits.grace, reader).await {
    Ok(joined) => joined.map_err(io::Error::other)??,
    Err(_) => {
      warn!(cmd = %cmd.display(), "tool output still open after exit, discarding");
      String::new()
    }
  };
  Ok((status, output))
}

fn open_log(log_path: &Path, cmd: &ToolCommand) -> io::Result<File> {
  if let Some(parent) = log_path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  let mut log = OpenOptions::new().create(true).append(true).open(log_path)?;
  writeln!(log, "$ {}", cmd.display())?;
  Ok(log)
}

fn base_command(cmd: &ToolCommand, log: &File) -> io::Result<Command> {
  let mut command = Command::new(&cmd.program);
  command
    .args(&cmd.args)
    .current_dir(&cmd.cwd)
    .env_clear()
    .envs(&cmd.env)
    .stdin(Stdio::null())
    .stderr(Stdio::from(log.try_clone()?))
    .kill_on_drop(true);

  // Own process group so timeouts and cancellation reach the tool's children.
  #[cfg(unix)]
  command.process_group(0);

  Ok(command)
}

enum Interrupt {
  Timeout,
  Cancel,
}

async fn supervise(mut child: Child, cmd: &ToolCommand, limits: &RunLimits) -> io::Result<RunStatus> {
  let mut group = GroupGuard::new(&child);
  let waited = tokio::select! {
    status = child.wait() => Ok(status?),
    _ = tokio::time::sleep(limits.timeout) => Err(Interrupt::Timeout),
    _ = limits.cancel.cancelled() => Err(Interrupt::Cancel),
  };

  let status = match waited {
    Ok(status) => RunStatus::Exited(status.code()),
    Err(Interrupt::Timeout) => {
      warn!(cmd = %cmd.display(), timeout = ?limits.timeout, "tool timed out, killing");
      kill_and_reap(&mut child).await;
      RunStatus::TimedOut
    }
    Err(Interrupt::Cancel) => {
      // The tool is left alone for the grace period; one that finishes in
      // time keeps its real exit status.
      info!(cmd = %cmd.display(), grace = ?limits.grace, "cancellation requested, waiting for tool");
      match tokio::time::timeout(limits.grace, child.wait()).await {
        Ok(status) => RunStatus::Exited(status?.code()),
        Err(_) => {
          warn!(cmd = %cmd.display(), "tool did not stop within grace period, killing");
          #[cfg(unix)]
          signal_group(&child, rustix::process::Signal::TERM);
          kill_and_reap(&mut child).await;
          RunStatus::Cancelled
        }
      }
    }
  };
  group.disarm();
  Ok(status)
}

async fn kill_and_reap(child: &mut Child) {
  #[cfg(unix)]
  signal_group(child, rustix::process::Signal::KILL);
  if let Err(e) = child.kill().await {
    debug!(error = %e, "kill failed, child already gone");
  }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: rustix::process::Signal) {
  if let Some(pid) = child.id() {
    signal_pid_group(pid, signal);
  }
}

#[cfg(unix)]
fn signal_pid_group(pid: u32, signal: rustix::process::Signal) {
  use rustix::process::{Pid, kill_process_group};

  let Some(group) = Pid::from_raw(pid as i32) else {
    return;
  };
  if let Err(e) = kill_process_group(group, signal) {
    debug!(pid, error = %e, "failed to signal process group");
  }
}

/// Kills the tool's process group if supervision is dropped mid-run.
///
/// `kill_on_drop` only reaches the direct child; grandchildren started by a
/// wrapper script would otherwise keep running after the build task is gone.
struct GroupGuard {
  pid: Option<u32>,
}

impl GroupGuard {
  fn new(child: &Child) -> Self {
    Self { pid: child.id() }
  }

  fn disarm(&mut self) {
    self.pid = None;
  }
}

impl Drop for GroupGuard {
  fn drop(&mut self) {
    #[cfg(unix)]
    {
      if let Some(pid) = self.pid.take() {
        signal_pid_group(pid, rustix::process::Signal::KILL);
      }
    }
  }
}
