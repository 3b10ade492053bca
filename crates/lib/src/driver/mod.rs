//! Driver adapters: one per external build tool.
//!
//! A [`Driver`] turns a [`BuildRequest`] into a tool invocation inside an
//! isolated build directory and reports back an [`Outcome`]. Expected tool
//! failures are never errors here; they come back as failed outcomes tagged
//! transient or fatal so the orchestrator can decide whether to retry.

pub mod classify;
pub mod invocation;
pub mod process;
pub mod registry;
pub mod tool;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::consts::BUILD_LOG_FILENAME;
use crate::environment::Outcome;
use crate::execute::cancel::CancelSignal;
use crate::execute::lock::EnvironmentLock;
use crate::request::BuildRequest;

pub use registry::DriverRegistry;
pub use tool::ToolDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
  EasyBuild,
  Spack,
  Conda,
  Mamba,
}

impl DriverKind {
  pub const ALL: [DriverKind; 4] = [DriverKind::EasyBuild, DriverKind::Spack, DriverKind::Conda, DriverKind::Mamba];

  pub fn as_str(&self) -> &'static str {
    match self {
      DriverKind::EasyBuild => "easybuild",
      DriverKind::Spack => "spack",
      DriverKind::Conda => "conda",
      DriverKind::Mamba => "mamba",
    }
  }

  /// Executable name looked up on PATH.
  pub fn default_program(&self) -> &'static str {
    match self {
      DriverKind::EasyBuild => "eb",
      DriverKind::Spack => "spack",
      DriverKind::Conda => "conda",
      DriverKind::Mamba => "mamba",
    }
  }
}

impl fmt::Display for DriverKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for DriverKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "easybuild" | "eb" => Ok(DriverKind::EasyBuild),
      "spack" => Ok(DriverKind::Spack),
      "conda" => Ok(DriverKind::Conda),
      "mamba" => Ok(DriverKind::Mamba),
      other => Err(format!("unknown driver: {}", other)),
    }
  }
}

/// Everything a driver needs for one attempt at one request.
#[derive(Debug, Clone)]
pub struct BuildContext {
  /// 1-based attempt number.
  pub attempt: u32,
  /// Install prefix of the target environment.
  pub prefix: PathBuf,
  /// Isolated directory for this attempt; holds `tmp/` and `build.log`.
  pub build_dir: PathBuf,
  pub timeout: Duration,
  pub cancel: CancelSignal,
  pub cancel_grace: Duration,
  /// Must be held while the tool writes into `prefix`.
  pub env_lock: EnvironmentLock,
  /// Run the tool's download step before taking the lock.
  pub prefetch: bool,
}

impl BuildContext {
  pub fn log_path(&self) -> PathBuf {
    self.build_dir.join(BUILD_LOG_FILENAME)
  }

  pub fn tmp_dir(&self) -> PathBuf {
    self.build_dir.join("tmp")
  }
}

#[async_trait]
pub trait Driver: Send + Sync {
  fn kind(&self) -> DriverKind;

  /// Cheap, side-effect free check whether this driver can build the request.
  fn can_satisfy(&self, request: &BuildRequest) -> bool;

  async fn build(&self, request: &BuildRequest, ctx: &BuildContext) -> Outcome;
}
