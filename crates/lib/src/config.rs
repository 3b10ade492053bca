//! Configuration loaded from `config.toml`.
//!
//! Every section is optional; missing keys fall back to defaults. A minimal
//! file might look like:
//!
//! ```toml
//! [build]
//! parallelism = 4
//! retry_limit = 3
//! retry_delay = 10.0        # seconds
//!
//! [drivers]
//! priority = ["easybuild", "spack", "mamba", "conda"]
//!
//! [drivers.conda]
//! enabled = false
//!
//! [policy]
//! exclude = ["vis"]
//!
//! [policy.min_toolchains]
//! GCC = "12.0"
//! system = "system"
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::driver::DriverKind;
use crate::paths;
use crate::request::Version;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("invalid config: {0}")]
  Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  /// Root for environments, build directories, manifests and the ledger.
  /// `METABUILD_HOME` takes precedence.
  pub data_root: Option<PathBuf>,
  pub build: BuildSettings,
  pub drivers: DriversConfig,
  pub policy: PolicyConfig,
  pub ledger: LedgerSettings,
}

impl Config {
  /// Load from `METABUILD_CONFIG` or the platform config path. A missing
  /// file yields the defaults.
  pub fn load() -> Result<Self, ConfigError> {
    let path = paths::config_file();
    if !path.exists() {
      debug!(path = %path.display(), "no config file, using defaults");
      return Ok(Self::default());
    }
    Self::from_path(&path)
  }

  pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    config.validate()?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.build.parallelism == 0 {
      return Err(ConfigError::Invalid("build.parallelism must be at least 1".to_string()));
    }
    if self.build.max_retry_delay < self.build.retry_delay {
      return Err(ConfigError::Invalid(
        "build.max_retry_delay must not be smaller than build.retry_delay".to_string(),
      ));
    }
    let mut seen = Vec::new();
    for kind in &self.drivers.priority {
      if seen.contains(kind) {
        return Err(ConfigError::Invalid(format!("driver {} listed twice in drivers.priority", kind)));
      }
      seen.push(*kind);
    }
    Ok(())
  }

  /// Effective data root: `METABUILD_HOME`, then `data_root`, then the
  /// platform data directory.
  pub fn data_root(&self) -> PathBuf {
    paths::home_override()
      .or_else(|| self.data_root.clone())
      .unwrap_or_else(paths::data_dir)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSettings {
  /// Maximum number of tool invocations running at once.
  pub parallelism: usize,

  /// Retries after the first attempt for transient failures.
  pub retry_limit: u32,

  #[serde(with = "duration_secs")]
  pub retry_delay: Duration,

  #[serde(with = "duration_secs")]
  pub max_retry_delay: Duration,

  /// Wall-clock limit for a single tool invocation.
  #[serde(with = "duration_secs")]
  pub invocation_timeout: Duration,

  /// How long a running tool may keep going after cancellation before it is killed.
  #[serde(with = "duration_secs")]
  pub cancel_grace: Duration,

  /// Download sources before taking the environment lock.
  pub prefetch: bool,
}

impl Default for BuildSettings {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
      retry_limit: 2,
      retry_delay: Duration::from_secs(30),
      max_retry_delay: Duration::from_secs(600),
      invocation_timeout: Duration::from_secs(12 * 60 * 60),
      cancel_grace: Duration::from_secs(30),
      prefetch: true,
    }
  }
}

fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriversConfig {
  /// Order in which drivers are tried when a request names none.
  pub priority: Vec<DriverKind>,

  /// Environment variables passed through to tools in addition to the defaults.
  pub passthrough_env: Vec<String>,

  pub easybuild: DriverSettings,
  pub spack: DriverSettings,
  pub conda: DriverSettings,
  pub mamba: DriverSettings,
}

impl Default for DriversConfig {
  fn default() -> Self {
    Self {
      priority: vec![DriverKind::EasyBuild, DriverKind::Spack, DriverKind::Mamba, DriverKind::Conda],
      passthrough_env: Vec::new(),
      easybuild: DriverSettings::default(),
      spack: DriverSettings::default(),
      conda: DriverSettings::default(),
      mamba: DriverSettings::default(),
    }
  }
}

impl DriversConfig {
  pub fn settings(&self, kind: DriverKind) -> &DriverSettings {
    match kind {
      DriverKind::EasyBuild => &self.easybuild,
      DriverKind::Spack => &self.spack,
      DriverKind::Conda => &self.conda,
      DriverKind::Mamba => &self.mamba,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverSettings {
  pub enabled: bool,

  /// Executable to run. Looked up on PATH by its usual name when unset.
  pub program: Option<PathBuf>,

  /// When set, the driver only accepts these package names.
  pub packages: Option<Vec<String>>,

  /// Extra arguments appended to every install invocation.
  pub extra_args: Vec<String>,
}

impl Default for DriverSettings {
  fn default() -> Self {
    Self {
      enabled: true,
      program: None,
      packages: None,
      extra_args: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
  /// Oldest accepted version per toolchain. Toolchains not listed are
  /// rejected. `None` disables toolchain checks.
  pub min_toolchains: Option<BTreeMap<String, Version>>,

  /// Categories to build; empty means all.
  pub include: Vec<String>,

  /// Categories never built. Ignored when `include` is set.
  pub exclude: Vec<String>,
}

impl Default for PolicyConfig {
  fn default() -> Self {
    Self {
      min_toolchains: Some(default_min_toolchains()),
      include: Vec::new(),
      exclude: Vec::new(),
    }
  }
}

fn default_min_toolchains() -> BTreeMap<String, Version> {
  [
    ("system", "system"),
    ("GCC", "11.0"),
    ("GCCcore", "11.0"),
    ("LLVM", "12.0"),
    ("foss", "2022a"),
    ("gfbf", "2022a"),
  ]
  .into_iter()
  .filter_map(|(name, version)| Version::parse(version).ok().map(|v| (name.to_string(), v)))
  .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerSettings {
  pub enabled: bool,

  /// Attempt requests whose last recorded status is `error`.
  pub retry_failed: bool,

  /// Attempt requests whose last recorded status is `skipped`.
  pub recheck_skipped: bool,
}

impl Default for LedgerSettings {
  fn default() -> Self {
    Self {
      enabled: true,
      retry_failed: false,
      recheck_skipped: false,
    }
  }
}

/// Durations as fractional seconds in TOML.
mod duration_secs {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer, de::Error};

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
  }
}
