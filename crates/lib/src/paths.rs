//! Platform directories and the data layout under the metabuild home.
//!
//! ```text
//! {data_root}/
//! ├── environments/<env>/   # install prefix per target environment
//! ├── builds/<env>/<req>/   # isolated build directories, one per request attempt
//! ├── manifests/            # append-only manifest store
//! └── status/<env>.json     # status ledger per environment
//! ```

use std::path::PathBuf;

use crate::consts::{APP_NAME, CONFIG_ENV_VAR, HOME_ENV_VAR};

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE")
    .map(PathBuf::from)
    .unwrap_or_else(|_| PathBuf::from("."))
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| PathBuf::from("."))
}

/// Returns the directory for configuration files for the application
#[cfg(windows)]
pub fn config_dir() -> PathBuf {
  std::env::var("APPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir())
    .join(APP_NAME)
}

/// Returns the directory for configuration files for the application
#[cfg(not(windows))]
pub fn config_dir() -> PathBuf {
  let config_home = std::env::var("XDG_CONFIG_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".config"));
  config_home.join(APP_NAME)
}

/// Returns the directory for data files for the application
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  std::env::var("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir())
    .join(APP_NAME)
}

/// Returns the directory for data files for the application
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Root of all metabuild state. `METABUILD_HOME` takes precedence over the
/// platform data directory.
pub fn data_root() -> PathBuf {
  home_override().unwrap_or_else(data_dir)
}

/// `METABUILD_HOME`, when set and non-empty.
pub fn home_override() -> Option<PathBuf> {
  match std::env::var(HOME_ENV_VAR) {
    Ok(path) if !path.is_empty() => Some(PathBuf::from(path)),
    _ => None,
  }
}

/// Path of the config file. `METABUILD_CONFIG` takes precedence.
pub fn config_file() -> PathBuf {
  match std::env::var(CONFIG_ENV_VAR) {
    Ok(path) if !path.is_empty() => PathBuf::from(path),
    _ => config_dir().join("config.toml"),
  }
}

pub fn environments_dir() -> PathBuf {
  DataLayout::default().environments()
}

pub fn builds_dir() -> PathBuf {
  DataLayout::default().builds()
}

pub fn manifests_dir() -> PathBuf {
  DataLayout::default().manifests()
}

pub fn ledger_dir() -> PathBuf {
  DataLayout::default().ledger()
}

/// Directories under one data root.
///
/// ```text
/// {root}/
/// ├── environments/{env}/      # install prefixes
/// ├── builds/{env}/{request}/  # per-attempt build dirs and logs
/// ├── manifests/               # manifest store
/// └── status/{env}.json        # status ledger
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
  root: PathBuf,
}

impl DataLayout {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &PathBuf {
    &self.root
  }

  pub fn environments(&self) -> PathBuf {
    self.root.join("environments")
  }

  pub fn builds(&self) -> PathBuf {
    self.root.join("builds")
  }

  pub fn manifests(&self) -> PathBuf {
    self.root.join("manifests")
  }

  pub fn ledger(&self) -> PathBuf {
    self.root.join("status")
  }
}

impl Default for DataLayout {
  fn default() -> Self {
    Self::new(data_root())
  }
}
