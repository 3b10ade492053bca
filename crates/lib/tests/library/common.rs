use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metabuild_lib::config::{BuildSettings, DriverSettings};
use metabuild_lib::paths::DataLayout;
use metabuild_lib::{BuildRequest, DriverKind, DriverRegistry, EnvironmentId, Orchestrator, ToolDriver};
use tempfile::TempDir;

pub fn env_id() -> EnvironmentId {
  EnvironmentId::new("bio").unwrap()
}

pub fn req(name: &str, version: &str) -> BuildRequest {
  BuildRequest::parse(name, version, &env_id()).unwrap()
}

/// Retries without real waiting.
pub fn fast_settings() -> BuildSettings {
  BuildSettings {
    parallelism: 2,
    retry_limit: 2,
    retry_delay: Duration::from_millis(10),
    max_retry_delay: Duration::from_millis(40),
    invocation_timeout: Duration::from_secs(20),
    cancel_grace: Duration::from_millis(200),
    prefetch: true,
  }
}

/// A temp data root with a fake `eb` that logs every invocation.
pub struct TestBed {
  pub temp: TempDir,
  pub program: PathBuf,
  calls: PathBuf,
}

impl TestBed {
  /// `cases` is spliced into a `case "$last" in ... esac` over the
  /// easyconfig name; anything it does not match installs successfully and
  /// leaves a marker in the install path that `--missing-modules` honours.
  pub fn new(cases: &str) -> Self {
    let temp = TempDir::new().unwrap();
    let calls = temp.path().join("calls.log");
    let script = format!(
      r#"#!/bin/sh
prefix=.
for last; do
  case "$last" in
    --installpath=*) prefix="${{last#--installpath=}}" ;;
  esac
done
echo "eb $*" >> "{calls}"
case "$*" in
  *--fetch*) exit 0 ;;
  *--missing-modules*)
    [ -e "$prefix/.installed-$last" ] || echo "* ${{last%.eb}} ($last)"
    exit 0 ;;
esac
case "$last" in
{cases}
esac
mkdir -p "$prefix"
touch "$prefix/.installed-$last"
echo "installed $last"
"#,
      calls = calls.display(),
      cases = cases,
    );
    let program = temp.path().join("eb");
    std::fs::write(&program, script).unwrap();
    std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

    Self { temp, program, calls }
  }

  pub fn root(&self) -> &Path {
    self.temp.path()
  }

  pub fn layout(&self) -> DataLayout {
    DataLayout::new(self.root().join("data"))
  }

  pub fn orchestrator(&self) -> Orchestrator {
    let driver = ToolDriver::new(
      DriverKind::EasyBuild,
      &DriverSettings {
        program: Some(self.program.clone()),
        ..DriverSettings::default()
      },
      &[],
    );
    let registry = DriverRegistry::new(vec![DriverKind::EasyBuild]).with_driver(Arc::new(driver));
    Orchestrator::new(registry, self.layout()).with_settings(fast_settings())
  }

  /// Easyconfigs passed to install invocations, in order.
  pub fn installs(&self) -> Vec<String> {
    let Ok(log) = std::fs::read_to_string(&self.calls) else {
      return Vec::new();
    };
    log
      .lines()
      .filter(|l| !l.contains("--fetch") && !l.contains("--missing-modules"))
      .filter_map(|l| l.split_whitespace().last().map(str::to_string))
      .collect()
  }

  pub fn install_count(&self, easyconfig: &str) -> usize {
    self.installs().iter().filter(|e| *e == easyconfig).count()
  }
}
