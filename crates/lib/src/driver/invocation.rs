//! Command lines and output parsing for each supported tool.
//!
//! | step    | easybuild                          | spack                         | conda / mamba                       |
//! |---------|------------------------------------|-------------------------------|-------------------------------------|
//! | fetch   | `eb --robot --fetch <ec>`          | `spack fetch -D <spec>`       | `create -y --download-only -p <tmp>`|
//! | prepare | -                                  | `spack env create -d <prefix>`| `create -y -p <prefix>`             |
//! | install | `eb --robot --umask=002 ...`       | `spack -e <prefix> install`   | `install -y -p <prefix> <spec>`     |
//! | query   | -                                  | `spack -e <prefix> find`      | `list --json -p <prefix>`           |
//! | check   | `eb --missing-modules <ec>`        | query + constraint match      | query + constraint match            |

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::environment::InstalledPackage;
use crate::request::{BuildRequest, Version, VersionConstraint};

use super::DriverKind;

const CONDA_VARIANTS: &[&str] = &["channel", "build"];
const EASYBUILD_VARIANTS: &[&str] = &["versionsuffix", "cuda"];

/// Whether the tool can express this request at all.
pub fn supports(kind: DriverKind, request: &BuildRequest) -> bool {
  match kind {
    DriverKind::EasyBuild => {
      request.version().pinned().is_some()
        && request
          .variants()
          .keys()
          .all(|k| EASYBUILD_VARIANTS.contains(&k.as_str()))
    }
    DriverKind::Spack => spack_spec(request).is_some(),
    DriverKind::Conda | DriverKind::Mamba => {
      request.toolchain().is_none_or(|tc| tc.is_system())
        && request.variants().keys().all(|k| CONDA_VARIANTS.contains(&k.as_str()))
    }
  }
}

/// `{name}-{version}[-{toolchain}-{toolchain version}]{versionsuffix}.eb`
pub fn easyconfig_name(request: &BuildRequest) -> Option<String> {
  let version = request.version().pinned()?;
  let mut name = format!("{}-{}", request.name(), version);
  if let Some(tc) = request.toolchain()
    && !tc.is_system()
  {
    name.push_str(&format!("-{}-{}", tc.name, tc.version));
  }
  if let Some(suffix) = request.variants().get("versionsuffix") {
    name.push_str(suffix);
  }
  name.push_str(".eb");
  Some(name)
}

/// CUDA builds cannot run their test suites on build hosts without a GPU.
fn needs_cuda_test_bypass(request: &BuildRequest) -> bool {
  request.variants().get("cuda").is_some_and(|v| v == "true")
    || easyconfig_name(request).is_some_and(|ec| ec.to_ascii_lowercase().contains("cuda"))
}

/// Spack spec, e.g. `hdf5@1.12:1.14+mpi~fortran %gcc@12.2`. `None` when the
/// request uses something Spack syntax cannot express.
pub fn spack_spec(request: &BuildRequest) -> Option<String> {
  let name = request.name();
  let valid_name = name
    .chars()
    .next()
    .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    && name
      .chars()
      .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
  if !valid_name {
    return None;
  }

  let mut spec = name.to_string();
  spec.push_str(&spack_version(request.version())?);

  // Boolean variants attach to the name; key=value pairs follow as words.
  let mut valued = Vec::new();
  for (key, value) in request.variants() {
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
      return None;
    }
    match value.as_str() {
      "true" => spec.push_str(&format!("+{}", key)),
      "false" => spec.push_str(&format!("~{}", key)),
      other => valued.push(format!("{}={}", key, other)),
    }
  }
  for pair in valued {
    spec.push(' ');
    spec.push_str(&pair);
  }

  if let Some(tc) = request.toolchain()
    && !tc.is_system()
  {
    spec.push_str(&format!(" %{}@{}", tc.name.to_ascii_lowercase(), tc.version));
  }
  Some(spec)
}

fn spack_version(constraint: &VersionConstraint) -> Option<String> {
  if constraint.is_any() {
    return Some(String::new());
  }
  if let Some(pin) = constraint.pinned() {
    return Some(format!("@={}", pin));
  }
  // Spack ranges are inclusive on both ends.
  let lower = constraint.lower();
  let upper = constraint.upper();
  if lower.is_some_and(|b| !b.inclusive) || upper.is_some_and(|b| !b.inclusive) {
    return None;
  }
  let lo = lower.map(|b| b.version.to_string()).unwrap_or_default();
  let hi = upper.map(|b| b.version.to_string()).unwrap_or_default();
  Some(format!("@{}:{}", lo, hi))
}

/// Conda match spec, e.g. `numpy>=1.24,<2` or `samtools[version='==1.19',build=h50ea8bc_0]`.
pub fn conda_spec(request: &BuildRequest) -> String {
  let constraint = request.version();
  let version = match constraint.pinned() {
    Some(pin) => format!("=={}", pin),
    None if constraint.is_any() => String::new(),
    None => constraint.to_string(),
  };

  match request.variants().get("build") {
    Some(build) if version.is_empty() => format!("{}[build={}]", request.name(), build),
    Some(build) => format!("{}[version='{}',build={}]", request.name(), version, build),
    None => format!("{}{}", request.name(), version),
  }
}

fn conda_channel_args(request: &BuildRequest) -> Vec<String> {
  match request.variants().get("channel") {
    Some(channel) => vec!["-c".to_string(), channel.clone()],
    None => Vec::new(),
  }
}

/// Download-only step, run without the environment lock.
pub fn fetch_args(kind: DriverKind, request: &BuildRequest, build_dir: &Path) -> Option<Vec<String>> {
  match kind {
    DriverKind::EasyBuild => Some(vec!["--robot".to_string(), "--fetch".to_string(), easyconfig_name(request)?]),
    DriverKind::Spack => Some(vec!["fetch".to_string(), "-D".to_string(), spack_spec(request)?]),
    DriverKind::Conda | DriverKind::Mamba => {
      let mut args = vec![
        "create".to_string(),
        "-y".to_string(),
        "--download-only".to_string(),
        "-p".to_string(),
        build_dir.join("fetch-env").display().to_string(),
      ];
      args.extend(conda_channel_args(request));
      args.push(conda_spec(request));
      Some(args)
    }
  }
}

/// One-time setup of the environment prefix, if the tool needs it and it
/// has not been done yet.
pub fn prepare_args(kind: DriverKind, prefix: &Path) -> Option<Vec<String>> {
  let prefix_arg = prefix.display().to_string();
  match kind {
    DriverKind::EasyBuild => None,
    DriverKind::Spack if !prefix.join("spack.yaml").exists() => {
      Some(vec!["env".to_string(), "create".to_string(), "-d".to_string(), prefix_arg])
    }
    DriverKind::Conda | DriverKind::Mamba if !prefix.join("conda-meta").exists() => {
      Some(vec!["create".to_string(), "-y".to_string(), "-p".to_string(), prefix_arg])
    }
    _ => None,
  }
}

pub fn install_args(kind: DriverKind, request: &BuildRequest, prefix: &Path, extra: &[String]) -> Option<Vec<String>> {
  let prefix_arg = prefix.display().to_string();
  let args = match kind {
    DriverKind::EasyBuild => {
      let mut args = vec![
        "--robot".to_string(),
        "--umask=002".to_string(),
        format!("--installpath={}", prefix_arg),
      ];
      if needs_cuda_test_bypass(request) {
        args.push("--ignore-test-failure".to_string());
      }
      args.extend(extra.iter().cloned());
      args.push(easyconfig_name(request)?);
      args
    }
    DriverKind::Spack => {
      let mut args = vec!["-e".to_string(), prefix_arg, "install".to_string()];
      args.extend(extra.iter().cloned());
      args.push("--add".to_string());
      args.push(spack_spec(request)?);
      args
    }
    DriverKind::Conda | DriverKind::Mamba => {
      let mut args = vec!["install".to_string(), "-y".to_string(), "-p".to_string(), prefix_arg];
      args.extend(conda_channel_args(request));
      args.extend(extra.iter().cloned());
      args.push(conda_spec(request));
      args
    }
  };
  Some(args)
}

/// `eb --missing-modules`: what a build of `request` would still install.
pub fn missing_modules_args(request: &BuildRequest, prefix: &Path) -> Option<Vec<String>> {
  Some(vec![
    "--missing-modules".to_string(),
    format!("--installpath={}", prefix.display()),
    easyconfig_name(request)?,
  ])
}

/// Easyconfigs listed by `eb --missing-modules`, one `* <module> (<easyconfig>)`
/// line each.
pub fn parse_missing_modules(output: &str) -> Vec<String> {
  output
    .lines()
    .filter_map(|line| {
      let (module, rest) = line.trim().strip_prefix("* ")?.split_once(" (")?;
      let easyconfig = rest.strip_suffix(')')?;
      (!module.contains(char::is_whitespace) && easyconfig.ends_with(".eb")).then(|| easyconfig.to_string())
    })
    .collect()
}

/// Whether an installed set already holds a version `request` accepts.
pub fn satisfies(installed: &[InstalledPackage], request: &BuildRequest) -> bool {
  installed
    .iter()
    .any(|p| p.name == request.name() && request.version().matches(&p.version))
}

/// Command that lists what is installed in the prefix, if the tool has one.
pub fn query_args(kind: DriverKind, prefix: &Path) -> Option<Vec<String>> {
  let prefix_arg = prefix.display().to_string();
  match kind {
    DriverKind::EasyBuild => None,
    DriverKind::Spack => Some(vec![
      "-e".to_string(),
      prefix_arg,
      "find".to_string(),
      "--format".to_string(),
      "{name}@{version}".to_string(),
    ]),
    DriverKind::Conda | DriverKind::Mamba => Some(vec![
      "list".to_string(),
      "--json".to_string(),
      "-p".to_string(),
      prefix_arg,
    ]),
  }
}

#[derive(Debug, Deserialize)]
struct CondaListEntry {
  name: String,
  version: String,
}

/// Parse `conda list --json` output.
pub fn parse_conda_list(kind: DriverKind, output: &str) -> Result<Vec<InstalledPackage>, serde_json::Error> {
  let entries: Vec<CondaListEntry> = serde_json::from_str(output)?;
  Ok(
    entries
      .into_iter()
      .filter_map(|e| package(kind, e.name, &e.version))
      .collect(),
  )
}

/// Parse `spack find --format {name}@{version}` output, skipping headers.
pub fn parse_spack_find(output: &str) -> Vec<InstalledPackage> {
  output
    .lines()
    .map(str::trim)
    .filter(|l| !l.is_empty() && !l.starts_with("==>") && !l.starts_with("--"))
    .filter_map(|line| {
      let (name, version) = line.rsplit_once('@')?;
      package(DriverKind::Spack, name.to_string(), version)
    })
    .collect()
}

/// EasyBuild has no cheap listing; the requested pin is what got installed.
pub fn requested_package(kind: DriverKind, request: &BuildRequest) -> Vec<InstalledPackage> {
  request
    .version()
    .pinned()
    .map(|v| InstalledPackage::new(request.name(), v.clone(), kind))
    .into_iter()
    .collect()
}

fn package(kind: DriverKind, name: String, version: &str) -> Option<InstalledPackage> {
  match Version::parse(version) {
    Ok(v) => Some(InstalledPackage::new(name, v, kind)),
    Err(e) => {
      warn!(package = %name, version = %version, error = %e, "ignoring unparseable installed version");
      None
    }
  }
}
