//! metabuild-lib: build environments out of EasyBuild, Spack, Conda and Mamba
//!
//! A caller hands the [`Orchestrator`] a list of [`BuildRequest`]s for one
//! environment. The orchestrator:
//! - `resolve`: merges duplicates, rejects conflicts and cycles, applies the
//!   build policy and picks a driver per request
//! - `execute`: runs the drivers in dependency order with bounded
//!   parallelism, retries transient failures and skips what cannot build
//! - `manifest`: records every successful environment as an immutable manifest
//! - `ledger`: remembers per-request results across runs

pub mod config;
pub mod consts;
pub mod driver;
pub mod environment;
pub mod error;
pub mod execute;
pub mod hash;
pub mod ledger;
pub mod manifest;
pub mod paths;
pub mod request;
pub mod resolve;

#[cfg(test)]
pub mod testutil;

pub use config::Config;
pub use driver::{Driver, DriverKind, DriverRegistry, ToolDriver};
pub use environment::{Environment, EnvironmentStatus, Outcome};
pub use error::{Error, Result};
pub use execute::{BuildReport, Orchestrator, RequestState};
pub use manifest::{ManifestId, ManifestStore};
pub use request::{BuildRequest, EnvironmentId, Toolchain, Version, VersionConstraint};
pub use resolve::{BuildPlan, BuildPolicy};
