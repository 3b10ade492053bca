//! Append-only store of environment manifests.
//!
//! A manifest is written once when an environment build succeeds and never
//! changes afterwards; rebuilding an environment produces a new manifest.

mod storage;
mod types;

pub use storage::ManifestStore;
pub use types::*;
