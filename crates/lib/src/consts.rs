//! Crate-wide constants.

/// Application name used for data, config and cache directories.
pub const APP_NAME: &str = "metabuild";

/// Environment variable overriding the data root (environments, builds, manifests).
pub const HOME_ENV_VAR: &str = "METABUILD_HOME";

/// Environment variable overriding the config file path.
pub const CONFIG_ENV_VAR: &str = "METABUILD_CONFIG";

/// Length of the truncated content hash used in manifest ids.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Version of the manifest index file format.
pub const MANIFEST_INDEX_VERSION: u32 = 1;

/// Version of the status ledger file format.
pub const LEDGER_VERSION: u32 = 1;

/// Name of the per-environment lock file inside the environment prefix.
pub const ENV_LOCK_FILENAME: &str = ".lock";

/// Name of the captured tool log inside a request's build directory.
pub const BUILD_LOG_FILENAME: &str = "build.log";

/// Number of trailing log bytes scanned when classifying a tool failure.
pub const LOG_TAIL_BYTES: u64 = 16 * 1024;

/// Value exported as SOURCE_DATE_EPOCH to every tool invocation.
/// 315532800 is January 1, 1980 00:00:00 UTC (ZIP epoch).
pub const SOURCE_DATE_EPOCH: &str = "315532800";
