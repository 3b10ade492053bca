//! Deciding whether a failed tool run is worth retrying.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::consts::LOG_TAIL_BYTES;
use crate::environment::FailureKind;

use super::process::RunStatus;

/// Log fragments (lowercase) that point at the network or a mirror rather
/// than the package itself.
const TRANSIENT_PATTERNS: &[&str] = &[
  "connection reset",
  "connection refused",
  "connection timed out",
  "connection aborted",
  "could not resolve host",
  "temporary failure in name resolution",
  "name or service not known",
  "network is unreachable",
  "no route to host",
  "timed out while",
  "read timed out",
  "ssl: unexpected eof",
  "remote end closed connection",
  "http error 500",
  "http error 502",
  "http error 503",
  "http error 504",
  "502 bad gateway",
  "503 service unavailable",
  "504 gateway time",
  "condahttperror",
  "connectionerror",
  "failed to download",
  "download failed",
  "fetchfailed",
  "checksum verification failed",
  "too many requests",
];

/// Classify a finished run. Timeouts are transient; a non-zero exit is
/// transient only when the log tail matches a known network pattern.
pub fn classify(status: RunStatus, log_tail: &str) -> FailureKind {
  match status {
    RunStatus::TimedOut => FailureKind::Transient,
    RunStatus::Cancelled => FailureKind::Fatal,
    RunStatus::Exited(_) if looks_transient(log_tail) => FailureKind::Transient,
    RunStatus::Exited(_) => FailureKind::Fatal,
  }
}

pub fn looks_transient(log_tail: &str) -> bool {
  let lower = log_tail.to_ascii_lowercase();
  TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// The last `LOG_TAIL_BYTES` of a log; empty when the log cannot be read.
pub fn read_log_tail(path: &Path) -> String {
  tail(path, LOG_TAIL_BYTES).unwrap_or_default()
}

fn tail(path: &Path, max: u64) -> io::Result<String> {
  let mut file = File::open(path)?;
  let len = file.metadata()?.len();
  file.seek(SeekFrom::Start(len.saturating_sub(max)))?;
  let mut buf = Vec::new();
  file.read_to_end(&mut buf)?;
  Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Last non-empty line of the log, for short failure reasons.
pub fn last_line(log_tail: &str) -> Option<&str> {
  log_tail.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn timeout_is_transient() {
    assert_eq!(classify(RunStatus::TimedOut, ""), FailureKind::Transient);
  }

  #[test]
  fn network_errors_are_transient() {
    let log = "== fetching sources...\nERROR: Could not resolve host: ftp.gnu.org\n";
    assert_eq!(classify(RunStatus::Exited(Some(1)), log), FailureKind::Transient);

    let conda = "CondaHTTPError: HTTP 000 CONNECTION FAILED for url <https://conda.anaconda.org/...>";
    assert_eq!(classify(RunStatus::Exited(Some(1)), conda), FailureKind::Transient);
  }

  #[test]
  fn compile_errors_are_fatal() {
    let log = "make[2]: *** [Makefile:123: foo.o] Error 1\nerror: 'bar' undeclared";
    assert_eq!(classify(RunStatus::Exited(Some(2)), log), FailureKind::Fatal);
    assert_eq!(classify(RunStatus::Exited(None), ""), FailureKind::Fatal);
  }

  #[test]
  fn reads_only_the_tail() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("build.log");
    let mut content = "x".repeat(100);
    content.push_str("\nconnection reset by peer\n");
    std::fs::write(&path, &content).unwrap();

    let tail = tail(&path, 30).unwrap();
    assert_eq!(tail.len(), 30);
    assert!(looks_transient(&tail));
    assert_eq!(last_line(&tail), Some("connection reset by peer"));
  }

  #[test]
  fn missing_log_gives_empty_tail() {
    let temp = TempDir::new().unwrap();
    assert_eq!(read_log_tail(&temp.path().join("missing.log")), "");
  }
}
