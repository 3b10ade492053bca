use std::time::Duration;

use metabuild_lib::RequestState;
use metabuild_lib::config::BuildSettings;
use metabuild_lib::environment::FailureKind;

use super::common::{TestBed, fast_settings, req};

#[tokio::test]
async fn network_failures_retry_up_to_the_limit() {
  let bed = TestBed::new(
    r#"  zlib-*) echo "curl: (6) Could not resolve host: zlib.net" >&2; exit 1 ;;"#,
  );
  let orch = bed.orchestrator();

  let report = orch.run(vec![req("zlib", "1.3")]).await.unwrap();

  assert_eq!(bed.install_count("zlib-1.3.eb"), 3);
  let zlib = report.request("zlib").unwrap();
  assert_eq!(zlib.state, RequestState::Failed);
  assert_eq!(zlib.attempts, 3);
  assert_eq!(zlib.outcome.failure, Some(FailureKind::Fatal));
  let reason = &zlib.error.as_ref().unwrap().reason;
  assert!(reason.ends_with("(gave up after 3 attempts)"), "{}", reason);

  let builds = bed.layout().builds().join("bio").join("zlib_1.3");
  for attempt in 1..=3 {
    assert!(builds.join(format!("attempt-{}", attempt)).join("build.log").is_file());
  }
}

#[tokio::test]
async fn transient_failure_then_success() {
  let scratch = tempfile::TempDir::new().unwrap();
  let marker = scratch.path().join("failed-once");
  let bed = TestBed::new(&format!(
    r#"  zlib-*)
    if [ ! -e "{marker}" ]; then
      touch "{marker}"
      echo "Connection reset by peer" >&2
      exit 1
    fi ;;"#,
    marker = marker.display(),
  ));

  let report = bed.orchestrator().run(vec![req("zlib", "1.3")]).await.unwrap();

  assert!(report.is_success());
  assert_eq!(report.request("zlib").unwrap().attempts, 2);
  assert_eq!(bed.install_count("zlib-1.3.eb"), 2);
}

#[tokio::test]
async fn compile_errors_are_not_retried() {
  let bed = TestBed::new(r#"  zlib-*) echo "make: *** [all] Error 2" >&2; exit 2 ;;"#);

  let report = bed.orchestrator().run(vec![req("zlib", "1.3")]).await.unwrap();

  assert_eq!(bed.install_count("zlib-1.3.eb"), 1);
  assert_eq!(report.request("zlib").unwrap().attempts, 1);
}

#[tokio::test]
async fn timeouts_are_transient() {
  let bed = TestBed::new(r#"  zlib-*) sleep 5 ;;"#);
  let orch = bed.orchestrator().with_settings(BuildSettings {
    retry_limit: 1,
    invocation_timeout: Duration::from_millis(300),
    ..fast_settings()
  });

  let report = tokio::time::timeout(Duration::from_secs(15), orch.run(vec![req("zlib", "1.3")]))
    .await
    .unwrap()
    .unwrap();

  let zlib = report.request("zlib").unwrap();
  assert_eq!(zlib.state, RequestState::Failed);
  assert_eq!(zlib.attempts, 2);
  let reason = &zlib.error.as_ref().unwrap().reason;
  assert!(reason.starts_with("install timed out after"), "{}", reason);
}
