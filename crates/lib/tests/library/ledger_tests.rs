use metabuild_lib::config::LedgerSettings;
use metabuild_lib::execute::SkipCause;
use metabuild_lib::ledger::{LedgerStatus, StatusLedger};
use metabuild_lib::{BuildPolicy, EnvironmentStatus, RequestState};

use super::common::{TestBed, env_id, req};

#[tokio::test]
async fn second_run_reuses_successes_and_skips_failures() {
  let bed = TestBed::new(r#"  bzip2-*) echo "error: configure failed" >&2; exit 3 ;;"#);
  let ledger = StatusLedger::new(bed.layout().ledger());
  let orch = bed
    .orchestrator()
    .with_ledger(ledger.clone(), LedgerSettings::default());
  let requests = || vec![req("zlib", "1.3"), req("bzip2", "1.0.8")];

  let first = orch.run(requests()).await.unwrap();
  assert_eq!(first.status(), EnvironmentStatus::Failed);
  assert_eq!(bed.installs().len(), 2);

  let recorded = ledger.load(&env_id()).unwrap();
  assert_eq!(recorded.status("zlib@1.3"), LedgerStatus::Success);
  let bzip2 = recorded.get("bzip2@1.0.8").unwrap();
  assert_eq!(bzip2.status, LedgerStatus::Error);
  assert_eq!(bzip2.returncode, Some(3));
  assert_eq!(bzip2.errorcount, 1);

  let second = orch.run(requests()).await.unwrap();
  assert_eq!(bed.installs().len(), 2, "nothing should be rebuilt");

  let zlib = second.request("zlib").unwrap();
  assert!(zlib.reused);
  assert_eq!(zlib.state, RequestState::Succeeded);
  let skipped = second.request("bzip2").unwrap();
  assert_eq!(skipped.skip, Some(SkipCause::Ledger(LedgerStatus::Error)));
  assert!(skipped.outcome.reason.as_deref().unwrap().starts_with("previous build failed: install failed"));
  assert_eq!(second.status(), EnvironmentStatus::Failed);

  // Ledger-derived skips are not written back.
  assert_eq!(ledger.load(&env_id()).unwrap().get("bzip2@1.0.8").unwrap().errorcount, 1);
}

#[tokio::test]
async fn retry_failed_rebuilds_previous_errors() {
  let bed = TestBed::new(r#"  bzip2-*) exit 3 ;;"#);
  let ledger = StatusLedger::new(bed.layout().ledger());
  let settings = LedgerSettings {
    retry_failed: true,
    ..LedgerSettings::default()
  };
  let orch = bed.orchestrator().with_ledger(ledger.clone(), settings);

  orch.run(vec![req("bzip2", "1.0.8")]).await.unwrap();
  orch.run(vec![req("bzip2", "1.0.8")]).await.unwrap();

  assert_eq!(bed.install_count("bzip2-1.0.8.eb"), 2);
  assert_eq!(ledger.load(&env_id()).unwrap().get("bzip2@1.0.8").unwrap().errorcount, 2);
}

#[tokio::test]
async fn unreadable_ledger_stops_the_run() {
  let bed = TestBed::new("");
  let ledger = StatusLedger::new(bed.layout().ledger());
  std::fs::create_dir_all(ledger.dir()).unwrap();
  std::fs::write(ledger.path(&env_id()), "{ not json").unwrap();

  let result = bed
    .orchestrator()
    .with_ledger(ledger, LedgerSettings::default())
    .run(vec![req("zlib", "1.3")])
    .await;

  assert!(matches!(result, Err(metabuild_lib::Error::Ledger(_))));
  assert!(bed.installs().is_empty());
}

#[tokio::test]
async fn dependents_of_skipped_requests_are_not_recorded() {
  let bed = TestBed::new("");
  let ledger = StatusLedger::new(bed.layout().ledger());
  let orch = bed
    .orchestrator()
    .with_policy(BuildPolicy::permissive().excluding("vis"))
    .with_ledger(ledger.clone(), LedgerSettings::default());
  let report = orch
    .run(vec![
      req("ParaView", "5.11.2").with_category("vis"),
      req("ParaView-plugins", "1.0").depends_on("ParaView"),
    ])
    .await
    .unwrap();

  assert_eq!(
    report.request("ParaView-plugins").unwrap().skip,
    Some(SkipCause::SkippedDependency("ParaView".to_string()))
  );
  let recorded = ledger.load(&env_id()).unwrap();
  assert_eq!(recorded.status("ParaView@5.11.2"), LedgerStatus::Skipped);
  assert!(recorded.get("ParaView-plugins@1.0").is_none());
}
