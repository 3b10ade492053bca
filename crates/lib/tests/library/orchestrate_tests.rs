use std::time::Duration;

use metabuild_lib::error::ConflictError;
use metabuild_lib::execute::{ManifestStatus, SkipCause};
use metabuild_lib::resolve::ResolveError;
use metabuild_lib::{BuildPolicy, EnvironmentStatus, Error, RequestState};

use super::common::{TestBed, req};

#[tokio::test]
async fn builds_in_dependency_order_and_saves_manifest() {
  let bed = TestBed::new("");
  let orch = bed.orchestrator();

  let report = orch
    .run(vec![
      req("netCDF", "4.9.2").depends_on("HDF5"),
      req("HDF5", "1.14.0").depends_on("zlib"),
      req("zlib", "1.3"),
    ])
    .await
    .unwrap();

  assert!(report.is_success(), "{:?}", report.requests);
  assert_eq!(
    bed.installs(),
    vec!["zlib-1.3.eb", "HDF5-1.14.0.eb", "netCDF-4.9.2.eb"]
  );
  let names: Vec<_> = report.requests.iter().map(|r| r.name()).collect();
  assert_eq!(names, vec!["zlib", "HDF5", "netCDF"]);

  let zlib = report.request("zlib").unwrap();
  let log = zlib.outcome.log.as_ref().unwrap();
  assert!(log.ends_with("zlib_1.3/attempt-1/build.log"));
  assert!(std::fs::read_to_string(log).unwrap().contains("installed zlib-1.3.eb"));

  let ManifestStatus::Saved(id) = &report.manifest else {
    panic!("expected a saved manifest, got {:?}", report.manifest);
  };
  let saved = orch.store().unwrap().load(id).unwrap();
  assert_eq!(saved, report.environment);
  assert_eq!(saved.packages().len(), 3);
}

#[tokio::test]
async fn fatal_failure_skips_dependents() {
  let bed = TestBed::new(
    r#"  HDF5-*) echo "error: compilation of H5Dchunk.c failed" >&2; exit 2 ;;"#,
  );
  let orch = bed.orchestrator();

  let report = orch
    .run(vec![
      req("zlib", "1.3"),
      req("HDF5", "1.14.0").depends_on("zlib"),
      req("netCDF", "4.9.2").depends_on("HDF5"),
      req("bzip2", "1.0.8"),
    ])
    .await
    .unwrap();

  assert_eq!(report.status(), EnvironmentStatus::Failed);
  assert_eq!(bed.install_count("HDF5-1.14.0.eb"), 1);
  assert_eq!(bed.install_count("netCDF-4.9.2.eb"), 0);

  let hdf5 = report.request("HDF5").unwrap();
  assert_eq!(hdf5.state, RequestState::Failed);
  assert_eq!(hdf5.outcome.exit_code, Some(2));
  let reason = &hdf5.error.as_ref().unwrap().reason;
  assert!(reason.starts_with("install failed with exit code 2"), "{}", reason);

  let netcdf = report.request("netCDF").unwrap();
  assert_eq!(netcdf.state, RequestState::Skipped);
  assert_eq!(netcdf.skip, Some(SkipCause::FailedDependency("HDF5".to_string())));

  assert_eq!(report.request("bzip2").unwrap().state, RequestState::Succeeded);
  assert!(matches!(report.manifest, ManifestStatus::NotSaved));
  assert!(orch.store().unwrap().list().unwrap().is_empty());
}

#[tokio::test]
async fn conflicting_versions_fail_before_any_tool_runs() {
  let bed = TestBed::new("");
  let err = bed
    .orchestrator()
    .run(vec![req("HDF5", "1.12.2"), req("zlib", "1.3"), req("HDF5", "1.14.0")])
    .await
    .unwrap_err();

  assert!(matches!(
    err,
    Error::Resolve(ResolveError::Conflict(ConflictError::IncompatibleVersions { .. }))
  ));
  assert!(bed.installs().is_empty());
}

#[tokio::test]
async fn dependency_cycle_is_a_conflict() {
  let bed = TestBed::new("");
  let err = bed
    .orchestrator()
    .run(vec![req("a", "1.0").depends_on("b"), req("b", "1.0").depends_on("a")])
    .await
    .unwrap_err();

  match err {
    Error::Resolve(ResolveError::Conflict(ConflictError::Cycle { members })) => {
      assert_eq!(members, vec!["a", "b"]);
    }
    other => panic!("expected a cycle, got {other:?}"),
  }
  assert!(bed.installs().is_empty());
}

#[tokio::test]
async fn excluded_category_is_skipped_with_its_dependents() {
  let bed = TestBed::new("");
  let orch = bed
    .orchestrator()
    .with_policy(BuildPolicy::permissive().excluding("vis"));

  let report = orch
    .run(vec![
      req("ParaView", "5.11.2").with_category("vis"),
      req("ParaView-plugins", "1.0").depends_on("ParaView"),
      req("zlib", "1.3"),
    ])
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(bed.installs(), vec!["zlib-1.3.eb"]);

  let paraview = report.request("ParaView").unwrap();
  assert_eq!(paraview.skip, Some(SkipCause::Policy));
  assert_eq!(
    paraview.outcome.reason.as_deref(),
    Some("module class excluded via exclude")
  );
  let plugins = report.request("ParaView-plugins").unwrap();
  assert_eq!(plugins.state, RequestState::Skipped);
  assert_eq!(plugins.skip, Some(SkipCause::SkippedDependency("ParaView".to_string())));
  assert_eq!(
    plugins.outcome.reason.as_deref(),
    Some("dependency skipped: ParaView")
  );
}

#[tokio::test]
async fn installed_modules_are_not_rebuilt() {
  let bed = TestBed::new("");
  let orch = bed.orchestrator();

  orch
    .run(vec![req("zlib", "1.3"), req("HDF5", "1.14.0").depends_on("zlib")])
    .await
    .unwrap();
  let second = orch
    .run(vec![
      req("zlib", "1.3"),
      req("HDF5", "1.14.0").depends_on("zlib"),
      req("bzip2", "1.0.8"),
    ])
    .await
    .unwrap();

  assert!(second.is_success());
  assert_eq!(bed.installs(), vec!["zlib-1.3.eb", "HDF5-1.14.0.eb", "bzip2-1.0.8.eb"]);
  let hdf5 = second.request("HDF5").unwrap();
  assert_eq!(hdf5.state, RequestState::Succeeded);
  assert_eq!(hdf5.outcome.reason.as_deref(), Some("already installed"));
  assert_eq!(second.request("bzip2").unwrap().outcome.reason, None);
  assert_eq!(second.environment.packages().len(), 3);
}

#[tokio::test]
async fn dropping_a_run_kills_its_tools() {
  let scratch = tempfile::TempDir::new().unwrap();
  let marker = scratch.path().join("finished");
  let bed = TestBed::new(&format!(
    r#"  zlib-*) sleep 1; touch "{marker}" ;;"#,
    marker = marker.display(),
  ));
  let orch = bed.orchestrator();

  let run = orch.run(vec![req("zlib", "1.3")]);
  assert!(tokio::time::timeout(Duration::from_millis(300), run).await.is_err());

  tokio::time::sleep(Duration::from_millis(1500)).await;
  assert!(!marker.exists(), "tool kept running after the run was dropped");
}
