use std::time::{Duration, Instant};

use metabuild_lib::execute::cancel::cancellation;
use metabuild_lib::execute::{ManifestStatus, SkipCause};
use metabuild_lib::{EnvironmentStatus, RequestState};

use super::common::{TestBed, req};

#[tokio::test]
async fn cancellation_stops_a_running_tool() {
  let bed = TestBed::new(r#"  HDF5-*) sleep 30 ;;"#);
  let orch = bed.orchestrator();
  let (handle, signal) = cancellation();

  let started = Instant::now();
  let run = tokio::spawn(async move {
    orch
      .run_with_cancel(
        vec![
          req("HDF5", "1.14.0"),
          req("netCDF", "4.9.2").depends_on("HDF5"),
        ],
        signal,
      )
      .await
  });
  tokio::time::sleep(Duration::from_millis(500)).await;
  handle.cancel();

  let report = tokio::time::timeout(Duration::from_secs(10), run)
    .await
    .unwrap()
    .unwrap()
    .unwrap();

  assert!(started.elapsed() < Duration::from_secs(10));
  assert_eq!(report.status(), EnvironmentStatus::Cancelled);
  let hdf5 = report.request("HDF5").unwrap();
  assert_eq!(hdf5.state, RequestState::Failed);
  assert_eq!(hdf5.outcome.reason.as_deref(), Some("install cancelled"));
  let netcdf = report.request("netCDF").unwrap();
  assert_eq!(netcdf.skip, Some(SkipCause::Cancelled));
  assert_eq!(bed.install_count("netCDF-4.9.2.eb"), 0);
  assert!(matches!(report.manifest, ManifestStatus::NotSaved));
}

#[tokio::test]
async fn cancelled_before_start_builds_nothing() {
  let bed = TestBed::new("");
  let (handle, signal) = cancellation();
  handle.cancel();

  let report = bed
    .orchestrator()
    .run_with_cancel(vec![req("zlib", "1.3"), req("bzip2", "1.0.8")], signal)
    .await
    .unwrap();

  assert!(bed.installs().is_empty());
  assert_eq!(report.count(RequestState::Skipped), 2);
  assert!(report.requests.iter().all(|r| r.skip == Some(SkipCause::Cancelled)));
  assert_eq!(report.status(), EnvironmentStatus::Cancelled);
}
