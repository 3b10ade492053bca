use metabuild_lib::ManifestStore;
use metabuild_lib::execute::ManifestStatus;
use metabuild_lib::manifest::PersistenceError;

use super::common::{TestBed, env_id, req};

#[tokio::test]
async fn rebuilding_the_same_environment_appends_an_identical_manifest() {
  let bed = TestBed::new("");
  let orch = bed.orchestrator();
  let requests = || vec![req("zlib", "1.3"), req("HDF5", "1.14.0").depends_on("zlib")];

  let first = orch.run(requests()).await.unwrap();
  let second = orch.run(requests()).await.unwrap();

  let first_id = first.manifest.id().unwrap();
  let second_id = second.manifest.id().unwrap();
  assert_ne!(first_id, second_id);

  let store = orch.store().unwrap();
  let a = store.load_manifest(first_id).unwrap();
  let b = store.load_manifest(second_id).unwrap();
  assert_eq!(a.content_hash, b.content_hash);
  assert_eq!(a.packages, b.packages);

  assert_eq!(store.list().unwrap().len(), 2);
  assert_eq!(&store.latest(&env_id()).unwrap().unwrap().id, second_id);
}

#[tokio::test]
async fn unwritable_store_degrades_a_successful_build() {
  let bed = TestBed::new("");
  let blocker = bed.root().join("not-a-dir");
  std::fs::write(&blocker, "").unwrap();
  let orch = bed
    .orchestrator()
    .with_store(ManifestStore::new(blocker.join("manifests")));

  let report = orch.run(vec![req("zlib", "1.3")]).await.unwrap();

  assert!(report.is_success());
  assert!(report.is_degraded());
  assert!(matches!(
    report.manifest,
    ManifestStatus::Degraded(PersistenceError::CreateDir(_))
  ));
  assert!(report.environment.packages().contains_key("zlib"));
}

#[tokio::test]
async fn without_store_nothing_is_saved() {
  let bed = TestBed::new("");
  let report = bed
    .orchestrator()
    .without_store()
    .run(vec![req("zlib", "1.3")])
    .await
    .unwrap();

  assert!(report.is_success());
  assert!(matches!(report.manifest, ManifestStatus::NotSaved));
  assert!(!bed.layout().manifests().exists());
}
