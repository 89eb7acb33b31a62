//! Behavioural tests for pools persisted as local JSON files.

use hangar::backend::LocalFileBackend;
use hangar::test_support::handle;
use hangar::{CheckoutOutcome, InsertPosition, PoolSnapshot, PoolStore, RetryPolicy};
use tempfile::TempDir;

fn pool_dir(tmp: &TempDir) -> String {
    tmp.path().join("pools").to_string_lossy().into_owned()
}

fn store(dir: &str) -> PoolStore<LocalFileBackend> {
    PoolStore::new(LocalFileBackend::in_dir(dir), "Nightly Builds")
        .expect("store")
        .with_retry_policy(RetryPolicy::immediate(3))
}

#[tokio::test]
async fn pool_survives_across_backend_instances() {
    let tmp = TempDir::new().expect("tempdir");
    let dir = pool_dir(&tmp);
    let writer = store(&dir);
    writer
        .checkin(handle("a"), InsertPosition::Back)
        .await
        .expect("checkin a");
    writer
        .checkin(handle("b"), InsertPosition::Back)
        .await
        .expect("checkin b");

    let reader = store(&dir);
    let CheckoutOutcome::Acquired(first) = reader.checkout().await.expect("checkout") else {
        panic!("pool should hold two handles");
    };

    assert_eq!(first.id, "a");
    assert_eq!(first.activation_secret.expose(), "secret-a");
    let remaining = writer.read().await.expect("read");
    let ids: Vec<_> = remaining.resources.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["b"]);
}

#[tokio::test]
async fn snapshot_file_is_named_after_the_project_key() {
    let tmp = TempDir::new().expect("tempdir");
    let dir = pool_dir(&tmp);
    let pool = store(&dir);
    assert_eq!(pool.key(), "pool_nightly-builds");

    pool.checkin(handle("a"), InsertPosition::Back)
        .await
        .expect("checkin");

    let path = tmp.path().join("pools").join("pool_nightly-builds.json");
    let bytes = std::fs::read(&path).expect("snapshot file");
    let snapshot = PoolSnapshot::decode(&bytes).expect("decode");
    assert_eq!(snapshot.version, 1);
    assert!(snapshot.contains("a"));
}

#[tokio::test]
async fn missing_directory_is_created_on_first_use() {
    let tmp = TempDir::new().expect("tempdir");
    let nested = tmp
        .path()
        .join("deep")
        .join("er")
        .to_string_lossy()
        .into_owned();
    let pool = store(&nested);

    let snapshot = pool.read().await.expect("read");

    assert!(snapshot.is_empty());
    assert!(tmp.path().join("deep").join("er").is_dir());
}
