// Consistency tests for concurrent writers sharing one cache directory.
// Separate CalibrationCache instances stand in for separate processes.

use bytes::Bytes;
use calstore_storage::{CacheLookup, CalibrationCache, StorageError, WritePolicy};
use std::sync::Arc;
use tempfile::TempDir;

async fn open(root: &std::path::Path) -> Arc<CalibrationCache> {
    Arc::new(CalibrationCache::new(root).await.unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_writers_leave_one_complete_artifact() {
    for round in 0..10 {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("calibrations");
        let mut caches = Vec::new();
        for _ in 0..8 {
            caches.push(open(&root).await);
        }

        let tasks: Vec<_> = caches
            .iter()
            .enumerate()
            .map(|(i, cache)| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let data = Bytes::from(vec![i as u8; 256 * 1024]);
                    cache
                        .store("hispec", "flat.fits", data, WritePolicy::KeepExisting)
                        .await
                })
            })
            .collect();

        let mut written = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => written += 1,
                Err(StorageError::CacheConflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(written, 1, "round {round}");
        assert_eq!(conflicts, 7, "round {round}");

        // The winner's bytes are on disk in full.
        let data = caches[0].read("hispec", "flat.fits").await.unwrap();
        assert_eq!(data.len(), 256 * 1024);
        assert!(data.iter().all(|b| *b == data[0]));
        assert_eq!(caches[1].list("hispec").await.unwrap(), vec!["flat.fits"]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_identical_writers_across_handles_all_succeed() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("calibrations");
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = open(&root).await;
        tasks.push(tokio::spawn(async move {
            cache
                .store(
                    "hispec",
                    "bias.fits",
                    Bytes::from(vec![9u8; 64 * 1024]),
                    WritePolicy::KeepExisting,
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    let cache = open(&root).await;
    assert_eq!(cache.list("hispec").await.unwrap(), vec!["bias.fits"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_files_written_concurrently() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open(&temp_dir.path().join("calibrations")).await;

    let tasks: Vec<_> = (0..50u8)
        .map(|i| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .store(
                        "hispec",
                        &format!("dark_{i:03}.fits"),
                        Bytes::from(vec![i]),
                        WritePolicy::KeepExisting,
                    )
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let names = cache.list("hispec").await.unwrap();
    assert_eq!(names.len(), 50);
    assert_eq!(names[0], "dark_000.fits");
    assert!(
        cache
            .resolve("hispec", "dark_049.fits")
            .await
            .unwrap()
            .is_hit()
    );
}

#[tokio::test]
async fn test_instruments_do_not_share_files() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open(&temp_dir.path().join("calibrations")).await;
    cache
        .store(
            "hispec",
            "bias.fits",
            Bytes::from_static(b"hispec"),
            WritePolicy::KeepExisting,
        )
        .await
        .unwrap();
    assert_eq!(
        cache.resolve("parvi", "bias.fits").await.unwrap(),
        CacheLookup::Miss
    );
    cache
        .store(
            "parvi",
            "bias.fits",
            Bytes::from_static(b"parvi"),
            WritePolicy::KeepExisting,
        )
        .await
        .unwrap();
    assert_eq!(
        cache.read("hispec", "bias.fits").await.unwrap(),
        Bytes::from_static(b"hispec")
    );
}
