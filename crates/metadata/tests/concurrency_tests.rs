//! Concurrent version assignment against shared index files.

mod common;

use calstore_core::{CalibrationRecord, IdStrategy, Origin};
use calstore_metadata::MetadataIndex;
use common::{TestIndex, dark, postgres_or_skip};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const MAX_ATTEMPTS: usize = 100;

/// Register with the same recompute-and-retry loop the store applies.
async fn register_retrying(index: Arc<dyn MetadataIndex>, filename: String) -> CalibrationRecord {
    let draft = dark(&filename, "2024-09-24T12:00:00.000");
    for attempt in 0..MAX_ATTEMPTS {
        match index
            .insert_versioned(&draft, "hispec", &Origin::Local, IdStrategy::Random)
            .await
        {
            Ok(record) => return record,
            Err(err) if err.is_retryable() => {
                tokio::time::sleep(Duration::from_millis(2 + attempt as u64)).await;
            }
            Err(err) => panic!("unexpected error registering {filename}: {err}"),
        }
    }
    panic!("gave up registering {filename}");
}

fn assert_gap_free(records: &[CalibrationRecord]) {
    let versions: HashSet<u16> = records.iter().map(|r| r.version.get()).collect();
    assert_eq!(versions.len(), records.len(), "duplicate versions assigned");
    let expected: HashSet<u16> = (1..=records.len() as u16).collect();
    assert_eq!(versions, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_siblings_single_handle() {
    let test = TestIndex::new().await.unwrap();
    let index = test.index();

    let tasks: Vec<_> = (0..12)
        .map(|i| tokio::spawn(register_retrying(index.clone(), format!("dark_{i}.fits"))))
        .collect();
    let records: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_gap_free(&records);
    assert_eq!(index.count().await.unwrap(), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_siblings_across_handles() {
    let test = TestIndex::new().await.unwrap();
    let first: Arc<dyn MetadataIndex> = test.index();
    let second: Arc<dyn MetadataIndex> = test.reopen().await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let index = if i % 2 == 0 {
                first.clone()
            } else {
                second.clone()
            };
            tokio::spawn(register_retrying(index, format!("dark_{i}.fits")))
        })
        .collect();
    let records: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_gap_free(&records);
    assert_eq!(first.count().await.unwrap(), 8);
    assert_eq!(second.count().await.unwrap(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_siblings_postgres() {
    let Some(postgres) = postgres_or_skip().await else {
        return;
    };
    let first: Arc<dyn MetadataIndex> = postgres.index();
    let second: Arc<dyn MetadataIndex> = postgres.reopen().await.unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let index = if i % 2 == 0 {
                first.clone()
            } else {
                second.clone()
            };
            tokio::spawn(register_retrying(index, format!("dark_{i}.fits")))
        })
        .collect();
    let records: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_gap_free(&records);
}
