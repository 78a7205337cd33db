// Remote failure handling: artifact service over HTTP and an unreachable
// remote index.

mod common;

use calstore::{
    ArtifactSource, CalibrationCache, CalibrationRecord, CalibrationStore, HttpArtifactClient, IdStrategy,
    ImportKind, MetadataConfig, MetadataIndex, Origin, SqliteIndex, StoreConfig, StoreError, Version,
    VersionFamily,
};
use common::{INSTRUMENT, dark, init_tracing};
use httpmock::Method::GET;
use httpmock::MockServer;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// A store whose local index knows one uncached calibration and whose
/// artifacts come from `base_url`.
async fn store_with_http(
    base_url: &str,
    timeout_secs: u64,
) -> (CalibrationStore, CalibrationRecord, TempDir) {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let mut config = StoreConfig::new(temp.path(), INSTRUMENT);
    config.remote.timeout_secs = timeout_secs;

    let local = Arc::new(SqliteIndex::in_memory(VersionFamily::default()).await.unwrap());
    let record = CalibrationRecord::from_draft(
        IdStrategy::Random.generate(INSTRUMENT, "dark_h.fits", &Origin::Keck, Version::FIRST),
        INSTRUMENT,
        &dark("dark_h.fits"),
        Origin::Keck,
        Version::FIRST,
        time::OffsetDateTime::now_utc().replace_nanosecond(0).unwrap(),
    );
    local.import(&record, ImportKind::Fetched).await.unwrap();

    let client = HttpArtifactClient::new(base_url, config.remote.timeout()).unwrap();
    let cache = CalibrationCache::new(config.calibrations_dir()).await.unwrap();
    let artifacts = Arc::new(client) as Arc<dyn ArtifactSource>;
    let store = CalibrationStore::from_parts(config, cache, local, Some(artifacts)).unwrap();
    (store, record, temp)
}

#[tokio::test]
async fn test_http_fetch_on_miss() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/cal/hispec/dark_h.fits");
        then.status(200).body("from http");
    });

    let (store, record, _temp) = store_with_http(&server.url("/cal"), 5).await;
    let resolved = store.get_calibration(record.id).await.unwrap();
    assert_eq!(std::fs::read(&resolved.path).unwrap(), b"from http");

    // Second call is a cache hit.
    store.get_calibration(record.id).await.unwrap();
    mock.assert_hits(1);
}

#[tokio::test]
async fn test_http_timeout_is_remote_unavailable() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/hispec/dark_h.fits");
        then.status(200).body("late").delay(Duration::from_secs(4));
    });

    let (store, record, temp) = store_with_http(&server.base_url(), 1).await;
    match store.get_calibration(record.id).await {
        Err(StoreError::RemoteUnavailable(_)) => {}
        other => panic!("expected RemoteUnavailable, got {other:?}"),
    }
    // A timed-out fetch leaves nothing behind.
    assert!(
        !temp
            .path()
            .join("calibrations")
            .join(INSTRUMENT)
            .join("dark_h.fits")
            .exists()
    );
}

#[tokio::test]
async fn test_http_server_error_is_remote_unavailable() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/hispec/dark_h.fits");
        then.status(502);
    });

    let (store, record, _temp) = store_with_http(&server.base_url(), 5).await;
    assert!(matches!(
        store.get_calibration(record.id).await,
        Err(StoreError::RemoteUnavailable(_))
    ));
}

#[tokio::test]
async fn test_unreachable_remote_index() {
    init_tracing();
    let port = match TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => listener.local_addr().unwrap().port(),
        Err(_) => {
            eprintln!("Skipping: cannot bind to localhost");
            return;
        }
    };
    let temp = TempDir::new().unwrap();
    let mut config = StoreConfig::new(temp.path(), INSTRUMENT);
    config.remote.timeout_secs = 2;
    config.remote.index = Some(MetadataConfig::postgres_url(format!(
        "postgres://calstore@127.0.0.1:{port}/calibrations"
    )));
    let store = CalibrationStore::open(config).await.unwrap();

    assert!(matches!(
        store.sync_from_remote().await,
        Err(StoreError::RemoteUnavailable(_))
    ));
    assert!(matches!(
        store.get_calibration(uuid::Uuid::new_v4()).await,
        Err(StoreError::RemoteUnavailable(_))
    ));
}

#[tokio::test]
async fn test_remote_index_handle_can_be_injected() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let config = StoreConfig::new(temp.path(), INSTRUMENT);
    let remote = Arc::new(SqliteIndex::in_memory(VersionFamily::default()).await.unwrap());
    remote
        .insert_versioned(&dark("dark_1.fits"), INSTRUMENT, &Origin::Keck, IdStrategy::Random)
        .await
        .unwrap();

    let store = CalibrationStore::open(config)
        .await
        .unwrap()
        .with_remote_index(remote.clone() as Arc<dyn MetadataIndex>);
    assert!(store.has_remote());
    assert_eq!(store.sync_from_remote().await.unwrap().len(), 1);

    store.close().await;
    assert!(remote.health_check().await.is_err());
}
