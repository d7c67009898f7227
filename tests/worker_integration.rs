mod support;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use tempfile::TempDir;

use shellcache::manifest::{ManifestEntry, PrecacheManifest};
use shellcache::settings::Settings;
use shellcache::worker::disk::DiskStorage;
use shellcache::worker::message::ControlMessage;
use shellcache::worker::plan::CachePlan;
use shellcache::worker::request::{SEC_FETCH_MODE, WorkerRequest};
use shellcache::worker::store::{CacheStorage, CachedResponse, MemoryStorage};
use shellcache::worker::{FetchEvent, FetchOutcome, ServiceWorker, WorkerOptions};

use support::*;

fn build_worker(
    settings: &Settings,
    manifest: PrecacheManifest,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<ScriptedFetcher>,
) -> ServiceWorker {
    let plan = CachePlan::new(&settings.app_prefix, &settings.version, settings);
    ServiceWorker::new(
        plan,
        manifest,
        storage,
        fetcher,
        WorkerOptions::from(settings),
    )
}

async fn active_worker(
    settings: &Settings,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<ScriptedFetcher>,
) -> Result<ServiceWorker> {
    fetcher.ok("/offline.html", "<h1>offline</h1>");
    let worker = build_worker(settings, PrecacheManifest::empty(), storage, fetcher);
    worker.handle_install().await?;
    worker.handle_activate().await?;
    Ok(worker)
}

fn get_request(path: &str) -> WorkerRequest {
    WorkerRequest::get(path.parse().expect("valid uri"))
}

fn navigation_request(path: &str) -> WorkerRequest {
    let mut request = get_request(path);
    request
        .headers
        .insert(SEC_FETCH_MODE, HeaderValue::from_static("navigate"));
    request
}

fn stamped(body: &str, age: Duration) -> CachedResponse {
    let mut response = CachedResponse::new(
        StatusCode::OK,
        HeaderMap::new(),
        Bytes::from(body.to_string()),
    );
    response.stamp_cached_at(SystemTime::now() - age);
    response
}

fn expect_body(outcome: FetchOutcome) -> Bytes {
    match outcome {
        FetchOutcome::Respond { response, .. } => response.body,
        FetchOutcome::Failed { error, .. } => panic!("fetch failed: {error}"),
        FetchOutcome::Bypass => panic!("request unexpectedly bypassed"),
    }
}

// Property: N concurrent requests for the same identity issue exactly one
// network fetch, and every caller sees the same outcome.
#[tokio::test]
async fn concurrent_identical_fetches_collapse_to_one() -> Result<()> {
    let settings = test_settings("1", "http://origin.test");
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let worker = Arc::new(active_worker(&settings, storage, fetcher.clone()).await?);

    fetcher.ok("/bundle.js", "the bundle");
    fetcher.set_delay(Some(Duration::from_millis(50)));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let worker = worker.clone();
        handles.push(tokio::spawn(async move {
            worker
                .handle_fetch(FetchEvent::new(get_request("/bundle.js")))
                .await
        }));
    }
    for handle in handles {
        let body = expect_body(handle.await?);
        assert_eq!(body, Bytes::from_static(b"the bundle"));
    }
    assert_eq!(fetcher.hits("/bundle.js"), 1);
    Ok(())
}

// Property: stale-while-revalidate returns a prior cached write immediately,
// regardless of its age, without waiting on the network leg.
#[tokio::test]
async fn swr_hit_never_waits_for_the_network() -> Result<()> {
    let settings = test_settings("1", "http://origin.test");
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let worker = active_worker(&settings, storage.clone(), fetcher.clone()).await?;

    let runtime = storage.open("drinkshell-runtime-v1").await?;
    runtime
        .put(
            "/app.css",
            stamped("ancient css", Duration::from_secs(400 * 86_400)),
        )
        .await?;
    fetcher.ok("/app.css", "new css");
    fetcher.set_delay(Some(Duration::from_secs(2)));

    let outcome = tokio::time::timeout(
        Duration::from_millis(300),
        worker.handle_fetch(FetchEvent::new(get_request("/app.css"))),
    )
    .await
    .expect("cached response must not wait on the revalidation fetch");
    assert_eq!(expect_body(outcome), Bytes::from_static(b"ancient css"));
    Ok(())
}

// Property: after a write-and-trim cycle on a namespace with cap M, at most
// M entries remain and the removed ones are exactly the oldest by insertion
// order.
#[tokio::test]
async fn trimming_evicts_oldest_first() -> Result<()> {
    let mut settings = test_settings("1", "http://origin.test");
    settings.runtime_max_entries = 3;
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let worker = active_worker(&settings, storage.clone(), fetcher.clone()).await?;

    for i in 0..5 {
        let path = format!("/asset-{i}.js");
        fetcher.ok(&path, "asset");
        let outcome = worker.handle_fetch(FetchEvent::new(get_request(&path))).await;
        expect_body(outcome);
    }

    let runtime = storage.open("drinkshell-runtime-v1").await?;
    assert_eq!(
        runtime.keys().await?,
        vec!["/asset-2.js", "/asset-3.js", "/asset-4.js"]
    );
    Ok(())
}

// Property: an activate cycle removes every namespace carrying a prior
// version tag and leaves current-version namespaces untouched.
#[tokio::test]
async fn activation_isolates_versions() -> Result<()> {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new());

    let v1_settings = test_settings("1", "http://origin.test");
    let v1 = active_worker(&v1_settings, storage.clone(), fetcher.clone()).await?;
    let runtime_v1 = storage.open("drinkshell-runtime-v1").await?;
    runtime_v1
        .put("/app.js", stamped("v1 bundle", Duration::ZERO))
        .await?;

    let v2_settings = test_settings("2", "http://origin.test");
    let v2 = active_worker(&v2_settings, storage.clone(), fetcher.clone()).await?;
    v1.lifecycle().supersede();

    let names = storage.list().await?;
    assert!(!names.iter().any(|name| name.ends_with("-v1")));
    assert!(names.contains(&"drinkshell-offline-v2".to_string()));

    // The new version's own namespaces were not disturbed.
    let offline = storage.open("drinkshell-offline-v2").await?;
    assert!(offline.get("/offline.html").await?.is_some());
    let _ = v2;
    Ok(())
}

// Property: a navigation that fails network and page cache resolves to the
// precached offline page, byte for byte.
#[tokio::test]
async fn offline_navigation_is_deterministic() -> Result<()> {
    let settings = test_settings("1", "http://origin.test");
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let worker = active_worker(&settings, storage, fetcher.clone()).await?;

    fetcher.set_offline(true);
    for _ in 0..3 {
        let outcome = worker
            .handle_fetch(FetchEvent::new(navigation_request("/never-seen")))
            .await;
        assert_eq!(expect_body(outcome), Bytes::from_static(b"<h1>offline</h1>"));
    }
    Ok(())
}

// Property: CLEAR_CACHE twice in a row leaves the store empty both times
// and the second call does not error.
#[tokio::test]
async fn purge_all_is_idempotent() -> Result<()> {
    let settings = test_settings("1", "http://origin.test");
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let worker = active_worker(&settings, storage.clone(), fetcher.clone()).await?;

    for round in 0..2 {
        worker.handle_message(ControlMessage::ClearCache).await?;
        let owned: Vec<String> = storage
            .list()
            .await?
            .into_iter()
            .filter(|name| name.starts_with("drinkshell-"))
            .collect();
        assert!(owned.is_empty(), "round {round} left namespaces: {owned:?}");
    }
    Ok(())
}

// Scenario: install with a two-entry manifest where one fetch fails still
// completes, and the surviving entry is retrievable afterwards.
#[tokio::test]
async fn install_tolerates_partial_precache_failure() -> Result<()> {
    let settings = test_settings("1", "http://origin.test");
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new());

    // "/" is not scripted, so its precache fetch fails; offline.html works.
    fetcher.ok("/offline.html?__shellcache_rev=b", "offline body");
    fetcher.ok("/offline.html", "offline body");
    fetcher.status(
        "/?__shellcache_rev=a",
        StatusCode::INTERNAL_SERVER_ERROR,
        "boom",
    );

    let manifest = PrecacheManifest::from_entries(vec![
        ManifestEntry {
            url: "/".to_string(),
            revision: Some("a".to_string()),
        },
        ManifestEntry {
            url: "/offline.html".to_string(),
            revision: Some("b".to_string()),
        },
    ]);
    let worker = build_worker(&settings, manifest, storage.clone(), fetcher);

    let report = worker.handle_install().await?;
    assert_eq!(report.attempted, 2);
    assert_eq!(report.precached, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].url, "/");

    let precache = storage.open("drinkshell-precache-v1").await?;
    let entry = precache.get("/offline.html").await?.expect("entry present");
    assert_eq!(entry.body, Bytes::from_static(b"offline body"));
    Ok(())
}

// Scenario: a network-first API request that times out with a prior cached
// response present returns the cached response, not an error.
#[tokio::test]
async fn api_timeout_falls_back_to_cache() -> Result<()> {
    let mut settings = test_settings("1", "http://origin.test");
    settings.api_timeout = 1;
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let worker = active_worker(&settings, storage.clone(), fetcher.clone()).await?;

    let api = storage.open("drinkshell-api-v1").await?;
    api.put(
        "/api/status",
        stamped("{\"ok\":true}", Duration::from_secs(3600)),
    )
    .await?;

    fetcher.ok("/api/status", "{\"ok\":\"fresh\"}");
    fetcher.set_delay(Some(Duration::from_secs(10)));

    let outcome = worker
        .handle_fetch(FetchEvent::new(get_request("/api/status")))
        .await;
    assert_eq!(expect_body(outcome), Bytes::from_static(b"{\"ok\":true}"));
    Ok(())
}

// Disk storage carries one version's caches across a restart, and the next
// version's activation purges them.
#[tokio::test]
async fn disk_backed_version_rollover() -> Result<()> {
    let dir = TempDir::new()?;
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.ok("/app.js", "persisted bundle");

    {
        let settings = test_settings("1", "http://origin.test");
        let storage: Arc<dyn CacheStorage> =
            Arc::new(DiskStorage::new(dir.path().to_path_buf()).await?);
        let worker = active_worker(&settings, storage.clone(), fetcher.clone()).await?;
        expect_body(
            worker
                .handle_fetch(FetchEvent::new(get_request("/app.js")))
                .await,
        );
    }

    // Restart on the same directory: the v1 entry survived.
    {
        let storage: Arc<dyn CacheStorage> =
            Arc::new(DiskStorage::new(dir.path().to_path_buf()).await?);
        let runtime = storage.open("drinkshell-runtime-v1").await?;
        let entry = runtime.get("/app.js").await?.expect("entry persisted");
        assert_eq!(entry.body, Bytes::from_static(b"persisted bundle"));

        // A new worker version activates and leaves no v1 namespaces.
        let settings = test_settings("2", "http://origin.test");
        let _worker = active_worker(&settings, storage.clone(), fetcher.clone()).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let names = storage.list().await?;
        assert!(!names.iter().any(|name| name.ends_with("-v1")));
    }
    Ok(())
}
