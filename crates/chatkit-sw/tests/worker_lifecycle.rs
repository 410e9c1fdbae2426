//! End-to-end cache worker flows: install, intercept, go offline, replace the generation.

use std::sync::Arc;
use std::time::Duration;

use chatkit_common::{init_logging, LogConfig, ManualClock};
use chatkit_net::{Destination, Request, ResponseSource, StubFetcher};
use chatkit_sw::{
    CacheStorage, CacheWorker, FetchEvent, Route, WorkerConfig, WorkerEvent, WorkerRegistration, WorkerState,
};
use tokio::sync::RwLock;
use url::Url;

const ORIGIN: &str = "https://chat.example";

fn init_tracing() {
    let _ = init_logging(LogConfig::for_tests("chatkit_sw=debug"));
}

fn fixture_fetcher() -> Arc<StubFetcher> {
    let fetcher = Arc::new(StubFetcher::new());
    for (path, body) in [
        ("/", "<html>root</html>"),
        ("/index.html", "<html>shell</html>"),
        ("/manifest.json", r#"{"name":"ChatKit"}"#),
        ("/favicon.ico", "ico"),
        ("/chatapp.png", "png"),
        ("/static/js/main.1a2b.js", "main()"),
        ("/static/css/main.3c4d.css", "body{}"),
        ("/static/js/chunk.9f.js", "chunk()"),
    ] {
        fetcher.insert(&format!("{ORIGIN}{path}"), 200, body);
    }
    fetcher.insert_json(
        &format!("{ORIGIN}/asset-manifest.json"),
        r#"{"files":{"main.js":"/static/js/main.1a2b.js","main.css":"/static/css/main.3c4d.css"}}"#,
    );
    fetcher
}

fn config(generation: &str) -> WorkerConfig {
    WorkerConfig {
        scope: format!("{ORIGIN}/"),
        generation: generation.to_string(),
        skip_waiting_on_install: false,
        ..Default::default()
    }
}

fn worker(generation: &str, fetcher: Arc<StubFetcher>, clock: &ManualClock, caches: Arc<RwLock<CacheStorage>>) -> CacheWorker {
    worker_with(config(generation), fetcher, clock, caches)
}

fn worker_with(
    config: WorkerConfig,
    fetcher: Arc<StubFetcher>,
    clock: &ManualClock,
    caches: Arc<RwLock<CacheStorage>>,
) -> CacheWorker {
    CacheWorker::with_storage(config, fetcher, Arc::new(clock.clone()), caches).unwrap()
}

fn image(path: &str) -> FetchEvent {
    let request = Request::parse(&format!("{ORIGIN}{path}"))
        .unwrap()
        .destination(Destination::Image);
    FetchEvent::new(request)
}

fn script(path: &str) -> FetchEvent {
    let request = Request::parse(&format!("{ORIGIN}{path}"))
        .unwrap()
        .destination(Destination::Script);
    FetchEvent::new(request)
}

#[tokio::test]
async fn test_offline_after_install_serves_from_cache() {
    init_tracing();
    let fetcher = fixture_fetcher();
    let clock = ManualClock::new(1_700_000_000_000);
    let caches = Arc::new(RwLock::new(CacheStorage::new()));
    let (registration, _events) = WorkerRegistration::new(Url::parse(ORIGIN).unwrap());

    registration
        .install(worker("v1", fetcher.clone(), &clock, caches.clone()))
        .await
        .unwrap();

    // Populate the static partition with a chunk the install step did not cache.
    let online = registration.handle_fetch(&script("/static/js/chunk.9f.js")).await.unwrap();
    assert_eq!(online.route, Route::Static);
    assert_eq!(online.response.http().unwrap().source, ResponseSource::Network);

    fetcher.set_online(false);

    let chunk = registration.handle_fetch(&script("/static/js/chunk.9f.js")).await.unwrap();
    assert!(chunk.response.http().unwrap().from_cache());
    assert_eq!(chunk.response.http().unwrap().body, "chunk()");

    let navigation = FetchEvent::new(Request::navigate(Url::parse(&format!("{ORIGIN}/rooms/general")).unwrap()));
    let shell = registration.handle_fetch(&navigation).await.unwrap();
    assert_eq!(shell.response.http().unwrap().body, "<html>shell</html>");

    let api = FetchEvent::new(Request::parse(&format!("{ORIGIN}/api/rooms")).unwrap());
    let api = registration.handle_fetch(&api).await.unwrap();
    assert!(api.response.is_network_error());
}

#[tokio::test]
async fn test_precached_assets_work_offline_right_after_install() {
    init_tracing();
    let fetcher = fixture_fetcher();
    let clock = ManualClock::new(1_700_000_000_000);
    let caches = Arc::new(RwLock::new(CacheStorage::new()));
    let (registration, _events) = WorkerRegistration::new(Url::parse(ORIGIN).unwrap());

    registration
        .install(worker("v1", fetcher.clone(), &clock, caches.clone()))
        .await
        .unwrap();
    fetcher.set_online(false);

    let main = registration.handle_fetch(&script("/static/js/main.1a2b.js")).await.unwrap();
    assert_eq!(main.route, Route::Static);
    let response = main.response.http().unwrap();
    assert!(response.from_cache());
    assert_eq!(response.body, "main()");

    let icon = registration.handle_fetch(&image("/chatapp.png")).await.unwrap();
    assert_eq!(icon.route, Route::Image);
    let response = icon.response.http().unwrap();
    assert!(response.from_cache());
    assert_eq!(response.body, "png");

    let root = FetchEvent::new(Request::navigate(Url::parse(&format!("{ORIGIN}/")).unwrap()));
    let root = registration.handle_fetch(&root).await.unwrap();
    assert_eq!(root.response.http().unwrap().body, "<html>root</html>");
}

#[tokio::test]
async fn test_persistent_cache_serves_after_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = WorkerConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..config("v1")
    };
    let clock = ManualClock::new(1_700_000_000_000);

    {
        let fetcher = fixture_fetcher();
        let worker = CacheWorker::open(config.clone(), fetcher.clone(), Arc::new(clock.clone()))
            .await
            .unwrap();
        let (registration, _events) = WorkerRegistration::new(Url::parse(ORIGIN).unwrap());
        registration.install(worker).await.unwrap();
        registration.handle_fetch(&script("/static/js/chunk.9f.js")).await.unwrap();
    }

    let fetcher = fixture_fetcher();
    fetcher.set_online(false);
    let worker = CacheWorker::open(config, fetcher.clone(), Arc::new(clock.clone()))
        .await
        .unwrap();
    assert!(worker.caches().read().await.is_persistent());

    let main = worker.on_fetch(&script("/static/js/main.1a2b.js")).await.unwrap();
    assert_eq!(main.response.http().unwrap().body, "main()");
    let chunk = worker.on_fetch(&script("/static/js/chunk.9f.js")).await.unwrap();
    assert_eq!(chunk.response.http().unwrap().body, "chunk()");
    let navigation = FetchEvent::new(Request::navigate(Url::parse(&format!("{ORIGIN}/rooms/7")).unwrap()));
    let shell = worker.on_fetch(&navigation).await.unwrap();
    assert_eq!(shell.response.http().unwrap().body, "<html>shell</html>");
    assert_eq!(fetcher.call_count(&format!("{ORIGIN}/static/js/main.1a2b.js")), 0);
    assert_eq!(fetcher.call_count(&format!("{ORIGIN}/static/js/chunk.9f.js")), 0);
}

#[tokio::test]
async fn test_manifest_is_stale_while_revalidate() {
    let fetcher = fixture_fetcher();
    let clock = ManualClock::new(1_700_000_000_000);
    let caches = Arc::new(RwLock::new(CacheStorage::new()));
    let (registration, _events) = WorkerRegistration::new(Url::parse(ORIGIN).unwrap());
    // Leave the manifest out of the install step so its own route serves it.
    let config = WorkerConfig {
        precache_urls: vec!["/".to_string(), "/index.html".to_string()],
        ..config("v1")
    };
    registration
        .install(worker_with(config, fetcher.clone(), &clock, caches.clone()))
        .await
        .unwrap();

    let manifest = || FetchEvent::new(Request::parse(&format!("{ORIGIN}/manifest.json")).unwrap());
    let first = registration.handle_fetch(&manifest()).await.unwrap();
    assert_eq!(first.route, Route::Manifest);

    clock.advance(Duration::from_secs(31 * 24 * 60 * 60));
    fetcher.insert(&format!("{ORIGIN}/manifest.json"), 200, r#"{"name":"ChatKit 2"}"#);

    let stale = registration.handle_fetch(&manifest()).await.unwrap();
    assert_eq!(stale.response.http().unwrap().body, r#"{"name":"ChatKit"}"#);
    stale.revalidation.unwrap().await.unwrap();

    let fresh = registration.handle_fetch(&manifest()).await.unwrap();
    assert_eq!(fresh.response.http().unwrap().body, r#"{"name":"ChatKit 2"}"#);
    if let Some(revalidation) = fresh.revalidation {
        revalidation.await.unwrap();
    }

    let caches = caches.read().await;
    assert_eq!(caches.get("chatkit-manifest-v1").unwrap().len(), 1);
}

#[tokio::test]
async fn test_new_generation_replaces_old_partitions() {
    init_tracing();
    let fetcher = fixture_fetcher();
    let clock = ManualClock::new(1_700_000_000_000);
    let caches = Arc::new(RwLock::new(CacheStorage::new()));
    let (registration, mut events) = WorkerRegistration::new(Url::parse(ORIGIN).unwrap());

    registration
        .install(worker("v1", fetcher.clone(), &clock, caches.clone()))
        .await
        .unwrap();
    registration.handle_fetch(&script("/static/js/chunk.9f.js")).await.unwrap();
    let page = registration.add_client().await;

    let v2 = registration
        .install(worker("v2", fetcher.clone(), &clock, caches.clone()))
        .await
        .unwrap();
    assert_eq!(registration.worker_state(v2).await, Some(WorkerState::Installed));
    assert!(caches.read().await.has("chatkit-static-v1"));

    registration.post_message(r#"{"type":"SKIP_WAITING"}"#).await.unwrap();

    assert_eq!(registration.active_generation().await.as_deref(), Some("v2"));
    assert_eq!(registration.controller(page).await, Some(v2));
    let names = caches.read().await.keys();
    assert!(names.iter().all(|name| name.ends_with("-v2")), "{names:?}");
    assert!(names.contains(&"chatkit-shell-v2".to_string()));

    let mut claimed = false;
    while let Ok(event) = events.try_recv() {
        if event == (WorkerEvent::ControllerChange { client_id: page, worker_id: v2 }) {
            claimed = true;
        }
    }
    assert!(claimed);
}

#[tokio::test]
async fn test_image_partition_eviction_through_worker() {
    let fetcher = fixture_fetcher();
    let clock = ManualClock::new(1_700_000_000_000);
    let caches = Arc::new(RwLock::new(CacheStorage::new()));
    let (registration, _events) = WorkerRegistration::new(Url::parse(ORIGIN).unwrap());
    registration
        .install(worker("v1", fetcher.clone(), &clock, caches.clone()))
        .await
        .unwrap();

    for i in 0..61 {
        let url = format!("{ORIGIN}/avatars/{i}.png");
        fetcher.insert(&url, 200, "png");
        let event = FetchEvent::new(Request::parse(&url).unwrap().destination(Destination::Image));
        registration.handle_fetch(&event).await.unwrap();
        clock.advance(Duration::from_millis(10));
    }

    let caches = caches.read().await;
    let images = caches.get("chatkit-image-v1").unwrap();
    assert_eq!(images.len(), 60);
    assert!(images.get(&format!("GET {ORIGIN}/avatars/0.png")).is_none());
    assert!(images.get(&format!("GET {ORIGIN}/avatars/60.png")).is_some());
}
