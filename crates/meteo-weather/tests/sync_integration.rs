//! Sync reconciler against a wiremock sync backend.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meteo_weather::{
    CacheKey, CacheStore, Clock, Coordinate, FetchPolicy, Freshness, GridResolution,
    HttpSyncBackend, ManualClock, OpenWeatherClient, ProviderConfig, ReconcilerSettings,
    RetryConfig, SqliteCache, SyncBackend, SyncDocument, SyncOperation, SyncOutcome, SyncQueue,
    SyncReconciler, TtlConfig, TtlPolicy, Units, UpsertOutcome, WeatherEvents, WeatherRecord,
    WeatherRepository, WeatherResult, Wind,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DOC_PATH: &str = "/v1/devices/phone-1/weather/3777:-12241/0";

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn san_francisco() -> Coordinate {
    Coordinate::new(37.77, -122.41).unwrap()
}

fn key() -> CacheKey {
    CacheKey::for_coordinate(&san_francisco(), 0, GridResolution::default())
}

fn record(temperature: f64, version: &str) -> WeatherRecord {
    WeatherRecord {
        coordinate: san_francisco(),
        observed_at: t0(),
        temperature,
        feels_like: None,
        humidity: 60,
        pressure: None,
        wind: Wind { speed: 3.0, direction: Some(270) },
        condition_code: 800,
        description: None,
        place_name: Some("San Francisco".into()),
        horizon: 0,
        units: Units::Metric,
        version: version.into(),
    }
}

struct Harness {
    reconciler: Arc<SyncReconciler>,
    cache: Arc<SqliteCache>,
    queue: Arc<SyncQueue>,
    clock: Arc<ManualClock>,
    events: WeatherEvents,
}

impl Harness {
    fn new(backend: Arc<dyn SyncBackend>, max_attempts: u32) -> Self {
        let cache = Arc::new(SqliteCache::in_memory(TtlConfig::default()).unwrap());
        let queue = Arc::new(SyncQueue::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let events = WeatherEvents::new();
        let settings = ReconcilerSettings {
            retry: RetryConfig::new(max_attempts, 1_000, 10_000),
            poll_interval: Duration::from_secs(60),
        };

        let reconciler = Arc::new(SyncReconciler::new(
            queue.clone(),
            cache.clone(),
            backend,
            events.clone(),
            clock.clone(),
            settings,
        ));

        Self {
            reconciler,
            cache,
            queue,
            clock,
            events,
        }
    }

    fn http(server: &MockServer, max_attempts: u32) -> Self {
        let backend = HttpSyncBackend::new(
            server.uri(),
            "phone-1",
            Some("secret".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        Self::new(Arc::new(backend), max_attempts)
    }

    fn cache_local(&self, temperature: f64, version: &str) {
        self.cache
            .put(&key(), &record(temperature, version), TtlPolicy::Current, t0())
            .unwrap();
    }

    fn enqueue(&self, operation: SyncOperation) -> i64 {
        self.queue.enqueue(&key(), operation, self.clock.now()).unwrap().unwrap()
    }
}

#[tokio::test]
async fn test_upload_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(DOC_PATH))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(serde_json::json!({
            "bucket": "3777:-12241",
            "horizon": 0,
            "temperature": 18.5,
            "version": "v1"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::http(&server, 3);
    h.cache_local(18.5, "v1");
    h.enqueue(SyncOperation::Upload);

    let outcome = h.reconciler.process_next().await.unwrap();
    assert_eq!(outcome, SyncOutcome::Uploaded(key()));
    assert_eq!(h.queue.pending_count().unwrap(), 0);
    assert_eq!(h.reconciler.process_next().await.unwrap(), SyncOutcome::Idle);
}

#[tokio::test]
async fn test_conflict_with_newer_remote_overwrites_local() {
    let server = MockServer::start().await;
    let h = Harness::http(&server, 3);
    h.cache_local(18.5, "local");

    let local = h.cache.get(&key(), t0()).unwrap().unwrap();
    let mut remote = SyncDocument::from_entry(&local);
    remote.temperature = 25.0;
    remote.version = "remote".into();
    remote.fetched_at = t0() + chrono::Duration::minutes(10);

    Mock::given(method("PUT"))
        .and(path(DOC_PATH))
        .respond_with(ResponseTemplate::new(409).set_body_json(&remote))
        .expect(1)
        .mount(&server)
        .await;

    let mut subscription = h.events.subscribe(key().bucket);
    h.enqueue(SyncOperation::Upload);

    let outcome = h.reconciler.process_next().await.unwrap();
    assert_eq!(outcome, SyncOutcome::RemoteWon(key()));

    let cached = h.cache.get(&key(), t0()).unwrap().unwrap();
    assert_eq!(cached.record.version, "remote");
    assert_eq!(cached.record.temperature, 25.0);
    assert_eq!(cached.fetched_at, remote.fetched_at);

    let update = subscription.try_recv().unwrap();
    assert_eq!(update.record.version, "remote");
    assert_eq!(h.queue.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_conflict_with_older_remote_keeps_local() {
    let server = MockServer::start().await;
    let h = Harness::http(&server, 3);
    h.cache_local(18.5, "local");

    let local = h.cache.get(&key(), t0()).unwrap().unwrap();
    let mut remote = SyncDocument::from_entry(&local);
    remote.version = "ancient".into();
    remote.fetched_at = t0() - chrono::Duration::hours(1);

    Mock::given(method("PUT"))
        .and(path(DOC_PATH))
        .respond_with(ResponseTemplate::new(409).set_body_json(&remote))
        .mount(&server)
        .await;

    h.enqueue(SyncOperation::Upload);
    assert_eq!(
        h.reconciler.process_next().await.unwrap(),
        SyncOutcome::Skipped(key())
    );
    let cached = h.cache.get(&key(), t0()).unwrap().unwrap();
    assert_eq!(cached.record.version, "local");
}

#[tokio::test]
async fn test_failures_back_off_then_dead_letter() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(DOC_PATH))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let h = Harness::http(&server, 2);
    h.cache_local(18.5, "v1");
    let id = h.enqueue(SyncOperation::Upload);

    let first = h.reconciler.process_next().await.unwrap();
    assert_eq!(
        first,
        SyncOutcome::Retrying {
            key: key(),
            attempts: 1
        }
    );

    // Not due again until the backoff passes
    assert_eq!(h.reconciler.process_next().await.unwrap(), SyncOutcome::Idle);

    h.clock.advance(chrono::Duration::seconds(5));
    let second = h.reconciler.process_next().await.unwrap();
    assert_eq!(second, SyncOutcome::DeadLettered(key()));
    assert_eq!(h.queue.pending_count().unwrap(), 0);

    let dead = h.reconciler.list_dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].attempts, 2);
    assert!(dead[0].last_error.as_deref().unwrap().contains("503"));

    assert!(h.reconciler.retry_dead_letter(id).await.unwrap());
    assert_eq!(h.queue.dead_letter_count().unwrap(), 0);
    let pending = h.queue.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 0);

    assert!(!h.reconciler.retry_dead_letter(9999).await.unwrap());
}

#[tokio::test]
async fn test_download_newer_remote() {
    let server = MockServer::start().await;
    let h = Harness::http(&server, 3);

    let mut remote = SyncDocument::from_entry(&{
        let scratch = SqliteCache::in_memory(TtlConfig::default()).unwrap();
        scratch
            .put(&key(), &record(12.0, "from-tablet"), TtlPolicy::Current, t0())
            .unwrap();
        scratch.get(&key(), t0()).unwrap().unwrap()
    });
    remote.server_timestamp = Some(t0());

    Mock::given(method("GET"))
        .and(path(DOC_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(&remote))
        .expect(1)
        .mount(&server)
        .await;

    let mut subscription = h.events.subscribe(key().bucket);
    h.enqueue(SyncOperation::Download);

    assert_eq!(
        h.reconciler.process_next().await.unwrap(),
        SyncOutcome::Downloaded(key())
    );
    let cached = h.cache.get(&key(), t0()).unwrap().unwrap();
    assert_eq!(cached.record.version, "from-tablet");
    assert_eq!(cached.record.wind.direction, Some(270));
    assert!(subscription.try_recv().is_some());
}

#[tokio::test]
async fn test_requested_pull_downloads_remote_copy() {
    let server = MockServer::start().await;
    let h = Harness::http(&server, 3);

    let remote = SyncDocument::from_entry(&{
        let scratch = SqliteCache::in_memory(TtlConfig::default()).unwrap();
        scratch
            .put(&key(), &record(12.0, "from-tablet"), TtlPolicy::Current, t0())
            .unwrap();
        scratch.get(&key(), t0()).unwrap().unwrap()
    });
    Mock::given(method("GET"))
        .and(path(DOC_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(&remote))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenWeatherClient::new(ProviderConfig::new("key").with_base_url(server.uri())).unwrap();
    let repo = WeatherRepository::builder(Arc::new(client), h.cache.clone())
        .clock(h.clock.clone())
        .sync(h.queue.clone(), h.reconciler.notifier())
        .build();

    assert!(repo.request_pull(san_francisco(), 0).await.unwrap());
    assert_eq!(
        h.reconciler.process_next().await.unwrap(),
        SyncOutcome::Downloaded(key())
    );

    // Served from the pulled copy without a provider call
    let reading = repo
        .get_weather(san_francisco(), 0, FetchPolicy::fresh_only())
        .await
        .unwrap();
    assert_eq!(reading.freshness, Freshness::Fresh);
    assert_eq!(reading.record.version, "from-tablet");
}

#[tokio::test]
async fn test_download_skips_when_local_is_newer() {
    let server = MockServer::start().await;
    let h = Harness::http(&server, 3);
    h.cache_local(18.5, "local");

    let local = h.cache.get(&key(), t0()).unwrap().unwrap();
    let mut remote = SyncDocument::from_entry(&local);
    remote.version = "old".into();
    remote.fetched_at = t0() - chrono::Duration::minutes(1);

    Mock::given(method("GET"))
        .and(path(DOC_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(&remote))
        .mount(&server)
        .await;

    h.enqueue(SyncOperation::Download);
    assert_eq!(
        h.reconciler.process_next().await.unwrap(),
        SyncOutcome::Skipped(key())
    );
    assert_eq!(h.cache.get(&key(), t0()).unwrap().unwrap().record.version, "local");
}

#[tokio::test]
async fn test_download_missing_document() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DOC_PATH))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::http(&server, 3);
    h.enqueue(SyncOperation::Download);

    assert_eq!(
        h.reconciler.process_next().await.unwrap(),
        SyncOutcome::Skipped(key())
    );
    assert_eq!(h.queue.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_upload_without_cached_entry_is_dropped() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = Harness::http(&server, 3);
    h.enqueue(SyncOperation::Upload);

    assert_eq!(
        h.reconciler.process_next().await.unwrap(),
        SyncOutcome::Skipped(key())
    );
    assert_eq!(h.queue.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_run_loop_drains_and_wakes_on_notify() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(DOC_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let h = Harness::http(&server, 3);
    h.cache_local(18.5, "v1");
    h.enqueue(SyncOperation::Upload);

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(h.reconciler.clone().run(cancel.clone()));

    wait_until_drained(&h.queue).await;

    // Poll interval is a minute, so only the notification can wake the worker
    h.enqueue(SyncOperation::Upload);
    h.reconciler.notifier().notify_one();
    wait_until_drained(&h.queue).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();
}

async fn wait_until_drained(queue: &SyncQueue) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.pending_count().unwrap() + queue.in_flight_count().unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

/// Backend that counts upserts and takes a moment to answer.
struct SlowBackend {
    upserts: AtomicU32,
}

#[async_trait]
impl SyncBackend for SlowBackend {
    async fn upsert(&self, _key: &CacheKey, _document: &SyncDocument) -> WeatherResult<UpsertOutcome> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(UpsertOutcome::Accepted)
    }

    async fn fetch(&self, _key: &CacheKey) -> WeatherResult<Option<SyncDocument>> {
        Ok(None)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_workers_process_task_once() {
    let backend = Arc::new(SlowBackend {
        upserts: AtomicU32::new(0),
    });
    let h = Harness::new(backend.clone(), 3);
    h.cache_local(18.5, "v1");
    h.enqueue(SyncOperation::Upload);

    let (a, b) = tokio::join!(h.reconciler.process_next(), h.reconciler.process_next());
    let mut outcomes = [a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, SyncOutcome::Idle));

    assert_eq!(outcomes[0], SyncOutcome::Uploaded(key()));
    assert_eq!(outcomes[1], SyncOutcome::Idle);
    assert_eq!(backend.upserts.load(Ordering::SeqCst), 1);
}

/// Backend that holds its first upsert until released.
struct GatedBackend {
    gate_first: AtomicBool,
    entered: Notify,
    release: Notify,
    uploaded: Mutex<Vec<String>>,
}

impl GatedBackend {
    fn new() -> Self {
        Self {
            gate_first: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
            uploaded: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SyncBackend for GatedBackend {
    async fn upsert(&self, _key: &CacheKey, document: &SyncDocument) -> WeatherResult<UpsertOutcome> {
        if self.gate_first.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.uploaded.lock().unwrap().push(document.version.clone());
        Ok(UpsertOutcome::Accepted)
    }

    async fn fetch(&self, _key: &CacheKey) -> WeatherResult<Option<SyncDocument>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_write_during_upload_is_uploaded_next() {
    let backend = Arc::new(GatedBackend::new());
    let h = Harness::new(backend.clone(), 3);
    h.cache_local(18.5, "A");
    h.enqueue(SyncOperation::Upload);

    let reconciler = h.reconciler.clone();
    let first = tokio::spawn(async move { reconciler.process_next().await });
    backend.entered.notified().await;

    // A newer fetch lands while A is on the wire
    h.clock.advance(chrono::Duration::minutes(20));
    h.cache
        .put(&key(), &record(21.0, "B"), TtlPolicy::Current, h.clock.now())
        .unwrap();
    assert!(h
        .queue
        .enqueue(&key(), SyncOperation::Upload, h.clock.now())
        .unwrap()
        .is_some());

    backend.release.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), SyncOutcome::Uploaded(key()));

    assert_eq!(h.reconciler.drain().await.unwrap(), 1);
    assert_eq!(*backend.uploaded.lock().unwrap(), vec!["A".to_string(), "B".to_string()]);
    assert_eq!(h.queue.pending_count().unwrap(), 0);
    assert_eq!(h.queue.in_flight_count().unwrap(), 0);
}
