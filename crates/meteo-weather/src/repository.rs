//! Weather repository: the single entry point consumers read through.
//!
//! Lookup order for `get_weather`:
//! 1. bucket the coordinate and read the cache; a fresh hit returns at once
//! 2. a stale hit with `allow_stale` returns at once and refreshes in the
//!    background, unless the key was tried within the revalidation window
//! 3. otherwise fetch from the provider under the operation deadline; a
//!    success is cached, published and queued for upload
//! 4. a failed fetch falls back to any cached entry, marked degraded
//!
//! Only step 4 without a cached entry surfaces an error.
//!
//! With sync configured, accepted writes queue an upload and
//! [`WeatherRepository::request_pull`] queues a download of the backend's copy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::bucket::{CacheKey, CoordinateBucket, GridResolution};
use crate::cache::{CacheEntry, CacheStore, HourlyEntry, PutOutcome, TtlPolicy};
use crate::clock::{Clock, SystemClock};
use crate::error::{WeatherError, WeatherResult};
use crate::events::{Subscription, WeatherEvents, WeatherUpdate};
use crate::location::{LocationProvider, StaticLocation};
use crate::provider::{WeatherSource, MAX_HORIZON_DAYS};
use crate::sync::{SyncOperation, SyncQueue};
use crate::types::{
    Coordinate, FetchPolicy, Freshness, HistoryPoint, HourlyReading, WeatherReading, WeatherRecord,
};

pub const DEFAULT_DEADLINE_SECS: u64 = 30;
pub const DEFAULT_REVALIDATE_BACKOFF_SECS: u64 = 60;

/// Repository tuning.
#[derive(Debug, Clone, Copy)]
pub struct RepositorySettings {
    pub grid: GridResolution,
    /// Cap on one provider fetch, retries included
    pub deadline: Duration,
    /// Minimum spacing between network attempts for one key when serving stale
    pub revalidate_backoff: Duration,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            grid: GridResolution::default(),
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
            revalidate_backoff: Duration::from_secs(DEFAULT_REVALIDATE_BACKOFF_SECS),
        }
    }
}

impl RepositorySettings {
    pub fn with_grid(mut self, grid: GridResolution) -> Self {
        self.grid = grid;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_revalidate_backoff(mut self, backoff: Duration) -> Self {
        self.revalidate_backoff = backoff;
        self
    }
}

/// Last network attempt for a key.
#[derive(Debug, Clone)]
struct Attempt {
    at: DateTime<Utc>,
    failure: Option<String>,
}

struct SyncHook {
    queue: Arc<SyncQueue>,
    notify: Arc<Notify>,
}

struct Inner {
    source: Arc<dyn WeatherSource>,
    cache: Arc<dyn CacheStore>,
    events: WeatherEvents,
    location: Arc<dyn LocationProvider>,
    clock: Arc<dyn Clock>,
    sync: Option<SyncHook>,
    settings: RepositorySettings,
    attempts: Mutex<HashMap<CacheKey, Attempt>>,
    refreshing: Mutex<HashSet<CacheKey>>,
    refreshing_hourly: Mutex<HashSet<CoordinateBucket>>,
    shutdown: CancellationToken,
}

/// Builder for [`WeatherRepository`]. Collaborators not set get neutral
/// defaults: wall clock, no location, a private event hub, no sync.
pub struct RepositoryBuilder {
    source: Arc<dyn WeatherSource>,
    cache: Arc<dyn CacheStore>,
    events: Option<WeatherEvents>,
    location: Option<Arc<dyn LocationProvider>>,
    clock: Option<Arc<dyn Clock>>,
    sync: Option<SyncHook>,
    settings: RepositorySettings,
}

impl RepositoryBuilder {
    pub fn events(mut self, events: WeatherEvents) -> Self {
        self.events = Some(events);
        self
    }

    pub fn location(mut self, location: Arc<dyn LocationProvider>) -> Self {
        self.location = Some(location);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Queue an upload for every accepted write and wake `notify`.
    pub fn sync(mut self, queue: Arc<SyncQueue>, notify: Arc<Notify>) -> Self {
        self.sync = Some(SyncHook { queue, notify });
        self
    }

    pub fn settings(mut self, settings: RepositorySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> WeatherRepository {
        WeatherRepository {
            inner: Arc::new(Inner {
                source: self.source,
                cache: self.cache,
                events: self.events.unwrap_or_default(),
                location: self
                    .location
                    .unwrap_or_else(|| Arc::new(StaticLocation::unavailable())),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                sync: self.sync,
                settings: self.settings,
                attempts: Mutex::new(HashMap::new()),
                refreshing: Mutex::new(HashSet::new()),
                refreshing_hourly: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

/// Orchestrates cache, provider, read model and sync queue. Cheap to clone.
#[derive(Clone)]
pub struct WeatherRepository {
    inner: Arc<Inner>,
}

impl WeatherRepository {
    pub fn builder(source: Arc<dyn WeatherSource>, cache: Arc<dyn CacheStore>) -> RepositoryBuilder {
        RepositoryBuilder {
            source,
            cache,
            events: None,
            location: None,
            clock: None,
            sync: None,
            settings: RepositorySettings::default(),
        }
    }

    pub fn events(&self) -> &WeatherEvents {
        &self.inner.events
    }

    pub fn settings(&self) -> &RepositorySettings {
        &self.inner.settings
    }

    pub fn key_for(&self, coordinate: &Coordinate, horizon: u32) -> CacheKey {
        CacheKey::for_coordinate(coordinate, horizon, self.inner.settings.grid)
    }

    /// Weather for a coordinate and horizon.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_weather(
        &self,
        coordinate: Coordinate,
        horizon: u32,
        policy: FetchPolicy,
    ) -> WeatherResult<WeatherReading> {
        coordinate.validate()?;
        let key = self.key_for(&coordinate, horizon);
        let now = self.inner.clock.now();

        let cached = self.cached_entry(key, now).await;
        if let Some(entry) = &cached {
            if self.inner.cache.is_fresh(entry, now) {
                tracing::debug!("Cache hit for {}", key);
                return Ok(reading(entry, Freshness::Fresh));
            }

            if policy.allow_stale {
                return Ok(self.serve_stale(entry, coordinate, now));
            }
        }

        match self.fetch_and_commit(key, coordinate).await {
            Ok(reading) => Ok(reading),
            Err(e) => match cached {
                Some(entry) => {
                    tracing::warn!("Refresh of {} failed, serving cached data: {}", key, e);
                    Ok(reading(
                        &entry,
                        Freshness::Degraded {
                            reason: e.to_string(),
                        },
                    ))
                }
                None => Err(e),
            },
        }
    }

    /// [`get_weather`](Self::get_weather) that gives up when `cancel` fires.
    /// A fetch in flight at that point is dropped and nothing is written.
    pub async fn get_weather_cancellable(
        &self,
        coordinate: Coordinate,
        horizon: u32,
        policy: FetchPolicy,
        cancel: &CancellationToken,
    ) -> WeatherResult<WeatherReading> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Weather request for {:?} cancelled", coordinate);
                Err(WeatherError::Cancelled)
            }
            result = self.get_weather(coordinate, horizon, policy) => result,
        }
    }

    /// Current conditions wherever the location provider says the user is.
    pub async fn current_weather(&self, policy: FetchPolicy) -> WeatherResult<WeatherReading> {
        let coordinate = self.inner.location.current_location().await?;
        self.get_weather(coordinate, 0, policy).await
    }

    /// Current conditions for a place name. The provider resolves the name,
    /// and the result is cached and published under the returned coordinate.
    /// There is no cache fallback: without a coordinate there is no key.
    #[instrument(skip(self), level = "debug")]
    pub async fn current_weather_by_city(&self, city: &str) -> WeatherResult<WeatherReading> {
        let fetched_at = self.inner.clock.now();
        let deadline = self.inner.settings.deadline;
        let record = match tokio::time::timeout(deadline, self.inner.source.fetch_by_city(city)).await {
            Ok(result) => result?,
            Err(_) => return Err(WeatherError::DeadlineExceeded(deadline)),
        };
        record.coordinate.validate()?;

        let key = self.key_for(&record.coordinate, 0);
        Ok(self.commit(key, record, fetched_at).await)
    }

    /// The 5-day forecast in 3-hour steps, with the same fresh, stale and
    /// degraded handling as [`get_weather`](Self::get_weather).
    #[instrument(skip(self), level = "debug")]
    pub async fn hourly_forecast(
        &self,
        coordinate: Coordinate,
        policy: FetchPolicy,
    ) -> WeatherResult<HourlyReading> {
        coordinate.validate()?;
        let bucket = self.inner.settings.grid.bucket(&coordinate);
        let now = self.inner.clock.now();

        let cached = self.cached_hourly(bucket, now).await;
        if let Some(entry) = &cached {
            if self.inner.cache.is_hourly_fresh(entry, now) {
                tracing::debug!("Hourly cache hit for {}", bucket);
                return Ok(hourly_reading(entry, Freshness::Fresh));
            }

            if policy.allow_stale {
                self.refresh_hourly_in_background(bucket, coordinate);
                return Ok(hourly_reading(entry, Freshness::Stale));
            }
        }

        match self.fetch_and_commit_hourly(bucket, coordinate).await {
            Ok(reading) => Ok(reading),
            Err(e) => match cached {
                Some(entry) => {
                    tracing::warn!("Hourly refresh of {} failed, serving cached data: {}", bucket, e);
                    Ok(hourly_reading(
                        &entry,
                        Freshness::Degraded {
                            reason: e.to_string(),
                        },
                    ))
                }
                None => Err(e),
            },
        }
    }

    /// Readings for horizons `0..days`. Fails on the first horizon that has
    /// neither network nor cached data.
    pub async fn forecast(
        &self,
        coordinate: Coordinate,
        days: u32,
        policy: FetchPolicy,
    ) -> WeatherResult<Vec<WeatherReading>> {
        if days == 0 || days > MAX_HORIZON_DAYS + 1 {
            return Err(WeatherError::invalid(format!(
                "forecast length {} outside 1..={}",
                days,
                MAX_HORIZON_DAYS + 1
            )));
        }

        let mut readings = Vec::with_capacity(days as usize);
        for horizon in 0..days {
            readings.push(self.get_weather(coordinate, horizon, policy).await?);
        }
        Ok(readings)
    }

    /// Every accepted record for the key fetched at or after `since`, oldest first.
    pub async fn history(
        &self,
        coordinate: Coordinate,
        horizon: u32,
        since: DateTime<Utc>,
    ) -> WeatherResult<Vec<HistoryPoint>> {
        coordinate.validate()?;
        let key = self.key_for(&coordinate, horizon);
        let cache = Arc::clone(&self.inner.cache);
        let entries = tokio::task::spawn_blocking(move || cache.history(&key, since)).await??;

        Ok(entries
            .into_iter()
            .map(|entry| HistoryPoint {
                record: entry.record,
                fetched_at: entry.fetched_at,
            })
            .collect())
    }

    /// Queue a download of the sync backend's copy for a coordinate and
    /// horizon and wake the reconciler. Returns false when sync is not
    /// configured or the same download is already pending.
    pub async fn request_pull(&self, coordinate: Coordinate, horizon: u32) -> WeatherResult<bool> {
        coordinate.validate()?;
        if horizon > MAX_HORIZON_DAYS {
            return Err(WeatherError::invalid(format!(
                "horizon {} beyond the {}-day forecast",
                horizon, MAX_HORIZON_DAYS
            )));
        }
        let Some(sync) = &self.inner.sync else {
            tracing::debug!("Sync not configured, ignoring pull for {:?}", coordinate);
            return Ok(false);
        };

        let key = self.key_for(&coordinate, horizon);
        let queue = Arc::clone(&sync.queue);
        let now = self.inner.clock.now();
        let queued = tokio::task::spawn_blocking(move || queue.enqueue(&key, SyncOperation::Download, now))
            .await??
            .is_some();
        if queued {
            tracing::debug!("Queued download of {}", key);
            sync.notify.notify_one();
        }
        Ok(queued)
    }

    /// Register for updates on the coordinate's bucket.
    pub fn subscribe(&self, coordinate: &Coordinate) -> Subscription {
        self.inner.events.subscribe(self.inner.settings.grid.bucket(coordinate))
    }

    /// Purge entries past the long-stop age.
    pub async fn purge_expired(&self) -> WeatherResult<usize> {
        let cache = Arc::clone(&self.inner.cache);
        let now = self.inner.clock.now();
        tokio::task::spawn_blocking(move || cache.sweep(now)).await?
    }

    /// Periodic cache sweep until `cancel` fires.
    pub fn spawn_maintenance(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let repo = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = repo.purge_expired().await {
                            tracing::warn!("Cache sweep failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Cache maintenance stopped");
        })
    }

    /// Stop background refreshes started by stale reads.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cache read where a storage failure counts as a miss.
    async fn cached_entry(&self, key: CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let cache = Arc::clone(&self.inner.cache);
        match tokio::task::spawn_blocking(move || cache.get(&key, now)).await {
            Ok(Ok(entry)) => entry,
            Ok(Err(e)) => {
                tracing::warn!("Cache read for {} failed, treating as miss: {}", key, e);
                None
            }
            Err(e) => {
                tracing::warn!("Cache read for {} panicked, treating as miss: {}", key, e);
                None
            }
        }
    }

    async fn cached_hourly(&self, bucket: CoordinateBucket, now: DateTime<Utc>) -> Option<HourlyEntry> {
        let cache = Arc::clone(&self.inner.cache);
        match tokio::task::spawn_blocking(move || cache.get_hourly(&bucket, now)).await {
            Ok(Ok(entry)) => entry,
            Ok(Err(e)) => {
                tracing::warn!("Hourly cache read for {} failed, treating as miss: {}", bucket, e);
                None
            }
            Err(e) => {
                tracing::warn!("Hourly cache read for {} panicked, treating as miss: {}", bucket, e);
                None
            }
        }
    }

    fn refresh_hourly_in_background(&self, bucket: CoordinateBucket, coordinate: Coordinate) {
        if !self.inner.refreshing_hourly.lock().insert(bucket) {
            return;
        }

        let repo = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = repo.fetch_and_commit_hourly(bucket, coordinate) => {
                    if let Err(e) = result {
                        tracing::warn!("Background hourly refresh of {} failed: {}", bucket, e);
                    }
                }
            }
            repo.inner.refreshing_hourly.lock().remove(&bucket);
        });
    }

    /// Hourly counterpart of `fetch_and_commit`. A storage failure is logged
    /// and the fetched forecast still returned.
    async fn fetch_and_commit_hourly(
        &self,
        bucket: CoordinateBucket,
        coordinate: Coordinate,
    ) -> WeatherResult<HourlyReading> {
        let fetched_at = self.inner.clock.now();
        let deadline = self.inner.settings.deadline;
        let forecast = match tokio::time::timeout(deadline, self.inner.source.fetch_hourly(coordinate)).await {
            Ok(result) => result?,
            Err(_) => return Err(WeatherError::DeadlineExceeded(deadline)),
        };

        let cache = Arc::clone(&self.inner.cache);
        let put_forecast = forecast.clone();
        let outcome = tokio::task::spawn_blocking(move || cache.put_hourly(&bucket, &put_forecast, fetched_at))
            .await
            .map_err(WeatherError::from)
            .and_then(|result| result);

        match outcome {
            Ok(PutOutcome::Written) => {}
            Ok(PutOutcome::Superseded) => {
                tracing::debug!("Hourly fetch for {} lost to a newer one", bucket);
                let now = self.inner.clock.now();
                if let Some(newer) = self.cached_hourly(bucket, now).await {
                    let freshness = if self.inner.cache.is_hourly_fresh(&newer, now) {
                        Freshness::Fresh
                    } else {
                        Freshness::Stale
                    };
                    return Ok(hourly_reading(&newer, freshness));
                }
            }
            Err(e) => tracing::warn!("Could not cache hourly forecast for {}: {}", bucket, e),
        }

        Ok(HourlyReading {
            forecast,
            fetched_at,
            freshness: Freshness::Fresh,
        })
    }

    fn serve_stale(&self, entry: &CacheEntry, coordinate: Coordinate, now: DateTime<Utc>) -> WeatherReading {
        let key = entry.key;
        let backoff = chrono::Duration::from_std(self.inner.settings.revalidate_backoff)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_REVALIDATE_BACKOFF_SECS as i64));

        let recent = self
            .inner
            .attempts
            .lock()
            .get(&key)
            .filter(|attempt| now - attempt.at < backoff)
            .cloned();

        match recent {
            Some(Attempt {
                failure: Some(reason),
                ..
            }) => reading(entry, Freshness::Degraded { reason }),
            Some(_) => reading(entry, Freshness::Stale),
            None => {
                self.refresh_in_background(key, coordinate);
                reading(entry, Freshness::Stale)
            }
        }
    }

    fn refresh_in_background(&self, key: CacheKey, coordinate: Coordinate) {
        if !self.inner.refreshing.lock().insert(key) {
            return;
        }

        tracing::debug!("Revalidating {} in the background", key);
        let repo = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = repo.fetch_and_commit(key, coordinate) => {
                    if let Err(e) = result {
                        tracing::warn!("Background refresh of {} failed: {}", key, e);
                    }
                }
            }
            repo.inner.refreshing.lock().remove(&key);
        });
    }

    fn note_attempt(&self, key: CacheKey, at: DateTime<Utc>, failure: Option<String>) {
        let backoff = chrono::Duration::from_std(self.inner.settings.revalidate_backoff)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_REVALIDATE_BACKOFF_SECS as i64));
        let mut attempts = self.inner.attempts.lock();
        attempts.retain(|_, attempt| at - attempt.at < backoff);
        attempts.insert(key, Attempt { at, failure });
    }

    /// Fetch under the deadline, then commit. `fetched_at` is when the
    /// request was issued, so a slow response never outranks a later one.
    async fn fetch_and_commit(&self, key: CacheKey, coordinate: Coordinate) -> WeatherResult<WeatherReading> {
        let fetched_at = self.inner.clock.now();
        self.note_attempt(key, fetched_at, None);
        let mut in_flight = InFlightAttempt {
            inner: &self.inner,
            key,
            at: fetched_at,
            finished: false,
        };

        let deadline = self.inner.settings.deadline;
        let result = match tokio::time::timeout(deadline, self.inner.source.fetch(coordinate, key.horizon)).await {
            Ok(result) => result,
            Err(_) => Err(WeatherError::DeadlineExceeded(deadline)),
        };
        in_flight.finished = true;

        match result {
            Ok(record) => Ok(self.commit(key, record, fetched_at).await),
            Err(e) => {
                self.note_attempt(key, fetched_at, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Write, publish and queue for upload. Storage and queue failures are
    /// logged; the fetched record is still returned.
    async fn commit(&self, key: CacheKey, record: WeatherRecord, fetched_at: DateTime<Utc>) -> WeatherReading {
        let cache = Arc::clone(&self.inner.cache);
        let put_record = record.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            cache.put(&key, &put_record, TtlPolicy::for_horizon(key.horizon), fetched_at)
        })
        .await
        .map_err(WeatherError::from)
        .and_then(|result| result);

        match outcome {
            Ok(PutOutcome::Superseded) => {
                tracing::debug!("Fetch for {} lost to a newer one", key);
                let now = self.inner.clock.now();
                if let Some(newer) = self.cached_entry(key, now).await {
                    let freshness = if self.inner.cache.is_fresh(&newer, now) {
                        Freshness::Fresh
                    } else {
                        Freshness::Stale
                    };
                    return reading(&newer, freshness);
                }
            }
            Ok(PutOutcome::Written) => self.enqueue_upload(key).await,
            Err(e) => tracing::warn!("Could not cache {}: {}", key, e),
        }

        self.inner.events.publish(WeatherUpdate {
            key,
            record: record.clone(),
            fetched_at,
        });

        WeatherReading {
            record,
            fetched_at,
            freshness: Freshness::Fresh,
        }
    }

    async fn enqueue_upload(&self, key: CacheKey) {
        let Some(sync) = &self.inner.sync else {
            return;
        };

        let queue = Arc::clone(&sync.queue);
        let now = self.inner.clock.now();
        match tokio::task::spawn_blocking(move || queue.enqueue(&key, SyncOperation::Upload, now)).await {
            Ok(Ok(_)) => sync.notify.notify_one(),
            Ok(Err(e)) => tracing::warn!("Could not queue upload of {}: {}", key, e),
            Err(e) => tracing::warn!("Could not queue upload of {}: {}", key, e),
        }
    }
}

/// Clears the attempt a fetch registered when the fetch is dropped before it
/// finishes, so a cancelled request does not hold off revalidation.
struct InFlightAttempt<'a> {
    inner: &'a Inner,
    key: CacheKey,
    at: DateTime<Utc>,
    finished: bool,
}

impl Drop for InFlightAttempt<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut attempts = self.inner.attempts.lock();
        let unfinished = attempts
            .get(&self.key)
            .is_some_and(|attempt| attempt.at == self.at && attempt.failure.is_none());
        if unfinished {
            attempts.remove(&self.key);
        }
    }
}

fn hourly_reading(entry: &HourlyEntry, freshness: Freshness) -> HourlyReading {
    HourlyReading {
        forecast: entry.forecast.clone(),
        fetched_at: entry.fetched_at,
        freshness,
    }
}

fn reading(entry: &CacheEntry, freshness: Freshness) -> WeatherReading {
    WeatherReading {
        record: entry.record.clone(),
        fetched_at: entry.fetched_at,
        freshness,
    }
}
