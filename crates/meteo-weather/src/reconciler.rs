//! Background worker that mirrors cached records to the sync backend.
//!
//! Only one task is processed at a time. Failed tasks are retried with
//! backoff and dead-lettered once their attempt budget is spent; sync never
//! blocks or fails a read.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::bucket::CacheKey;
use crate::cache::{CacheEntry, CacheStore, PutOutcome, TtlPolicy};
use crate::clock::Clock;
use crate::error::{WeatherError, WeatherResult};
use crate::events::{WeatherEvents, WeatherUpdate};
use crate::retry::RetryConfig;
use crate::sync::{SyncOperation, SyncQueue, SyncTask};
use crate::sync_backend::{SyncBackend, SyncDocument, UpsertOutcome};

pub const DEFAULT_SYNC_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_SYNC_POLL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Attempt budget and backoff between attempts
    pub retry: RetryConfig,
    /// Longest idle sleep between queue checks
    pub poll_interval: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::new(DEFAULT_SYNC_MAX_ATTEMPTS, 1_000, 60_000),
            poll_interval: Duration::from_secs(DEFAULT_SYNC_POLL_SECS),
        }
    }
}

/// What one call to [`SyncReconciler::process_next`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// No task was due
    Idle,
    Uploaded(CacheKey),
    /// The backend held a newer document; it was written back locally
    RemoteWon(CacheKey),
    Downloaded(CacheKey),
    /// Nothing to do for the key (no local entry, or remote not newer)
    Skipped(CacheKey),
    Retrying { key: CacheKey, attempts: u32 },
    DeadLettered(CacheKey),
}

pub struct SyncReconciler {
    queue: Arc<SyncQueue>,
    cache: Arc<dyn CacheStore>,
    backend: Arc<dyn SyncBackend>,
    events: WeatherEvents,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
    settings: ReconcilerSettings,
    drain_lock: tokio::sync::Mutex<()>,
}

impl SyncReconciler {
    pub fn new(
        queue: Arc<SyncQueue>,
        cache: Arc<dyn CacheStore>,
        backend: Arc<dyn SyncBackend>,
        events: WeatherEvents,
        clock: Arc<dyn Clock>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            queue,
            cache,
            backend,
            events,
            clock,
            notify: Arc::new(Notify::new()),
            settings,
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Handle producers use to wake the worker after enqueueing.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Process the oldest due task, if any.
    pub async fn process_next(&self) -> WeatherResult<SyncOutcome> {
        let _guard = self.drain_lock.lock().await;

        let queue = Arc::clone(&self.queue);
        let now = self.clock.now();
        let task = match tokio::task::spawn_blocking(move || queue.next_due(now)).await?? {
            Some(task) => task,
            None => return Ok(SyncOutcome::Idle),
        };

        let result = match task.operation {
            SyncOperation::Upload => self.upload(&task.key).await,
            SyncOperation::Download => self.download(&task.key).await,
        };

        match result {
            Ok(outcome) => {
                let queue = Arc::clone(&self.queue);
                let id = task.id;
                tokio::task::spawn_blocking(move || queue.complete(id)).await??;
                Ok(outcome)
            }
            Err(e) => self.handle_failure(&task, e).await,
        }
    }

    /// Process due tasks until none remain. Returns how many were handled.
    pub async fn drain(&self) -> WeatherResult<usize> {
        let mut handled = 0;
        loop {
            match self.process_next().await? {
                SyncOutcome::Idle => return Ok(handled),
                _ => handled += 1,
            }
        }
    }

    /// Tasks that exhausted their attempts.
    pub async fn list_dead_letters(&self) -> WeatherResult<Vec<SyncTask>> {
        let queue = Arc::clone(&self.queue);
        tokio::task::spawn_blocking(move || queue.list_dead_letters()).await?
    }

    /// Return a dead-lettered task to the queue and wake the worker.
    pub async fn retry_dead_letter(&self, id: i64) -> WeatherResult<bool> {
        let queue = Arc::clone(&self.queue);
        let now = self.clock.now();
        let revived = tokio::task::spawn_blocking(move || queue.retry_dead_letter(id, now)).await??;
        if revived {
            tracing::info!("Dead-lettered sync task {} requeued", id);
            self.notify.notify_one();
        }
        Ok(revived)
    }

    /// Worker loop. Drains the queue, then sleeps until woken, the next
    /// deferred task is due or the poll interval passes.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("Sync reconciler started");

        loop {
            if let Err(e) = self.drain().await {
                tracing::warn!("Sync drain stopped early: {}", e);
            }

            let sleep_for = self.idle_duration().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        tracing::info!("Sync reconciler stopped");
    }

    async fn idle_duration(&self) -> Duration {
        let queue = Arc::clone(&self.queue);
        let wakeup = match tokio::task::spawn_blocking(move || queue.next_wakeup()).await {
            Ok(Ok(wakeup)) => wakeup,
            _ => None,
        };

        let poll = self.settings.poll_interval;
        match wakeup {
            Some(at) => (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO).min(poll),
            None => poll,
        }
    }

    async fn upload(&self, key: &CacheKey) -> WeatherResult<SyncOutcome> {
        let now = self.clock.now();
        let entry = match self.cache_get(key, now).await? {
            Some(entry) => entry,
            None => {
                tracing::debug!("Nothing cached for {}, dropping upload", key);
                return Ok(SyncOutcome::Skipped(*key));
            }
        };

        let document = SyncDocument::from_entry(&entry);
        match self.backend.upsert(key, &document).await? {
            UpsertOutcome::Accepted => {
                tracing::debug!("Uploaded {} (version {})", key, document.version);
                Ok(SyncOutcome::Uploaded(*key))
            }
            UpsertOutcome::Conflict(remote) if remote.fetched_at > entry.fetched_at => {
                let conflict = WeatherError::SyncConflict { key: key.to_string() };
                tracing::warn!("{}; keeping remote version {}", conflict, remote.version);
                self.apply_remote(key, &remote).await?;
                Ok(SyncOutcome::RemoteWon(*key))
            }
            UpsertOutcome::Conflict(remote) => {
                tracing::warn!(
                    "Backend rejected {} with an older document ({}); local copy kept",
                    key,
                    remote.version
                );
                Ok(SyncOutcome::Skipped(*key))
            }
        }
    }

    async fn download(&self, key: &CacheKey) -> WeatherResult<SyncOutcome> {
        let remote = match self.backend.fetch(key).await? {
            Some(remote) => remote,
            None => return Ok(SyncOutcome::Skipped(*key)),
        };

        let now = self.clock.now();
        let local_fetched_at = self.cache_get(key, now).await?.map(|entry| entry.fetched_at);
        if local_fetched_at.is_some_and(|local| local >= remote.fetched_at) {
            return Ok(SyncOutcome::Skipped(*key));
        }

        match self.apply_remote(key, &remote).await? {
            PutOutcome::Written => Ok(SyncOutcome::Downloaded(*key)),
            PutOutcome::Superseded => Ok(SyncOutcome::Skipped(*key)),
        }
    }

    /// Write a remote document into the cache and publish it.
    async fn apply_remote(&self, key: &CacheKey, remote: &SyncDocument) -> WeatherResult<PutOutcome> {
        let record = remote.to_record()?;
        let fetched_at = remote.fetched_at;

        let cache = Arc::clone(&self.cache);
        let put_key = *key;
        let put_record = record.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            cache.put(&put_key, &put_record, TtlPolicy::for_horizon(put_key.horizon), fetched_at)
        })
        .await??;

        if outcome == PutOutcome::Written {
            self.events.publish(WeatherUpdate {
                key: *key,
                record,
                fetched_at,
            });
        }
        Ok(outcome)
    }

    async fn cache_get(
        &self,
        key: &CacheKey,
        now: DateTime<Utc>,
    ) -> WeatherResult<Option<CacheEntry>> {
        let cache = Arc::clone(&self.cache);
        let key = *key;
        tokio::task::spawn_blocking(move || cache.get(&key, now)).await?
    }

    async fn handle_failure(&self, task: &SyncTask, error: WeatherError) -> WeatherResult<SyncOutcome> {
        let message = error.to_string();
        let attempts_so_far = task.attempts + 1;
        let max_attempts = self.settings.retry.max_attempts.max(1);
        let queue = Arc::clone(&self.queue);
        let id = task.id;
        let now = self.clock.now();

        if attempts_so_far >= max_attempts {
            tracing::error!(
                "Sync task {} ({} {}) dead-lettered after {} attempts: {}",
                id,
                task.operation.as_str(),
                task.key,
                attempts_so_far,
                message
            );
            tokio::task::spawn_blocking(move || {
                queue.record_failure(id, &message, now)?;
                queue.dead_letter(id, &message)
            })
            .await??;
            return Ok(SyncOutcome::DeadLettered(task.key));
        }

        let delay = self.settings.retry.delay_for_attempt(task.attempts);
        let next_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        tracing::warn!(
            "Sync task {} ({} {}) failed on attempt {} of {}, retrying in {:?}: {}",
            id,
            task.operation.as_str(),
            task.key,
            attempts_so_far,
            max_attempts,
            delay,
            message
        );

        let attempts =
            tokio::task::spawn_blocking(move || queue.record_failure(id, &message, next_at)).await??;
        Ok(SyncOutcome::Retrying {
            key: task.key,
            attempts,
        })
    }
}
