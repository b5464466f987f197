//! Observable read model.
//!
//! Consumers subscribe per coordinate bucket and receive [`WeatherUpdate`]s on
//! a channel, so a slow renderer never holds up a refresh. The model keeps
//! only the latest update per `(bucket, horizon)`: a new subscriber is primed
//! with that state, never with history.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::bucket::{CacheKey, CoordinateBucket};
use crate::types::WeatherRecord;

/// A record published for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherUpdate {
    pub key: CacheKey,
    pub record: WeatherRecord,
    pub fetched_at: DateTime<Utc>,
}

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct BucketState {
    latest: BTreeMap<u32, WeatherUpdate>,
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<WeatherUpdate>>,
}

#[derive(Default)]
struct Inner {
    buckets: RwLock<HashMap<CoordinateBucket, BucketState>>,
    next_id: AtomicU64,
}

impl Inner {
    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut buckets = self.buckets.write();
        buckets
            .values_mut()
            .any(|state| state.subscribers.remove(&id).is_some())
    }
}

/// Publish/subscribe hub. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct WeatherEvents {
    inner: Arc<Inner>,
}

/// What [`WeatherEvents::publish`] did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// New version; delivered to this many subscribers
    Delivered(usize),
    /// Same version as the current state; state refreshed, nobody notified
    Duplicate,
    /// Fetched before the current state; dropped
    Outdated,
}

impl WeatherEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for updates on a bucket. The returned subscription is primed
    /// with the latest update per horizon, if any.
    pub fn subscribe(&self, bucket: CoordinateBucket) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut buckets = self.inner.buckets.write();
        let state = buckets.entry(bucket).or_default();
        for update in state.latest.values() {
            // Receiver is alive; it is in our hands.
            let _ = tx.send(update.clone());
        }
        state.subscribers.insert(id, tx);

        tracing::debug!("Subscription {:?} registered for bucket {}", id, bucket);
        Subscription {
            id,
            bucket,
            receiver: rx,
            events: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Record an update and fan it out.
    ///
    /// Updates for a key are ordered by `fetched_at`: anything older than the
    /// current state is dropped. A repeat of the current version is not
    /// redelivered.
    pub fn publish(&self, update: WeatherUpdate) -> PublishOutcome {
        let mut buckets = self.inner.buckets.write();
        let state = buckets.entry(update.key.bucket).or_default();

        if let Some(current) = state.latest.get_mut(&update.key.horizon) {
            if update.fetched_at < current.fetched_at {
                return PublishOutcome::Outdated;
            }
            if update.record.version == current.record.version {
                if update.fetched_at > current.fetched_at {
                    *current = update;
                }
                return PublishOutcome::Duplicate;
            }
        }

        state.latest.insert(update.key.horizon, update.clone());

        let mut delivered = 0;
        state.subscribers.retain(|id, tx| match tx.send(update.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                tracing::debug!("Dropping closed subscription {:?}", id);
                false
            }
        });

        tracing::debug!("Published {} to {} subscribers", update.key, delivered);
        PublishOutcome::Delivered(delivered)
    }

    /// Latest update for every horizon of a bucket.
    pub fn latest(&self, bucket: &CoordinateBucket) -> Vec<WeatherUpdate> {
        self.inner
            .buckets
            .read()
            .get(bucket)
            .map(|state| state.latest.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest_for(&self, key: &CacheKey) -> Option<WeatherUpdate> {
        self.inner
            .buckets
            .read()
            .get(&key.bucket)
            .and_then(|state| state.latest.get(&key.horizon).cloned())
    }

    pub fn subscriber_count(&self, bucket: &CoordinateBucket) -> usize {
        self.inner
            .buckets
            .read()
            .get(bucket)
            .map(|state| state.subscribers.len())
            .unwrap_or(0)
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    bucket: CoordinateBucket,
    receiver: mpsc::UnboundedReceiver<WeatherUpdate>,
    events: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn bucket(&self) -> CoordinateBucket {
        self.bucket
    }

    /// Wait for the next update. `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<WeatherUpdate> {
        self.receiver.recv().await
    }

    /// Next queued update without waiting.
    pub fn try_recv(&mut self) -> Option<WeatherUpdate> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.events.upgrade() {
            inner.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("bucket", &self.bucket)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::bucket::GridResolution;
    use crate::types::{Coordinate, Units, Wind};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn coordinate() -> Coordinate {
        Coordinate::new(37.77, -122.41).unwrap()
    }

    fn update(horizon: u32, version: &str, fetched_at: DateTime<Utc>) -> WeatherUpdate {
        WeatherUpdate {
            key: CacheKey::for_coordinate(&coordinate(), horizon, GridResolution::default()),
            record: WeatherRecord {
                coordinate: coordinate(),
                observed_at: fetched_at,
                temperature: 18.5,
                feels_like: None,
                humidity: 60,
                pressure: None,
                wind: Wind::default(),
                condition_code: 800,
                description: None,
                place_name: None,
                horizon,
                units: Units::Metric,
                version: version.into(),
            },
            fetched_at,
        }
    }

    fn bucket() -> CoordinateBucket {
        GridResolution::default().bucket(&coordinate())
    }

    #[test]
    fn test_publish_reaches_subscriber_once() {
        let events = WeatherEvents::new();
        let mut sub = events.subscribe(bucket());

        assert_eq!(events.publish(update(0, "v1", t(0))), PublishOutcome::Delivered(1));
        assert_eq!(sub.try_recv().unwrap().record.version, "v1");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_same_version_not_redelivered() {
        let events = WeatherEvents::new();
        let mut sub = events.subscribe(bucket());

        events.publish(update(0, "v1", t(0)));
        assert_eq!(events.publish(update(0, "v1", t(60))), PublishOutcome::Duplicate);

        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
        assert_eq!(events.latest_for(&update(0, "v1", t(0)).key).unwrap().fetched_at, t(60));
    }

    #[test]
    fn test_older_fetch_is_dropped() {
        let events = WeatherEvents::new();
        let mut sub = events.subscribe(bucket());

        events.publish(update(0, "v2", t(60)));
        assert_eq!(events.publish(update(0, "v1", t(0))), PublishOutcome::Outdated);

        assert_eq!(sub.try_recv().unwrap().record.version, "v2");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_late_subscriber_gets_latest_only() {
        let events = WeatherEvents::new();
        events.publish(update(0, "v1", t(0)));
        events.publish(update(0, "v2", t(60)));
        events.publish(update(1, "f1", t(60)));

        let mut sub = events.subscribe(bucket());
        let first = sub.try_recv().unwrap();
        let second = sub.try_recv().unwrap();
        assert_eq!((first.key.horizon, first.record.version.as_str()), (0, "v2"));
        assert_eq!((second.key.horizon, second.record.version.as_str()), (1, "f1"));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_other_buckets_not_notified() {
        let events = WeatherEvents::new();
        let other = GridResolution::default().bucket(&Coordinate::new(51.5, -0.12).unwrap());
        let mut sub = events.subscribe(other);

        assert_eq!(events.publish(update(0, "v1", t(0))), PublishOutcome::Delivered(0));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_unsubscribe_and_drop() {
        let events = WeatherEvents::new();
        let sub = events.subscribe(bucket());
        let second = events.subscribe(bucket());
        assert_eq!(events.subscriber_count(&bucket()), 2);

        assert!(events.unsubscribe(sub.id()));
        assert!(!events.unsubscribe(sub.id()));
        assert_eq!(events.subscriber_count(&bucket()), 1);

        drop(second);
        assert_eq!(events.subscriber_count(&bucket()), 0);
    }

    #[tokio::test]
    async fn test_recv_waits_for_publish() {
        let events = WeatherEvents::new();
        let mut sub = events.subscribe(bucket());

        let publisher = events.clone();
        tokio::spawn(async move {
            publisher.publish(update(0, "v1", t(0)));
        });

        let received = sub.recv().await.unwrap();
        assert_eq!(received.record.temperature, 18.5);
    }
}
