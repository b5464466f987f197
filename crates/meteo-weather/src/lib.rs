//! Weather data acquisition and caching pipeline for Meteo
//!
//! Fetches current conditions, daily forecasts and the 3-hour forecast from
//! OpenWeatherMap, keeps them in a local SQLite cache keyed by coordinate
//! bucket and horizon, mirrors them to a sync backend and publishes updates
//! to subscribers.

pub mod bucket;
pub mod cache;
pub mod clock;
pub mod error;
pub mod events;
pub mod geocode;
pub mod location;
pub mod locations;
pub mod provider;
pub mod reconciler;
pub mod repository;
pub mod retry;
pub mod sync;
pub mod sync_backend;
pub mod types;

pub use bucket::{CacheKey, CoordinateBucket, GridResolution};
pub use cache::{
    CacheEntry, CacheStore, HourlyEntry, PutOutcome, SqliteCache, TtlConfig, TtlPolicy,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{WeatherError, WeatherResult};
pub use events::{PublishOutcome, Subscription, SubscriptionId, WeatherEvents, WeatherUpdate};
pub use location::{LocationProvider, StaticLocation};
pub use locations::{SavedLocation, SavedLocationProvider, SavedLocationStore};
pub use provider::{OpenWeatherClient, ProviderConfig, WeatherSource};
pub use reconciler::{ReconcilerSettings, SyncOutcome, SyncReconciler};
pub use repository::{RepositorySettings, WeatherRepository};
pub use retry::RetryConfig;
pub use sync::{SyncOperation, SyncQueue, SyncTask};
pub use sync_backend::{HttpSyncBackend, SyncBackend, SyncDocument, UpsertOutcome};
pub use types::*;
