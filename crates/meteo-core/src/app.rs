use std::sync::Arc;
use std::time::Duration;

use meteo_weather::{
    CacheStore, Coordinate, HttpSyncBackend, LocationProvider, OpenWeatherClient, SavedLocationProvider,
    SavedLocationStore, SqliteCache, StaticLocation, SyncQueue, SyncReconciler, SystemClock,
    WeatherEvents, WeatherRepository,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, ConfigError};
use crate::Config;

const CACHE_DB: &str = "cache.db";
const SYNC_DB: &str = "sync.db";
const LOCATIONS_DB: &str = "locations.db";

/// Main application state and lifecycle manager.
///
/// `new` opens the stores and wires the repository; `initialize` starts the
/// background workers; `shutdown` stops them.
pub struct App {
    config: Arc<Config>,
    repository: WeatherRepository,
    weather: Arc<OpenWeatherClient>,
    locations: Arc<SavedLocationStore>,
    reconciler: Option<Arc<SyncReconciler>>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl App {
    /// Load and validate the configuration, then build the application.
    pub fn load() -> Result<Self, AppError> {
        let (config, _) = Config::load_validated()?;
        Self::new(config)
    }

    pub fn new(config: Config) -> Result<Self, AppError> {
        config.validate().into_result()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let grid = config.cache.grid();
        let cache: Arc<dyn CacheStore> = Arc::new(SqliteCache::open(
            config.data_dir.join(CACHE_DB),
            config.cache.ttl_config(),
        )?);
        let locations = Arc::new(SavedLocationStore::open(
            config.data_dir.join(LOCATIONS_DB),
            grid,
        )?);
        let weather = Arc::new(OpenWeatherClient::new(config.provider.to_provider_config())?);

        let location: Arc<dyn LocationProvider> = match config.location.coordinate() {
            Some(coordinate) => Arc::new(StaticLocation::new(coordinate)),
            None => Arc::new(SavedLocationProvider::new(Arc::clone(&locations))),
        };

        let events = WeatherEvents::new();
        let mut builder = WeatherRepository::builder(weather.clone(), Arc::clone(&cache))
            .events(events.clone())
            .location(location)
            .clock(Arc::new(SystemClock))
            .settings(config.repository_settings());

        let reconciler = if config.sync.enabled {
            let queue = Arc::new(SyncQueue::open(config.data_dir.join(SYNC_DB))?);
            let backend = HttpSyncBackend::new(
                config.sync.backend_url.clone(),
                config.sync.device_id.clone(),
                config.sync.token.clone(),
                Duration::from_secs(config.sync.timeout_secs),
            )?;
            let reconciler = Arc::new(SyncReconciler::new(
                Arc::clone(&queue),
                cache,
                Arc::new(backend),
                events,
                Arc::new(SystemClock),
                config.sync.reconciler_settings(),
            ));
            builder = builder.sync(queue, reconciler.notifier());
            Some(reconciler)
        } else {
            tracing::info!("Sync disabled; records stay on this device");
            None
        };

        tracing::info!("Weather data stored in {}", config.data_dir.display());

        Ok(Self {
            config: Arc::new(config),
            repository: builder.build(),
            weather,
            locations,
            reconciler,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        })
    }

    /// Start the sync worker and the cache sweep. Must be called from within
    /// a Tokio runtime.
    pub fn initialize(&mut self) {
        if !self.workers.is_empty() {
            return;
        }

        if let Some(reconciler) = &self.reconciler {
            let worker = Arc::clone(reconciler);
            self.workers
                .push(tokio::spawn(worker.run(self.cancel.child_token())));
        }

        if let Some(interval) = self.config.cache.sweep_interval() {
            self.workers.push(
                self.repository
                    .spawn_maintenance(interval, self.cancel.child_token()),
            );
        }

        tracing::info!("Application initialized with {} background workers", self.workers.len());
    }

    /// Stop background work and wait for the workers to exit.
    pub async fn shutdown(&mut self) {
        tracing::info!("Shutting down application");

        self.cancel.cancel();
        self.repository.shutdown();

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                tracing::error!("Background worker ended abnormally: {}", e);
            }
        }
    }

    /// Push every due sync task now. Fails when sync is disabled.
    pub async fn sync_now(&self) -> Result<usize, AppError> {
        let reconciler = self.reconciler.as_ref().ok_or(ConfigError::SyncDisabled)?;
        Ok(reconciler.drain().await?)
    }

    /// Queue downloads of the backend's copies for horizons `0..days` at a
    /// coordinate. Returns how many new tasks were queued.
    pub async fn request_pull(&self, coordinate: Coordinate, days: u32) -> Result<usize, AppError> {
        if self.reconciler.is_none() {
            return Err(ConfigError::SyncDisabled.into());
        }

        let mut queued = 0;
        for horizon in 0..days {
            if self.repository.request_pull(coordinate, horizon).await? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repository(&self) -> &WeatherRepository {
        &self.repository
    }

    /// Client for location search.
    pub fn weather_client(&self) -> &OpenWeatherClient {
        &self.weather
    }

    pub fn locations(&self) -> &Arc<SavedLocationStore> {
        &self.locations
    }

    pub fn reconciler(&self) -> Option<&Arc<SyncReconciler>> {
        self.reconciler.as_ref()
    }
}
