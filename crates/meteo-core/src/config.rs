use anyhow::{Context, Result};
use meteo_weather::{
    Coordinate, GridResolution, ProviderConfig, ReconcilerSettings, RepositorySettings,
    RetryConfig, TtlConfig, Units,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;

/// Environment variable that overrides `provider.api_key`
pub const API_KEY_ENV: &str = "METEO_API_KEY";

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Fail with [`ConfigError::Invalid`] when there are errors.
    pub fn into_result(self) -> Result<Self, ConfigError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(ConfigError::Invalid(self.error_summary()))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite databases
    pub data_dir: PathBuf,

    #[serde(default)]
    pub provider: ApiConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub location: LocationConfig,
}

/// Weather provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub geo_base_url: String,
    /// OpenWeatherMap API key; `METEO_API_KEY` takes precedence
    pub api_key: String,
    pub units: Units,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: meteo_weather::provider::DEFAULT_BASE_URL.to_string(),
            geo_base_url: meteo_weather::provider::DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            units: Units::Metric,
            timeout_secs: meteo_weather::provider::DEFAULT_TIMEOUT_SECS,
            retry_attempts: 3,
            retry_initial_ms: 1000,
            retry_max_ms: 10_000,
        }
    }
}

impl ApiConfig {
    pub fn to_provider_config(&self) -> ProviderConfig {
        let mut config = ProviderConfig::new(self.api_key.clone())
            .with_units(self.units)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_retry(RetryConfig::new(
                self.retry_attempts,
                self.retry_initial_ms,
                self.retry_max_ms,
            ));
        config.base_url = self.base_url.trim_end_matches('/').to_string();
        config.geo_base_url = self.geo_base_url.trim_end_matches('/').to_string();
        config
    }
}

/// Cache freshness and retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub current_ttl_minutes: u64,
    pub forecast_ttl_hours: u64,
    /// Long-stop age after which entries and history are purged
    pub max_age_days: u64,
    /// 100 cells per degree is a 0.01° grid
    pub cells_per_degree: u32,
    /// 0 disables the periodic sweep
    pub sweep_interval_minutes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            current_ttl_minutes: 15,
            forecast_ttl_hours: 6,
            max_age_days: 7,
            cells_per_degree: 100,
            sweep_interval_minutes: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl_config(&self) -> TtlConfig {
        TtlConfig {
            current: Duration::from_secs(self.current_ttl_minutes * 60),
            forecast: Duration::from_secs(self.forecast_ttl_hours * 3600),
            max_age: Duration::from_secs(self.max_age_days * 86_400),
        }
    }

    pub fn grid(&self) -> GridResolution {
        GridResolution::new(self.cells_per_degree)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_minutes > 0).then(|| Duration::from_secs(self.sweep_interval_minutes * 60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Overall cap on one provider fetch, retries included
    pub deadline_secs: u64,
    /// Minimum spacing between revalidations of one key
    pub revalidate_backoff_secs: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            deadline_secs: meteo_weather::repository::DEFAULT_DEADLINE_SECS,
            revalidate_backoff_secs: meteo_weather::repository::DEFAULT_REVALIDATE_BACKOFF_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub backend_url: String,
    pub device_id: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend_url: String::new(),
            device_id: String::new(),
            token: None,
            timeout_secs: meteo_weather::sync_backend::DEFAULT_SYNC_TIMEOUT_SECS,
            max_attempts: meteo_weather::reconciler::DEFAULT_SYNC_MAX_ATTEMPTS,
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
            poll_interval_secs: meteo_weather::reconciler::DEFAULT_SYNC_POLL_SECS,
        }
    }
}

impl SyncConfig {
    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            retry: RetryConfig::new(
                self.max_attempts,
                self.initial_backoff_secs * 1000,
                self.max_backoff_secs * 1000,
            ),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
        }
    }
}

/// Fixed location. When unset the most recently used saved location is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationConfig {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl LocationConfig {
    /// The configured coordinate, if both parts are present and in range.
    pub fn coordinate(&self) -> Option<Coordinate> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Coordinate::new(lat, lon).ok(),
            _ => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meteo");

        Self {
            data_dir,
            provider: ApiConfig::default(),
            cache: CacheConfig::default(),
            repository: RepositoryConfig::default(),
            sync: SyncConfig::default(),
            location: LocationConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, creating default if it doesn't exist
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_api_key_override(std::env::var(API_KEY_ENV).ok());
        Ok(config)
    }

    /// Load from an explicit path, writing defaults there when missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns an error if validation fails; warnings are logged.
    pub fn load_validated() -> Result<(Self, ValidationResult)> {
        let config = Self::load()?;
        let validation = config.validate().into_result()?;

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// A non-empty key from the environment replaces the configured one.
    pub fn apply_api_key_override(&mut self, key: Option<String>) {
        if let Some(key) = key.filter(|k| !k.trim().is_empty()) {
            self.provider.api_key = key;
        }
    }

    pub fn repository_settings(&self) -> RepositorySettings {
        RepositorySettings::default()
            .with_grid(self.cache.grid())
            .with_deadline(Duration::from_secs(self.repository.deadline_secs))
            .with_revalidate_backoff(Duration::from_secs(self.repository.revalidate_backoff_secs))
    }

    /// Validate the configuration
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.validate_url(&self.provider.base_url, "provider.base_url", &mut result);
        self.validate_url(&self.provider.geo_base_url, "provider.geo_base_url", &mut result);

        if self.provider.api_key.trim().is_empty() {
            result.add_warning(
                "provider.api_key",
                format!("No API key (set {}); only cached data can be served", API_KEY_ENV),
            );
        }
        if self.provider.timeout_secs == 0 {
            result.add_error("provider.timeout_secs", "Request timeout must be greater than 0");
        }
        if self.provider.retry_attempts == 0 {
            result.add_error("provider.retry_attempts", "At least one attempt is required");
        } else if self.provider.retry_attempts > 10 {
            result.add_warning("provider.retry_attempts", "More than 10 attempts per request");
        }

        if self.cache.current_ttl_minutes == 0 {
            result.add_error("cache.current_ttl_minutes", "TTL must be greater than 0");
        }
        if self.cache.forecast_ttl_hours == 0 {
            result.add_error("cache.forecast_ttl_hours", "TTL must be greater than 0");
        }
        if self.cache.max_age_days * 24 < self.cache.forecast_ttl_hours {
            result.add_warning(
                "cache.max_age_days",
                "Entries are purged before their forecast TTL runs out",
            );
        }
        if self.cache.cells_per_degree == 0 {
            result.add_error("cache.cells_per_degree", "Grid resolution must be greater than 0");
        } else if self.cache.cells_per_degree > 1000 {
            result.add_warning(
                "cache.cells_per_degree",
                "Grid finer than 0.001° will rarely share cache entries",
            );
        }
        if self.cache.sweep_interval_minutes == 0 {
            result.add_warning("cache.sweep_interval_minutes", "Periodic cache sweep disabled");
        }

        if self.repository.deadline_secs == 0 {
            result.add_error("repository.deadline_secs", "Deadline must be greater than 0");
        } else if self.repository.deadline_secs < self.provider.timeout_secs {
            result.add_warning(
                "repository.deadline_secs",
                "Deadline is shorter than a single request timeout",
            );
        }

        if self.sync.enabled {
            self.validate_url(&self.sync.backend_url, "sync.backend_url", &mut result);
            if self.sync.device_id.trim().is_empty() {
                result.add_error("sync.device_id", "Device id is required when sync is enabled");
            }
            if self.sync.max_attempts == 0 {
                result.add_error("sync.max_attempts", "At least one attempt is required");
            }
        }

        match (self.location.latitude, self.location.longitude) {
            (None, None) => {}
            (Some(lat), Some(lon)) => {
                if let Err(e) = Coordinate::new(lat, lon) {
                    result.add_error("location", e.to_string());
                }
            }
            _ => result.add_error("location", "Both latitude and longitude must be set"),
        }

        result
    }

    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("meteo");

        Ok(config_dir.join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    #[test]
    fn test_valid_default_config() {
        let config = Config::default();
        let result = config.validate();
        assert!(result.is_valid(), "Default config should be valid: {:?}", result.errors);
        assert!(result.warnings.iter().any(|w| w.field == "provider.api_key"));
    }

    #[test]
    fn test_invalid_url_scheme() {
        let mut config = Config::default();
        config.provider.base_url = "ftp://api.example.com".to_string();
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.message.contains("http or https")));
    }

    #[test]
    fn test_sync_requires_backend_and_device() {
        let mut config = Config::default();
        config.sync.enabled = true;
        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.field == "sync.backend_url"));
        assert!(result.errors.iter().any(|e| e.field == "sync.device_id"));

        config.sync.backend_url = "https://sync.example.com".into();
        config.sync.device_id = "phone-1".into();
        assert!(config.validate().is_valid());
    }

    #[test]
    fn test_half_configured_location_is_error() {
        let mut config = Config::default();
        config.location.latitude = Some(45.0);
        assert!(!config.validate().is_valid());

        config.location.longitude = Some(200.0);
        assert!(!config.validate().is_valid());
        assert!(config.location.coordinate().is_none());

        config.location.longitude = Some(-122.0);
        assert!(config.validate().is_valid());
        assert!(config.location.coordinate().is_some());
    }

    #[test]
    fn test_zero_ttl_and_deadline_rejected() {
        let mut config = Config::default();
        config.cache.current_ttl_minutes = 0;
        config.repository.deadline_secs = 0;
        let err = config.validate().into_result().unwrap_err();
        let ConfigError::Invalid(summary) = err else {
            panic!("expected invalid config");
        };
        assert!(summary.contains("cache.current_ttl_minutes"));
        assert!(summary.contains("repository.deadline_secs"));
    }

    #[test]
    fn test_conversions() {
        let mut config = Config::default();
        config.cache.current_ttl_minutes = 10;
        config.cache.cells_per_degree = 10;
        config.repository.deadline_secs = 5;
        config.provider.base_url = "http://localhost:8080/".into();

        let ttl = config.cache.ttl_config();
        assert_eq!(ttl.current, Duration::from_secs(600));
        assert_eq!(ttl.forecast, Duration::from_secs(6 * 3600));
        assert_eq!(ttl.max_age, Duration::from_secs(7 * 86_400));

        let settings = config.repository_settings();
        assert_eq!(settings.grid.cells_per_degree(), 10);
        assert_eq!(settings.deadline, Duration::from_secs(5));

        let provider = config.provider.to_provider_config();
        assert_eq!(provider.base_url, "http://localhost:8080");
        assert_eq!(provider.retry.max_attempts, 3);

        let sync = config.sync.reconciler_settings();
        assert_eq!(sync.retry.max_attempts, 5);
        assert_eq!(sync.retry.initial_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_api_key_override() {
        let mut config = Config::default();
        config.provider.api_key = "from-file".into();

        config.apply_api_key_override(Some("  ".into()));
        assert_eq!(config.provider.api_key, "from-file");

        config.apply_api_key_override(Some("from-env".into()));
        assert_eq!(config.provider.api_key, "from-env");
    }

    #[test]
    fn test_load_creates_defaults_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.cache.current_ttl_minutes, 15);

        let mut edited = created;
        edited.provider.units = Units::Imperial;
        edited.sync.enabled = true;
        edited.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.provider.units, Units::Imperial);
        assert!(loaded.sync.enabled);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "data_dir = \"/tmp/meteo\"\n\n[provider]\nunits = \"imperial\"\n\n[location]\nlatitude = 51.5\nlongitude = -0.12\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.provider.units, Units::Imperial);
        assert_eq!(config.provider.timeout_secs, 10);
        assert_eq!(config.cache.forecast_ttl_hours, 6);
        assert!(!config.sync.enabled);
        assert!(config.location.coordinate().is_some());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "data_dir = [").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
