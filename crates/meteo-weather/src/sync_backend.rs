//! Remote sync backend: a document store keyed by device, bucket and horizon.
//!
//! Documents carry a user-relevant subset of a record plus the `fetched_at`
//! it was fetched at. The server keeps whichever write has the later
//! `fetched_at` and answers a losing upsert with `409 Conflict` and its own
//! document.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::bucket::CacheKey;
use crate::cache::CacheEntry;
use crate::error::{WeatherError, WeatherResult};
use crate::retry::status_error;
use crate::types::{Coordinate, Units, WeatherRecord, Wind};

/// Wire form of a synced record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDocument {
    /// `lat_index:lon_index` on the grid below
    pub bucket: String,
    pub cells_per_degree: u32,
    pub horizon: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub observed_at: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: u8,
    pub wind_speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_direction: Option<u16>,
    pub condition_code: u16,
    pub units: Units,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_name: Option<String>,
    pub version: String,
    /// Last-writer-wins field
    pub fetched_at: DateTime<Utc>,
    /// Set by the server on accepted writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl SyncDocument {
    pub fn from_entry(entry: &CacheEntry) -> Self {
        let record = &entry.record;
        Self {
            bucket: entry.key.bucket.to_string(),
            cells_per_degree: entry.key.bucket.cells_per_degree,
            horizon: entry.key.horizon,
            latitude: record.coordinate.latitude,
            longitude: record.coordinate.longitude,
            observed_at: record.observed_at,
            temperature: record.temperature,
            humidity: record.humidity,
            wind_speed: record.wind.speed,
            wind_direction: record.wind.direction,
            condition_code: record.condition_code,
            units: record.units,
            place_name: record.place_name.clone(),
            version: record.version.clone(),
            fetched_at: entry.fetched_at,
            server_timestamp: None,
        }
    }

    /// Rebuild a record. Fields outside the synced subset come back empty.
    pub fn to_record(&self) -> WeatherResult<WeatherRecord> {
        if self.humidity > 100 {
            return Err(WeatherError::data_format(format!(
                "synced humidity {} outside 0-100",
                self.humidity
            )));
        }
        Ok(WeatherRecord {
            coordinate: Coordinate::new(self.latitude, self.longitude)?,
            observed_at: self.observed_at,
            temperature: self.temperature,
            feels_like: None,
            humidity: self.humidity,
            pressure: None,
            wind: Wind {
                speed: self.wind_speed,
                direction: self.wind_direction,
            },
            condition_code: self.condition_code,
            description: None,
            place_name: self.place_name.clone(),
            horizon: self.horizon,
            units: self.units,
            version: self.version.clone(),
        })
    }
}

/// Server's answer to an upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Accepted,
    /// The server holds a newer document
    Conflict(SyncDocument),
}

#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn upsert(&self, key: &CacheKey, document: &SyncDocument) -> WeatherResult<UpsertOutcome>;

    /// The server's document for a key, if any.
    async fn fetch(&self, key: &CacheKey) -> WeatherResult<Option<SyncDocument>>;
}

pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 10;

/// JSON-over-HTTP sync backend.
///
/// `PUT|GET {base}/v1/devices/{device}/weather/{bucket}/{horizon}`
#[derive(Debug, Clone)]
pub struct HttpSyncBackend {
    client: Arc<Client>,
    base_url: String,
    device_id: String,
    token: Option<String>,
}

impl HttpSyncBackend {
    pub fn new(
        base_url: impl Into<String>,
        device_id: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> WeatherResult<Self> {
        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Err(WeatherError::invalid("sync device id is empty"));
        }
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client: Arc::new(client),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            device_id,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn document_url(&self, key: &CacheKey) -> String {
        format!(
            "{}/v1/devices/{}/weather/{}/{}",
            self.base_url, self.device_id, key.bucket, key.horizon
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl SyncBackend for HttpSyncBackend {
    #[instrument(skip_all, fields(key = %key), level = "debug")]
    async fn upsert(&self, key: &CacheKey, document: &SyncDocument) -> WeatherResult<UpsertOutcome> {
        let response = self
            .authorize(self.client.put(self.document_url(key)))
            .json(document)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        match status {
            s if s.is_success() => Ok(UpsertOutcome::Accepted),
            StatusCode::CONFLICT => Ok(UpsertOutcome::Conflict(serde_json::from_str(&body)?)),
            s => Err(status_error(s, &body)),
        }
    }

    #[instrument(skip_all, fields(key = %key), level = "debug")]
    async fn fetch(&self, key: &CacheKey) -> WeatherResult<Option<SyncDocument>> {
        let response = self.authorize(self.client.get(self.document_url(key))).send().await?;

        let status = response.status();
        let body = response.text().await?;

        match status {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(serde_json::from_str(&body)?)),
            s => Err(status_error(s, &body)),
        }
    }
}
