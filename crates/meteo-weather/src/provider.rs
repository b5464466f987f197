//! Weather API client.
//!
//! Talks to the OpenWeatherMap endpoints, maps transport and HTTP failures into
//! [`WeatherError`] and turns payloads into [`WeatherRecord`]s. It never touches
//! the cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ETAG;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::instrument;

use crate::error::{WeatherError, WeatherResult};
use crate::retry::{status_error, with_retry, RetryConfig};
use crate::types::{Coordinate, HourlyForecast, HourlyPoint, Units, WeatherRecord, Wind};

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
/// The daily forecast covers today plus seven days.
pub const MAX_HORIZON_DAYS: u32 = 7;
const USER_AGENT: &str = concat!("meteo/", env!("CARGO_PKG_VERSION"));

/// Anything that can produce a record for a coordinate and horizon.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch(&self, coordinate: Coordinate, horizon: u32) -> WeatherResult<WeatherRecord>;

    /// The 5-day forecast in 3-hour steps.
    async fn fetch_hourly(&self, _coordinate: Coordinate) -> WeatherResult<HourlyForecast> {
        Err(WeatherError::invalid("source has no hourly forecast"))
    }

    /// Current conditions for a place name such as `"Paris"` or `"Paris,FR"`.
    /// The record carries the coordinate the provider resolved the name to.
    async fn fetch_by_city(&self, _city: &str) -> WeatherResult<WeatherRecord> {
        Err(WeatherError::invalid("source cannot look up places by name"))
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Geocoding host; the public API serves it from the same origin
    pub geo_base_url: String,
    pub api_key: String,
    pub units: Units,
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            geo_base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            units: Units::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.geo_base_url = base_url.clone();
        self.base_url = base_url;
        self
    }

    pub fn with_units(mut self, units: Units) -> Self {
        self.units = units;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct OpenWeatherClient {
    pub(crate) client: Arc<Client>,
    pub(crate) config: ProviderConfig,
}

impl OpenWeatherClient {
    pub fn new(config: ProviderConfig) -> WeatherResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    pub fn units(&self) -> Units {
        self.config.units
    }

    fn trimmed(base: &str) -> &str {
        base.trim_end_matches('/')
    }

    /// Send a request and hand back the ETag and body of a 2xx response.
    async fn send(request: RequestBuilder) -> WeatherResult<(Option<String>, String)> {
        let response = request.send().await?;
        let status = response.status();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
            .filter(|s| !s.is_empty());
        let body = response.text().await?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        Ok((etag, body))
    }

    /// One request, no retries.
    async fn fetch_once(&self, coordinate: Coordinate, horizon: u32) -> WeatherResult<WeatherRecord> {
        let lat = coordinate.latitude.to_string();
        let lon = coordinate.longitude.to_string();
        let units = self.config.units.as_query();
        let base = Self::trimmed(&self.config.base_url);

        let request = if horizon == 0 {
            self.client.get(format!("{}/data/2.5/weather", base)).query(&[
                ("lat", lat.as_str()),
                ("lon", lon.as_str()),
                ("appid", self.config.api_key.as_str()),
                ("units", units),
            ])
        } else {
            self.client.get(format!("{}/data/3.0/onecall", base)).query(&[
                ("lat", lat.as_str()),
                ("lon", lon.as_str()),
                ("appid", self.config.api_key.as_str()),
                ("units", units),
                ("exclude", "minutely,hourly,alerts"),
            ])
        };

        let (etag, body) = Self::send(request).await?;
        if horizon == 0 {
            parse_current(&body, coordinate, self.config.units, etag)
        } else {
            parse_daily(&body, coordinate, horizon, self.config.units, etag)
        }
    }

    async fn fetch_hourly_once(&self, coordinate: Coordinate) -> WeatherResult<HourlyForecast> {
        let lat = coordinate.latitude.to_string();
        let lon = coordinate.longitude.to_string();
        let base = Self::trimmed(&self.config.base_url);

        let request = self.client.get(format!("{}/data/2.5/forecast", base)).query(&[
            ("lat", lat.as_str()),
            ("lon", lon.as_str()),
            ("appid", self.config.api_key.as_str()),
            ("units", self.config.units.as_query()),
        ]);

        let (etag, body) = Self::send(request).await?;
        parse_hourly(&body, coordinate, self.config.units, etag)
    }

    async fn fetch_by_city_once(&self, city: &str) -> WeatherResult<WeatherRecord> {
        let base = Self::trimmed(&self.config.base_url);
        let request = self.client.get(format!("{}/data/2.5/weather", base)).query(&[
            ("q", city),
            ("appid", self.config.api_key.as_str()),
            ("units", self.config.units.as_query()),
        ]);

        let (etag, body) = Self::send(request).await?;
        parse_current_located(&body, self.config.units, etag)
    }
}

#[async_trait]
impl WeatherSource for OpenWeatherClient {
    #[instrument(skip(self), level = "info")]
    async fn fetch(&self, coordinate: Coordinate, horizon: u32) -> WeatherResult<WeatherRecord> {
        coordinate.validate()?;
        if horizon > MAX_HORIZON_DAYS {
            return Err(WeatherError::invalid(format!(
                "horizon {} beyond the {}-day forecast",
                horizon, MAX_HORIZON_DAYS
            )));
        }

        with_retry(&self.config.retry, || self.fetch_once(coordinate, horizon)).await
    }

    #[instrument(skip(self), level = "info")]
    async fn fetch_hourly(&self, coordinate: Coordinate) -> WeatherResult<HourlyForecast> {
        coordinate.validate()?;
        with_retry(&self.config.retry, || self.fetch_hourly_once(coordinate)).await
    }

    #[instrument(skip(self), level = "info")]
    async fn fetch_by_city(&self, city: &str) -> WeatherResult<WeatherRecord> {
        let city = city.trim();
        if city.is_empty() {
            return Err(WeatherError::invalid("city name is empty"));
        }
        with_retry(&self.config.retry, || self.fetch_by_city_once(city)).await
    }
}

// Wire types. Required fields are non-optional so serde rejects payloads
// that miss them or carry non-numeric values.

#[derive(Debug, Deserialize)]
struct ApiCondition {
    id: u16,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiCoord {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    coord: Option<ApiCoord>,
    dt: i64,
    main: CurrentMain,
    wind: CurrentWind,
    weather: Vec<ApiCondition>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CurrentMain {
    temp: f64,
    humidity: f64,
    feels_like: Option<f64>,
    pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CurrentWind {
    speed: f64,
    deg: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    list: Vec<ForecastStep>,
    city: Option<ForecastCity>,
}

#[derive(Debug, Deserialize)]
struct ForecastStep {
    dt: i64,
    main: CurrentMain,
    wind: CurrentWind,
    weather: Vec<ApiCondition>,
    pop: Option<f64>,
    rain: Option<StepVolume>,
}

#[derive(Debug, Deserialize)]
struct StepVolume {
    #[serde(rename = "3h")]
    three_hours: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ForecastCity {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OneCallResponse {
    daily: Vec<DailyEntry>,
}

#[derive(Debug, Deserialize)]
struct DailyEntry {
    dt: i64,
    temp: DailyTemp,
    feels_like: Option<DailyTemp>,
    humidity: f64,
    pressure: Option<f64>,
    wind_speed: f64,
    wind_deg: Option<f64>,
    weather: Vec<ApiCondition>,
}

#[derive(Debug, Deserialize)]
struct DailyTemp {
    day: f64,
}

fn timestamp(dt: i64) -> WeatherResult<DateTime<Utc>> {
    DateTime::from_timestamp(dt, 0)
        .ok_or_else(|| WeatherError::data_format(format!("timestamp {} out of range", dt)))
}

fn humidity(value: f64) -> WeatherResult<u8> {
    if !(0.0..=100.0).contains(&value) {
        return Err(WeatherError::data_format(format!("humidity {} outside 0-100", value)));
    }
    Ok(value.round() as u8)
}

fn primary_condition(conditions: Vec<ApiCondition>) -> WeatherResult<ApiCondition> {
    conditions
        .into_iter()
        .next()
        .ok_or_else(|| WeatherError::data_format("payload has no weather condition"))
}

fn wind_direction(deg: Option<f64>) -> Option<u16> {
    deg.filter(|d| d.is_finite()).map(|d| d.rem_euclid(360.0).round() as u16 % 360)
}

fn pressure(value: Option<f64>) -> Option<u32> {
    value.filter(|p| p.is_finite() && *p >= 0.0).map(|p| p.round() as u32)
}

pub(crate) fn parse_current(
    body: &str,
    coordinate: Coordinate,
    units: Units,
    etag: Option<String>,
) -> WeatherResult<WeatherRecord> {
    let payload: CurrentResponse = serde_json::from_str(body)?;
    current_record(payload, coordinate, units, etag)
}

/// Current conditions located by the coordinate in the payload.
pub(crate) fn parse_current_located(
    body: &str,
    units: Units,
    etag: Option<String>,
) -> WeatherResult<WeatherRecord> {
    let payload: CurrentResponse = serde_json::from_str(body)?;
    let coord = payload
        .coord
        .as_ref()
        .ok_or_else(|| WeatherError::data_format("payload has no coordinates"))?;
    let coordinate = Coordinate::new(coord.lat, coord.lon)
        .map_err(|e| WeatherError::data_format(e.to_string()))?;
    current_record(payload, coordinate, units, etag)
}

fn current_record(
    payload: CurrentResponse,
    coordinate: Coordinate,
    units: Units,
    etag: Option<String>,
) -> WeatherResult<WeatherRecord> {
    let condition = primary_condition(payload.weather)?;

    Ok(WeatherRecord {
        coordinate,
        observed_at: timestamp(payload.dt)?,
        temperature: payload.main.temp,
        feels_like: payload.main.feels_like,
        humidity: humidity(payload.main.humidity)?,
        pressure: pressure(payload.main.pressure),
        wind: Wind {
            speed: payload.wind.speed,
            direction: wind_direction(payload.wind.deg),
        },
        condition_code: condition.id,
        description: condition.description,
        place_name: payload.name.filter(|n| !n.is_empty()),
        horizon: 0,
        units,
        version: etag.unwrap_or_else(|| payload.dt.to_string()),
    })
}

pub(crate) fn parse_hourly(
    body: &str,
    coordinate: Coordinate,
    units: Units,
    etag: Option<String>,
) -> WeatherResult<HourlyForecast> {
    let payload: ForecastResponse = serde_json::from_str(body)?;
    if payload.list.is_empty() {
        return Err(WeatherError::data_format("hourly forecast has no steps"));
    }

    let mut points = payload
        .list
        .into_iter()
        .map(|step| {
            let condition = primary_condition(step.weather)?;
            Ok(HourlyPoint {
                at: timestamp(step.dt)?,
                temperature: step.main.temp,
                feels_like: step.main.feels_like,
                humidity: humidity(step.main.humidity)?,
                pressure: pressure(step.main.pressure),
                wind: Wind {
                    speed: step.wind.speed,
                    direction: wind_direction(step.wind.deg),
                },
                condition_code: condition.id,
                description: condition.description,
                precipitation_chance: precipitation_chance(step.pop)?,
                rain_mm: step
                    .rain
                    .and_then(|r| r.three_hours)
                    .filter(|mm| mm.is_finite() && *mm >= 0.0),
            })
        })
        .collect::<WeatherResult<Vec<_>>>()?;
    points.sort_by_key(|p| p.at);

    let version = etag
        .or_else(|| points.first().map(|p| p.at.timestamp().to_string()))
        .unwrap_or_default();
    Ok(HourlyForecast {
        coordinate,
        place_name: payload.city.and_then(|c| c.name).filter(|n| !n.is_empty()),
        units,
        version,
        points,
    })
}

fn precipitation_chance(pop: Option<f64>) -> WeatherResult<u8> {
    match pop {
        None => Ok(0),
        Some(p) if (0.0..=1.0).contains(&p) => Ok((p * 100.0).round() as u8),
        Some(p) => Err(WeatherError::data_format(format!(
            "precipitation probability {} outside 0-1",
            p
        ))),
    }
}

pub(crate) fn parse_daily(
    body: &str,
    coordinate: Coordinate,
    horizon: u32,
    units: Units,
    etag: Option<String>,
) -> WeatherResult<WeatherRecord> {
    let payload: OneCallResponse = serde_json::from_str(body)?;
    let available = payload.daily.len();
    let day = payload
        .daily
        .into_iter()
        .nth(horizon as usize)
        .ok_or_else(|| {
            WeatherError::data_format(format!(
                "forecast has {} days, horizon {} requested",
                available, horizon
            ))
        })?;
    let condition = primary_condition(day.weather)?;

    Ok(WeatherRecord {
        coordinate,
        observed_at: timestamp(day.dt)?,
        temperature: day.temp.day,
        feels_like: day.feels_like.map(|f| f.day),
        humidity: humidity(day.humidity)?,
        pressure: pressure(day.pressure),
        wind: Wind {
            speed: day.wind_speed,
            direction: wind_direction(day.wind_deg),
        },
        condition_code: condition.id,
        description: condition.description,
        place_name: None,
        horizon,
        units,
        version: etag.unwrap_or_else(|| day.dt.to_string()),
    })
}
