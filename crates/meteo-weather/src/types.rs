use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{WeatherError, WeatherResult};

/// Unit system requested from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Metric,
    Imperial,
}

impl Units {
    /// Value of the provider's `units` query parameter
    pub fn as_query(self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Imperial => "imperial",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "imperial" => Self::Imperial,
            _ => Self::Metric,
        }
    }
}

/// Weather condition categories mapped from provider condition codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    #[default]
    Clear,
    PartlyCloudy,
    Cloudy,
    Fog,
    Drizzle,
    Rain,
    HeavyRain,
    Snow,
    Sleet,
    Thunderstorm,
}

impl WeatherCondition {
    /// Convert an OpenWeatherMap condition id to a WeatherCondition
    /// See: https://openweathermap.org/weather-conditions
    pub fn from_code(code: u16) -> Self {
        match code {
            200..=299 => Self::Thunderstorm,
            300..=399 => Self::Drizzle,
            511 => Self::Sleet, // Freezing rain
            502..=504 | 522 | 531 => Self::HeavyRain,
            500..=599 => Self::Rain,
            611..=616 => Self::Sleet,
            600..=699 => Self::Snow,
            700..=799 => Self::Fog, // Mist, haze, dust, fog
            801 | 802 => Self::PartlyCloudy,
            803 | 804 => Self::Cloudy,
            _ => Self::Clear, // 800 and unknown codes
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::PartlyCloudy => "Partly Cloudy",
            Self::Cloudy => "Cloudy",
            Self::Fog => "Fog",
            Self::Drizzle => "Drizzle",
            Self::Rain => "Rain",
            Self::HeavyRain => "Heavy Rain",
            Self::Snow => "Snow",
            Self::Sleet => "Sleet",
            Self::Thunderstorm => "Thunderstorm",
        }
    }
}

/// Geographic coordinate. Immutable value, validated on construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> WeatherResult<Self> {
        let coordinate = Self { latitude, longitude };
        coordinate.validate()?;
        Ok(coordinate)
    }

    /// Check lat ∈ [-90, 90] and lon ∈ [-180, 180].
    pub fn validate(&self) -> WeatherResult<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(WeatherError::invalid(format!(
                "latitude {} outside [-90, 90]",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(WeatherError::invalid(format!(
                "longitude {} outside [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// Wind conditions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Wind {
    pub speed: f64,
    /// Meteorological direction in degrees, when reported
    pub direction: Option<u16>,
}

/// One observation or forecast for a coordinate at a horizon.
///
/// Never mutated in place: a newer record for the same key supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub coordinate: Coordinate,
    pub observed_at: DateTime<Utc>,
    pub temperature: f64,
    pub feels_like: Option<f64>,
    pub humidity: u8,
    pub pressure: Option<u32>,
    pub wind: Wind,
    pub condition_code: u16,
    pub description: Option<String>,
    pub place_name: Option<String>,
    /// Days ahead; 0 is current conditions
    pub horizon: u32,
    pub units: Units,
    /// Provider etag, or the observation timestamp when none was sent
    pub version: String,
}

impl WeatherRecord {
    pub fn condition(&self) -> WeatherCondition {
        WeatherCondition::from_code(self.condition_code)
    }
}

/// How a reading relates to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Within TTL, either from cache or just fetched
    Fresh,
    /// Past TTL, served while a background refresh runs
    Stale,
    /// Past TTL and the refresh failed
    Degraded { reason: String },
}

/// What the repository hands to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherReading {
    pub record: WeatherRecord,
    pub fetched_at: DateTime<Utc>,
    pub freshness: Freshness,
}

impl WeatherReading {
    pub fn is_fresh(&self) -> bool {
        matches!(self.freshness, Freshness::Fresh)
    }

    /// True when the UI should show a "data may be outdated" indicator.
    pub fn is_degraded(&self) -> bool {
        matches!(self.freshness, Freshness::Degraded { .. })
    }
}

/// One 3-hour step of the short-range forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyPoint {
    /// Start of the step
    pub at: DateTime<Utc>,
    pub temperature: f64,
    pub feels_like: Option<f64>,
    pub humidity: u8,
    pub pressure: Option<u32>,
    pub wind: Wind,
    pub condition_code: u16,
    pub description: Option<String>,
    /// Probability of precipitation, 0-100
    pub precipitation_chance: u8,
    /// Rain volume over the step in mm
    pub rain_mm: Option<f64>,
}

impl HourlyPoint {
    pub fn condition(&self) -> WeatherCondition {
        WeatherCondition::from_code(self.condition_code)
    }
}

/// The 5-day forecast in 3-hour steps for one coordinate, oldest step first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyForecast {
    pub coordinate: Coordinate,
    pub place_name: Option<String>,
    pub units: Units,
    pub version: String,
    pub points: Vec<HourlyPoint>,
}

impl HourlyForecast {
    /// Steps starting in `[from, to]`.
    pub fn between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> impl Iterator<Item = &HourlyPoint> {
        self.points.iter().filter(move |p| p.at >= from && p.at <= to)
    }
}

/// An hourly forecast as handed to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyReading {
    pub forecast: HourlyForecast,
    pub fetched_at: DateTime<Utc>,
    pub freshness: Freshness,
}

impl HourlyReading {
    pub fn is_degraded(&self) -> bool {
        matches!(self.freshness, Freshness::Degraded { .. })
    }
}

/// One past fetch, for charts.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub record: WeatherRecord,
    pub fetched_at: DateTime<Utc>,
}

/// Per-call read policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchPolicy {
    /// Return a stale entry immediately and revalidate in the background.
    pub allow_stale: bool,
}

impl FetchPolicy {
    pub fn fresh_only() -> Self {
        Self { allow_stale: false }
    }

    pub fn stale_while_revalidate() -> Self {
        Self { allow_stale: true }
    }
}

/// A place returned by location search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceMatch {
    pub name: String,
    pub country: Option<String>,
    pub state: Option<String>,
    pub coordinate: Coordinate,
}

impl PlaceMatch {
    /// "Name, State, Country" with absent parts skipped.
    pub fn display_name(&self) -> String {
        let mut parts = vec![self.name.as_str()];
        parts.extend(self.state.as_deref().filter(|s| !s.is_empty()));
        parts.extend(self.country.as_deref().filter(|s| !s.is_empty()));
        parts.join(", ")
    }
}
