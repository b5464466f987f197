//! Location search by name via the provider's geocoding endpoint.

use serde::Deserialize;
use tracing::instrument;

use crate::error::{WeatherError, WeatherResult};
use crate::provider::OpenWeatherClient;
use crate::retry::{status_error, with_retry};
use crate::types::{Coordinate, PlaceMatch};

/// Upper bound the geocoding API accepts for `limit`.
pub const MAX_SEARCH_RESULTS: u32 = 5;

#[derive(Debug, Deserialize)]
struct GeoEntry {
    name: String,
    lat: f64,
    lon: f64,
    country: Option<String>,
    state: Option<String>,
}

impl OpenWeatherClient {
    /// Find places matching a free-text query such as "Paris" or "Paris,FR".
    #[instrument(skip(self), level = "info")]
    pub async fn search_locations(&self, query: &str, limit: u32) -> WeatherResult<Vec<PlaceMatch>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(WeatherError::invalid("search query is empty"));
        }
        let limit = limit.clamp(1, MAX_SEARCH_RESULTS).to_string();

        with_retry(&self.config.retry, || self.search_once(query, &limit)).await
    }

    async fn search_once(&self, query: &str, limit: &str) -> WeatherResult<Vec<PlaceMatch>> {
        let url = format!("{}/geo/1.0/direct", self.config.geo_base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("q", query), ("limit", limit), ("appid", self.config.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        parse_places(&body)
    }
}

/// Entries with out-of-range coordinates are skipped rather than failing the search.
pub(crate) fn parse_places(body: &str) -> WeatherResult<Vec<PlaceMatch>> {
    let entries: Vec<GeoEntry> = serde_json::from_str(body)?;
    let places = entries
        .into_iter()
        .filter_map(|entry| match Coordinate::new(entry.lat, entry.lon) {
            Ok(coordinate) => Some(PlaceMatch {
                name: entry.name,
                country: entry.country,
                state: entry.state,
                coordinate,
            }),
            Err(e) => {
                tracing::debug!("Skipping geocoding result {}: {}", entry.name, e);
                None
            }
        })
        .collect();
    Ok(places)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::provider::ProviderConfig;

    #[test]
    fn test_parse_places() {
        let body = r#"[
            {"name": "London", "local_names": {"en": "London"}, "lat": 51.5073, "lon": -0.1276, "country": "GB", "state": "England"},
            {"name": "London", "lat": 42.9834, "lon": -81.233, "country": "CA", "state": "Ontario"},
            {"name": "Nowhere", "lat": 123.0, "lon": 0.0}
        ]"#;

        let places = parse_places(body).unwrap();
        assert_eq!(places.len(), 2);
        assert_eq!(places[0].display_name(), "London, England, GB");
        assert_eq!(places[1].country.as_deref(), Some("CA"));
    }

    #[test]
    fn test_parse_places_rejects_non_array() {
        let err = parse_places(r#"{"cod": 401}"#).unwrap_err();
        assert!(matches!(err, WeatherError::DataFormat(_)));
    }

    #[tokio::test]
    async fn test_empty_query_is_invalid() {
        let client = OpenWeatherClient::new(ProviderConfig::new("key")).unwrap();
        let err = client.search_locations("   ", 5).await.unwrap_err();
        assert!(matches!(err, WeatherError::InvalidInput(_)));
    }
}
