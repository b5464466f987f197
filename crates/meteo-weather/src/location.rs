//! Location provider seam.
//!
//! The pipeline never resolves a position itself; platform code (GPS, IP
//! lookup, a saved place) implements [`LocationProvider`].

use async_trait::async_trait;

use crate::error::{WeatherError, WeatherResult};
use crate::types::Coordinate;

#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Where the user is now, or [`WeatherError::LocationUnavailable`].
    async fn current_location(&self) -> WeatherResult<Coordinate>;
}

/// A fixed coordinate, typically from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticLocation {
    coordinate: Option<Coordinate>,
}

impl StaticLocation {
    pub fn new(coordinate: Coordinate) -> Self {
        Self {
            coordinate: Some(coordinate),
        }
    }

    /// A provider that always reports the location as unavailable.
    pub fn unavailable() -> Self {
        Self { coordinate: None }
    }
}

#[async_trait]
impl LocationProvider for StaticLocation {
    async fn current_location(&self) -> WeatherResult<Coordinate> {
        self.coordinate
            .ok_or_else(|| WeatherError::LocationUnavailable("no location configured".into()))
    }
}
