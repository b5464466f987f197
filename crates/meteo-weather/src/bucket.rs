//! Coordinate bucketing.
//!
//! Raw floating coordinates are never used as keys. Every lookup first snaps
//! the coordinate onto a fixed grid so that repeated queries from roughly the
//! same spot share one cache entry, one sync document and one subscription.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Coordinate;

/// Default grid: 100 cells per degree, i.e. 0.01°.
pub const DEFAULT_CELLS_PER_DEGREE: u32 = 100;

/// Grid resolution used to bucket coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridResolution {
    cells_per_degree: u32,
}

impl GridResolution {
    /// A zero resolution would collapse the globe into one cell, so it is
    /// clamped to 1 cell per degree.
    pub fn new(cells_per_degree: u32) -> Self {
        Self {
            cells_per_degree: cells_per_degree.max(1),
        }
    }

    pub fn cells_per_degree(self) -> u32 {
        self.cells_per_degree
    }

    /// Size of one grid cell in degrees.
    pub fn degrees(self) -> f64 {
        1.0 / f64::from(self.cells_per_degree)
    }

    /// Snap a coordinate onto the grid.
    ///
    /// Rounds to the nearest grid line, so a coordinate written with the
    /// grid's precision (e.g. 37.77 at 0.01°) always lands on its own index
    /// despite binary floating-point representation error.
    pub fn bucket(self, coordinate: &Coordinate) -> CoordinateBucket {
        let cells = f64::from(self.cells_per_degree);
        CoordinateBucket {
            lat_index: (coordinate.latitude * cells).round() as i64,
            lon_index: (coordinate.longitude * cells).round() as i64,
            cells_per_degree: self.cells_per_degree,
        }
    }
}

impl Default for GridResolution {
    fn default() -> Self {
        Self::new(DEFAULT_CELLS_PER_DEGREE)
    }
}

/// A coordinate snapped to a [`GridResolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoordinateBucket {
    pub lat_index: i64,
    pub lon_index: i64,
    pub cells_per_degree: u32,
}

impl CoordinateBucket {
    pub fn new(lat_index: i64, lon_index: i64, grid: GridResolution) -> Self {
        Self {
            lat_index,
            lon_index,
            cells_per_degree: grid.cells_per_degree(),
        }
    }

    pub fn grid(&self) -> GridResolution {
        GridResolution::new(self.cells_per_degree)
    }

    /// The grid point this bucket represents.
    pub fn center(&self) -> Coordinate {
        let cells = f64::from(self.cells_per_degree.max(1));
        Coordinate {
            latitude: (self.lat_index as f64 / cells).clamp(-90.0, 90.0),
            longitude: (self.lon_index as f64 / cells).clamp(-180.0, 180.0),
        }
    }

    /// Parse the `lat:lon` form produced by `Display`.
    pub fn parse(s: &str, grid: GridResolution) -> Option<Self> {
        let (lat, lon) = s.split_once(':')?;
        Some(Self::new(lat.trim().parse().ok()?, lon.trim().parse().ok()?, grid))
    }
}

impl fmt::Display for CoordinateBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lat_index, self.lon_index)
    }
}

/// Cache, sync and read-model key: one bucket at one forecast horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub bucket: CoordinateBucket,
    /// Days ahead; 0 is current conditions.
    pub horizon: u32,
}

impl CacheKey {
    pub fn new(bucket: CoordinateBucket, horizon: u32) -> Self {
        Self { bucket, horizon }
    }

    pub fn for_coordinate(coordinate: &Coordinate, horizon: u32, grid: GridResolution) -> Self {
        Self::new(grid.bucket(coordinate), horizon)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.horizon)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    #[test]
    fn test_bucket_is_deterministic() {
        let grid = GridResolution::default();
        let c = coord(37.77, -122.41);
        assert_eq!(grid.bucket(&c), grid.bucket(&c));
        assert_eq!(grid.bucket(&c).lat_index, 3777);
        assert_eq!(grid.bucket(&c).lon_index, -12241);
    }

    #[test]
    fn test_nearby_coordinates_share_bucket() {
        let grid = GridResolution::default();
        let a = grid.bucket(&coord(37.7701, -122.4102));
        let b = grid.bucket(&coord(37.7698, -122.4097));
        assert_eq!(a, b);
    }

    #[test]
    fn test_distant_coordinates_differ() {
        let grid = GridResolution::default();
        assert_ne!(grid.bucket(&coord(37.77, -122.41)), grid.bucket(&coord(37.79, -122.41)));
    }

    #[test]
    fn test_coarser_grid() {
        let grid = GridResolution::new(10);
        assert_eq!(grid.bucket(&coord(37.77, -122.41)), grid.bucket(&coord(37.81, -122.44)));
        assert!((grid.degrees() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_resolution_is_clamped() {
        assert_eq!(GridResolution::new(0).cells_per_degree(), 1);
    }

    #[test]
    fn test_center_and_parse() {
        let grid = GridResolution::default();
        let bucket = grid.bucket(&coord(-33.87, 151.21));
        let center = bucket.center();
        assert!((center.latitude + 33.87).abs() < 1e-9);
        assert!((center.longitude - 151.21).abs() < 1e-9);

        let parsed = CoordinateBucket::parse(&bucket.to_string(), grid).unwrap();
        assert_eq!(parsed, bucket);
        assert!(CoordinateBucket::parse("garbage", grid).is_none());
    }

    #[test]
    fn test_cache_key_display() {
        let grid = GridResolution::default();
        let key = CacheKey::for_coordinate(&coord(37.77, -122.41), 2, grid);
        assert_eq!(key.to_string(), "3777:-12241/2");
    }
}
