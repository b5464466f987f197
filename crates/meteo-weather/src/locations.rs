//! Saved places: recently viewed locations and favorites.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::bucket::GridResolution;
use crate::error::{WeatherError, WeatherResult};
use crate::location::LocationProvider;
use crate::types::{Coordinate, PlaceMatch};

/// Default length of the "recent locations" list.
pub const DEFAULT_RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct SavedLocation {
    pub id: i64,
    pub name: String,
    pub country: Option<String>,
    pub coordinate: Coordinate,
    pub last_accessed: DateTime<Utc>,
    pub is_favorite: bool,
}

impl SavedLocation {
    pub fn display_name(&self) -> String {
        match self.country.as_deref().filter(|c| !c.is_empty()) {
            Some(country) => format!("{}, {}", self.name, country),
            None => self.name.clone(),
        }
    }
}

const LOCATION_COLUMNS: &str = "id, name, country, latitude, longitude, last_accessed, is_favorite";

/// SQLite store of saved locations. One row per grid bucket.
pub struct SavedLocationStore {
    conn: Mutex<Connection>,
    grid: GridResolution,
}

impl SavedLocationStore {
    pub fn open<P: AsRef<Path>>(path: P, grid: GridResolution) -> WeatherResult<Self> {
        Self::with_connection(Connection::open(path)?, grid)
    }

    /// In-memory store (for testing).
    pub fn in_memory(grid: GridResolution) -> WeatherResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, grid)
    }

    fn with_connection(conn: Connection, grid: GridResolution) -> WeatherResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS saved_locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cells INTEGER NOT NULL,
                lat_idx INTEGER NOT NULL,
                lon_idx INTEGER NOT NULL,
                name TEXT NOT NULL,
                country TEXT,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                last_accessed INTEGER NOT NULL,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                UNIQUE (cells, lat_idx, lon_idx)
            );

            CREATE INDEX IF NOT EXISTS idx_saved_locations_accessed
                ON saved_locations(last_accessed);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            grid,
        })
    }

    /// Save a place, or refresh its name and access time if the bucket is
    /// already saved. The favorite flag survives.
    pub fn save(
        &self,
        name: &str,
        country: Option<&str>,
        coordinate: Coordinate,
        now: DateTime<Utc>,
    ) -> WeatherResult<SavedLocation> {
        coordinate.validate()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(WeatherError::invalid("location name is empty"));
        }

        let bucket = self.grid.bucket(&coordinate);
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO saved_locations
            (cells, lat_idx, lon_idx, name, country, latitude, longitude, last_accessed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (cells, lat_idx, lon_idx) DO UPDATE SET
                name = excluded.name,
                country = excluded.country,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                last_accessed = excluded.last_accessed
            "#,
            params![
                bucket.cells_per_degree,
                bucket.lat_index,
                bucket.lon_index,
                name,
                country,
                coordinate.latitude,
                coordinate.longitude,
                now.timestamp_millis(),
            ],
        )?;

        let saved = conn.query_row(
            &format!(
                "SELECT {} FROM saved_locations WHERE cells = ?1 AND lat_idx = ?2 AND lon_idx = ?3",
                LOCATION_COLUMNS
            ),
            params![bucket.cells_per_degree, bucket.lat_index, bucket.lon_index],
            Self::row_to_location,
        )?;
        Ok(saved)
    }

    /// Save a geocoding search result.
    pub fn save_place(&self, place: &PlaceMatch, now: DateTime<Utc>) -> WeatherResult<SavedLocation> {
        self.save(&place.name, place.country.as_deref(), place.coordinate, now)
    }

    pub fn get(&self, id: i64) -> WeatherResult<Option<SavedLocation>> {
        let location = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {} FROM saved_locations WHERE id = ?1", LOCATION_COLUMNS),
                params![id],
                Self::row_to_location,
            )
            .optional()?;
        Ok(location)
    }

    /// Most recently accessed first.
    pub fn recent(&self, limit: usize) -> WeatherResult<Vec<SavedLocation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM saved_locations ORDER BY last_accessed DESC, id DESC LIMIT ?1",
            LOCATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_location)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn most_recent(&self) -> WeatherResult<Option<SavedLocation>> {
        Ok(self.recent(1)?.into_iter().next())
    }

    /// Favorites ordered by name.
    pub fn favorites(&self) -> WeatherResult<Vec<SavedLocation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM saved_locations WHERE is_favorite = 1 ORDER BY name COLLATE NOCASE ASC",
            LOCATION_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::row_to_location)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Flip the favorite flag. Returns the new state, or `None` if the id is unknown.
    pub fn toggle_favorite(&self, id: i64) -> WeatherResult<Option<bool>> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE saved_locations SET is_favorite = 1 - is_favorite WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let favorite: i32 = conn.query_row(
            "SELECT is_favorite FROM saved_locations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(Some(favorite != 0))
    }

    /// Mark a location as just viewed.
    pub fn touch(&self, id: i64, now: DateTime<Utc>) -> WeatherResult<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE saved_locations SET last_accessed = ?1 WHERE id = ?2",
            params![now.timestamp_millis(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(&self, id: i64) -> WeatherResult<bool> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM saved_locations WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn clear(&self) -> WeatherResult<()> {
        self.conn.lock().execute("DELETE FROM saved_locations", [])?;
        Ok(())
    }

    fn row_to_location(row: &rusqlite::Row) -> rusqlite::Result<SavedLocation> {
        Ok(SavedLocation {
            id: row.get(0)?,
            name: row.get(1)?,
            country: row.get(2)?,
            coordinate: Coordinate {
                latitude: row.get(3)?,
                longitude: row.get(4)?,
            },
            last_accessed: DateTime::from_timestamp_millis(row.get(5)?).unwrap_or_default(),
            is_favorite: row.get::<_, i32>(6)? != 0,
        })
    }
}

/// Reports the most recently viewed saved location as the current one.
#[derive(Clone)]
pub struct SavedLocationProvider {
    store: Arc<SavedLocationStore>,
}

impl SavedLocationProvider {
    pub fn new(store: Arc<SavedLocationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LocationProvider for SavedLocationProvider {
    async fn current_location(&self) -> WeatherResult<Coordinate> {
        let store = Arc::clone(&self.store);
        let latest = tokio::task::spawn_blocking(move || store.most_recent()).await??;
        latest
            .map(|location| location.coordinate)
            .ok_or_else(|| WeatherError::LocationUnavailable("no saved location".into()))
    }
}
