//! SQLite-backed local cache of weather records.
//!
//! One row per `(grid, bucket, horizon)`. Writes are last-fetched-wins: an
//! upsert only replaces a row when its `fetched_at` is strictly newer, and the
//! comparison happens inside the same SQL statement as the write so two
//! refreshes finishing out of order cannot clobber each other.
//!
//! Hourly forecasts live in their own tables, one forecast per bucket with its
//! steps stored as rows, under the same last-fetched-wins rule.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::bucket::{CacheKey, CoordinateBucket, GridResolution};
use crate::error::WeatherResult;
use crate::types::{Coordinate, HourlyForecast, HourlyPoint, Units, WeatherRecord, Wind};

/// Current on-disk layout. Version 1 lacked `feels_like` and `pressure`.
pub const SCHEMA_VERSION: u32 = 2;

pub const DEFAULT_CURRENT_TTL_SECS: u64 = 15 * 60;
pub const DEFAULT_FORECAST_TTL_SECS: u64 = 6 * 60 * 60;
pub const DEFAULT_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Which TTL applies to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TtlPolicy {
    Current,
    Forecast,
}

impl TtlPolicy {
    pub fn for_horizon(horizon: u32) -> Self {
        if horizon == 0 {
            Self::Current
        } else {
            Self::Forecast
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Forecast => "forecast",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "current" => Self::Current,
            _ => Self::Forecast,
        }
    }
}

/// TTLs per policy plus the long-stop age past which entries are purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlConfig {
    pub current: Duration,
    pub forecast: Duration,
    pub max_age: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            current: Duration::from_secs(DEFAULT_CURRENT_TTL_SECS),
            forecast: Duration::from_secs(DEFAULT_FORECAST_TTL_SECS),
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
        }
    }
}

impl TtlConfig {
    pub fn ttl(&self, policy: TtlPolicy) -> Duration {
        match policy {
            TtlPolicy::Current => self.current,
            TtlPolicy::Forecast => self.forecast,
        }
    }

    /// `now - fetched_at < ttl(policy)`
    pub fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        age_ms(entry.fetched_at, now) < duration_ms(self.ttl(entry.ttl_policy))
    }

    /// Past the long-stop age regardless of policy.
    pub fn is_expired(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        age_ms(fetched_at, now) >= duration_ms(self.max_age)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis().saturating_sub(duration_ms(self.max_age))
    }
}

fn age_ms(fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    now.timestamp_millis().saturating_sub(fetched_at.timestamp_millis())
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// A cached record. Handed out by value; the store keeps the only durable copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub record: WeatherRecord,
    pub fetched_at: DateTime<Utc>,
    pub ttl_policy: TtlPolicy,
    /// Layout version the row was written under
    pub schema_version: u32,
}

/// A cached hourly forecast. Judged against the current-conditions TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyEntry {
    pub bucket: CoordinateBucket,
    pub forecast: HourlyForecast,
    pub fetched_at: DateTime<Utc>,
}

/// Result of a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// The store already held an entry fetched at or after this one
    Superseded,
}

/// Storage seam used by the repository and the reconciler.
///
/// Methods are blocking; async callers run them on the blocking pool.
pub trait CacheStore: Send + Sync {
    /// Newest entry for the key, or `None`. Entries past the long-stop age
    /// are purged here and reported as a miss.
    fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> WeatherResult<Option<CacheEntry>>;

    fn put(
        &self,
        key: &CacheKey,
        record: &WeatherRecord,
        policy: TtlPolicy,
        fetched_at: DateTime<Utc>,
    ) -> WeatherResult<PutOutcome>;

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool;

    /// Drop everything past the long-stop age. Returns the number of cache
    /// rows removed.
    fn sweep(&self, now: DateTime<Utc>) -> WeatherResult<usize>;

    /// Every record written for the key since `since`, oldest first.
    fn history(&self, key: &CacheKey, since: DateTime<Utc>) -> WeatherResult<Vec<CacheEntry>>;

    /// Hourly forecast for the bucket, purged and reported as a miss past
    /// the long-stop age.
    fn get_hourly(
        &self,
        bucket: &CoordinateBucket,
        now: DateTime<Utc>,
    ) -> WeatherResult<Option<HourlyEntry>>;

    /// Replace the bucket's hourly forecast when `fetched_at` is newer than
    /// the stored one.
    fn put_hourly(
        &self,
        bucket: &CoordinateBucket,
        forecast: &HourlyForecast,
        fetched_at: DateTime<Utc>,
    ) -> WeatherResult<PutOutcome>;

    fn is_hourly_fresh(&self, entry: &HourlyEntry, now: DateTime<Utc>) -> bool;
}

/// SQLite cache.
pub struct SqliteCache {
    conn: Mutex<Connection>,
    ttl: TtlConfig,
}

const ENTRY_COLUMNS: &str = "cells, lat_idx, lon_idx, horizon, latitude, longitude, observed_at, \
     temperature, humidity, wind_speed, wind_deg, condition_code, description, place_name, \
     units, version, fetched_at, ttl_policy, schema_version, feels_like, pressure";

impl SqliteCache {
    /// Open (or create) the cache at the given path.
    pub fn open<P: AsRef<Path>>(path: P, ttl: TtlConfig) -> WeatherResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, ttl)
    }

    /// In-memory cache (for testing).
    pub fn in_memory(ttl: TtlConfig) -> WeatherResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, ttl)
    }

    fn with_connection(conn: Connection, ttl: TtlConfig) -> WeatherResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    pub fn ttl_config(&self) -> TtlConfig {
        self.ttl
    }

    /// Number of cached keys.
    pub fn len(&self) -> WeatherResult<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> WeatherResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Clear all cached data.
    pub fn clear(&self) -> WeatherResult<()> {
        self.conn
            .lock()
            .execute_batch(
                "DELETE FROM cache_entries; DELETE FROM observations; \
                 DELETE FROM hourly_points; DELETE FROM hourly_forecasts;",
            )?;
        Ok(())
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<CacheEntry> {
        let cells: u32 = row.get(0)?;
        let bucket = CoordinateBucket::new(row.get(1)?, row.get(2)?, GridResolution::new(cells));
        let horizon: u32 = row.get(3)?;
        let units: String = row.get(14)?;
        let ttl_policy: String = row.get(17)?;

        let record = WeatherRecord {
            coordinate: Coordinate {
                latitude: row.get(4)?,
                longitude: row.get(5)?,
            },
            observed_at: from_millis(row.get(6)?),
            temperature: row.get(7)?,
            humidity: row.get(8)?,
            wind: Wind {
                speed: row.get(9)?,
                direction: row.get(10)?,
            },
            condition_code: row.get(11)?,
            description: row.get(12)?,
            place_name: row.get(13)?,
            horizon,
            units: Units::parse(&units),
            version: row.get(15)?,
            feels_like: row.get(19)?,
            pressure: row.get(20)?,
        };

        Ok(CacheEntry {
            key: CacheKey::new(bucket, horizon),
            record,
            fetched_at: from_millis(row.get(16)?),
            ttl_policy: TtlPolicy::parse(&ttl_policy),
            schema_version: row.get(18)?,
        })
    }

    fn row_to_point(row: &rusqlite::Row) -> rusqlite::Result<HourlyPoint> {
        Ok(HourlyPoint {
            at: from_millis(row.get(0)?),
            temperature: row.get(1)?,
            feels_like: row.get(2)?,
            humidity: row.get(3)?,
            pressure: row.get(4)?,
            wind: Wind {
                speed: row.get(5)?,
                direction: row.get(6)?,
            },
            condition_code: row.get(7)?,
            description: row.get(8)?,
            precipitation_chance: row.get(9)?,
            rain_mm: row.get(10)?,
        })
    }
}

const POINT_COLUMNS: &str = "at, temperature, feels_like, humidity, pressure, wind_speed, wind_deg, \
     condition_code, description, precipitation_chance, rain_mm";

fn delete_hourly(conn: &Connection, bucket: &CoordinateBucket) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM hourly_points WHERE cells = ?1 AND lat_idx = ?2 AND lon_idx = ?3",
        params![bucket.cells_per_degree, bucket.lat_index, bucket.lon_index],
    )?;
    conn.execute(
        "DELETE FROM hourly_forecasts WHERE cells = ?1 AND lat_idx = ?2 AND lon_idx = ?3",
        params![bucket.cells_per_degree, bucket.lat_index, bucket.lon_index],
    )?;
    Ok(())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Create tables and bring older layouts up to [`SCHEMA_VERSION`].
fn init_schema(conn: &Connection) -> WeatherResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            cells INTEGER NOT NULL,
            lat_idx INTEGER NOT NULL,
            lon_idx INTEGER NOT NULL,
            horizon INTEGER NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            observed_at INTEGER NOT NULL,
            temperature REAL NOT NULL,
            humidity INTEGER NOT NULL,
            wind_speed REAL NOT NULL,
            wind_deg INTEGER,
            condition_code INTEGER NOT NULL,
            description TEXT,
            place_name TEXT,
            units TEXT NOT NULL,
            version TEXT NOT NULL,
            fetched_at INTEGER NOT NULL,
            ttl_policy TEXT NOT NULL,
            schema_version INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (cells, lat_idx, lon_idx, horizon)
        );

        CREATE TABLE IF NOT EXISTS observations (
            cells INTEGER NOT NULL,
            lat_idx INTEGER NOT NULL,
            lon_idx INTEGER NOT NULL,
            horizon INTEGER NOT NULL,
            fetched_at INTEGER NOT NULL,
            ttl_policy TEXT NOT NULL,
            record_json TEXT NOT NULL,
            PRIMARY KEY (cells, lat_idx, lon_idx, horizon, fetched_at)
        );

        CREATE TABLE IF NOT EXISTS hourly_forecasts (
            cells INTEGER NOT NULL,
            lat_idx INTEGER NOT NULL,
            lon_idx INTEGER NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            place_name TEXT,
            units TEXT NOT NULL,
            version TEXT NOT NULL,
            fetched_at INTEGER NOT NULL,
            PRIMARY KEY (cells, lat_idx, lon_idx)
        );

        CREATE TABLE IF NOT EXISTS hourly_points (
            cells INTEGER NOT NULL,
            lat_idx INTEGER NOT NULL,
            lon_idx INTEGER NOT NULL,
            at INTEGER NOT NULL,
            temperature REAL NOT NULL,
            feels_like REAL,
            humidity INTEGER NOT NULL,
            pressure INTEGER,
            wind_speed REAL NOT NULL,
            wind_deg INTEGER,
            condition_code INTEGER NOT NULL,
            description TEXT,
            precipitation_chance INTEGER NOT NULL,
            rain_mm REAL,
            PRIMARY KEY (cells, lat_idx, lon_idx, at)
        );

        CREATE INDEX IF NOT EXISTS idx_cache_fetched ON cache_entries(fetched_at);
        CREATE INDEX IF NOT EXISTS idx_observations_fetched ON observations(fetched_at);
        "#,
    )?;

    let columns: Vec<String> = conn
        .prepare("PRAGMA table_info(cache_entries)")?
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;

    // Version 1 rows keep schema_version = 1 and read back with the new fields empty.
    for (column, ddl) in [
        ("feels_like", "ALTER TABLE cache_entries ADD COLUMN feels_like REAL"),
        ("pressure", "ALTER TABLE cache_entries ADD COLUMN pressure INTEGER"),
    ] {
        if !columns.iter().any(|c| c == column) {
            tracing::info!("Migrating cache schema: adding column {}", column);
            conn.execute(ddl, [])?;
        }
    }

    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
    }

    Ok(())
}

impl CacheStore for SqliteCache {
    fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> WeatherResult<Option<CacheEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM cache_entries \
                     WHERE cells = ?1 AND lat_idx = ?2 AND lon_idx = ?3 AND horizon = ?4",
                    ENTRY_COLUMNS
                ),
                params![
                    key.bucket.cells_per_degree,
                    key.bucket.lat_index,
                    key.bucket.lon_index,
                    key.horizon
                ],
                Self::row_to_entry,
            )
            .optional()?;

        match entry {
            Some(entry) if self.ttl.is_expired(entry.fetched_at, now) => {
                tracing::debug!("Purging expired cache entry {}", key);
                conn.execute(
                    "DELETE FROM cache_entries \
                     WHERE cells = ?1 AND lat_idx = ?2 AND lon_idx = ?3 AND horizon = ?4 \
                     AND fetched_at = ?5",
                    params![
                        key.bucket.cells_per_degree,
                        key.bucket.lat_index,
                        key.bucket.lon_index,
                        key.horizon,
                        entry.fetched_at.timestamp_millis()
                    ],
                )?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn put(
        &self,
        key: &CacheKey,
        record: &WeatherRecord,
        policy: TtlPolicy,
        fetched_at: DateTime<Utc>,
    ) -> WeatherResult<PutOutcome> {
        let record_json = serde_json::to_string(record)?;
        let fetched_ms = fetched_at.timestamp_millis();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            &format!(
                r#"
                INSERT INTO cache_entries ({})
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
                ON CONFLICT (cells, lat_idx, lon_idx, horizon) DO UPDATE SET
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    observed_at = excluded.observed_at,
                    temperature = excluded.temperature,
                    humidity = excluded.humidity,
                    wind_speed = excluded.wind_speed,
                    wind_deg = excluded.wind_deg,
                    condition_code = excluded.condition_code,
                    description = excluded.description,
                    place_name = excluded.place_name,
                    units = excluded.units,
                    version = excluded.version,
                    fetched_at = excluded.fetched_at,
                    ttl_policy = excluded.ttl_policy,
                    schema_version = excluded.schema_version,
                    feels_like = excluded.feels_like,
                    pressure = excluded.pressure
                WHERE excluded.fetched_at > cache_entries.fetched_at
                "#,
                ENTRY_COLUMNS
            ),
            params![
                key.bucket.cells_per_degree,
                key.bucket.lat_index,
                key.bucket.lon_index,
                key.horizon,
                record.coordinate.latitude,
                record.coordinate.longitude,
                record.observed_at.timestamp_millis(),
                record.temperature,
                record.humidity,
                record.wind.speed,
                record.wind.direction,
                record.condition_code,
                record.description,
                record.place_name,
                record.units.as_query(),
                record.version,
                fetched_ms,
                policy.as_str(),
                SCHEMA_VERSION,
                record.feels_like,
                record.pressure,
            ],
        )?;

        if changed == 0 {
            tracing::debug!("Cache put for {} superseded by a newer fetch", key);
            return Ok(PutOutcome::Superseded);
        }

        tx.execute(
            "INSERT OR IGNORE INTO observations \
             (cells, lat_idx, lon_idx, horizon, fetched_at, ttl_policy, record_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key.bucket.cells_per_degree,
                key.bucket.lat_index,
                key.bucket.lon_index,
                key.horizon,
                fetched_ms,
                policy.as_str(),
                record_json,
            ],
        )?;
        tx.commit()?;

        Ok(PutOutcome::Written)
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        self.ttl.is_fresh(entry, now)
    }

    fn sweep(&self, now: DateTime<Utc>) -> WeatherResult<usize> {
        let cutoff = self.ttl.cutoff(now);
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE fetched_at <= ?1",
            params![cutoff],
        )?;
        let history = conn.execute(
            "DELETE FROM observations WHERE fetched_at <= ?1",
            params![cutoff],
        )?;
        let hourly = conn.execute(
            "DELETE FROM hourly_forecasts WHERE fetched_at <= ?1",
            params![cutoff],
        )?;
        conn.execute(
            "DELETE FROM hourly_points WHERE NOT EXISTS (\
                SELECT 1 FROM hourly_forecasts f \
                WHERE f.cells = hourly_points.cells AND f.lat_idx = hourly_points.lat_idx \
                AND f.lon_idx = hourly_points.lon_idx)",
            [],
        )?;

        if removed > 0 || history > 0 || hourly > 0 {
            tracing::info!(
                "Cache sweep removed {} entries, {} history rows and {} hourly forecasts",
                removed,
                history,
                hourly
            );
        }
        Ok(removed)
    }

    fn history(&self, key: &CacheKey, since: DateTime<Utc>) -> WeatherResult<Vec<CacheEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT fetched_at, ttl_policy, record_json
            FROM observations
            WHERE cells = ?1 AND lat_idx = ?2 AND lon_idx = ?3 AND horizon = ?4 AND fetched_at >= ?5
            ORDER BY fetched_at ASC
            "#,
        )?;

        let rows = stmt.query_map(
            params![
                key.bucket.cells_per_degree,
                key.bucket.lat_index,
                key.bucket.lon_index,
                key.horizon,
                since.timestamp_millis()
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (fetched_at, policy, json) = row?;
            let record: WeatherRecord = match serde_json::from_str(&json) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("Skipping unreadable history row for {}: {}", key, e);
                    continue;
                }
            };
            entries.push(CacheEntry {
                key: *key,
                record,
                fetched_at: from_millis(fetched_at),
                ttl_policy: TtlPolicy::parse(&policy),
                schema_version: SCHEMA_VERSION,
            });
        }
        Ok(entries)
    }

    fn get_hourly(
        &self,
        bucket: &CoordinateBucket,
        now: DateTime<Utc>,
    ) -> WeatherResult<Option<HourlyEntry>> {
        let conn = self.conn.lock();
        let header = conn
            .query_row(
                "SELECT latitude, longitude, place_name, units, version, fetched_at \
                 FROM hourly_forecasts WHERE cells = ?1 AND lat_idx = ?2 AND lon_idx = ?3",
                params![bucket.cells_per_degree, bucket.lat_index, bucket.lon_index],
                |row| {
                    Ok((
                        Coordinate {
                            latitude: row.get(0)?,
                            longitude: row.get(1)?,
                        },
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        from_millis(row.get(5)?),
                    ))
                },
            )
            .optional()?;

        let Some((coordinate, place_name, units, version, fetched_at)) = header else {
            return Ok(None);
        };
        if self.ttl.is_expired(fetched_at, now) {
            tracing::debug!("Purging expired hourly forecast {}", bucket);
            delete_hourly(&conn, bucket)?;
            return Ok(None);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM hourly_points \
             WHERE cells = ?1 AND lat_idx = ?2 AND lon_idx = ?3 ORDER BY at ASC",
            POINT_COLUMNS
        ))?;
        let points = stmt
            .query_map(
                params![bucket.cells_per_degree, bucket.lat_index, bucket.lon_index],
                Self::row_to_point,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(HourlyEntry {
            bucket: *bucket,
            forecast: HourlyForecast {
                coordinate,
                place_name,
                units: Units::parse(&units),
                version,
                points,
            },
            fetched_at,
        }))
    }

    fn put_hourly(
        &self,
        bucket: &CoordinateBucket,
        forecast: &HourlyForecast,
        fetched_at: DateTime<Utc>,
    ) -> WeatherResult<PutOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            r#"
            INSERT INTO hourly_forecasts
                (cells, lat_idx, lon_idx, latitude, longitude, place_name, units, version, fetched_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (cells, lat_idx, lon_idx) DO UPDATE SET
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                place_name = excluded.place_name,
                units = excluded.units,
                version = excluded.version,
                fetched_at = excluded.fetched_at
            WHERE excluded.fetched_at > hourly_forecasts.fetched_at
            "#,
            params![
                bucket.cells_per_degree,
                bucket.lat_index,
                bucket.lon_index,
                forecast.coordinate.latitude,
                forecast.coordinate.longitude,
                forecast.place_name,
                forecast.units.as_query(),
                forecast.version,
                fetched_at.timestamp_millis(),
            ],
        )?;

        if changed == 0 {
            tracing::debug!("Hourly put for {} superseded by a newer fetch", bucket);
            return Ok(PutOutcome::Superseded);
        }

        tx.execute(
            "DELETE FROM hourly_points WHERE cells = ?1 AND lat_idx = ?2 AND lon_idx = ?3",
            params![bucket.cells_per_degree, bucket.lat_index, bucket.lon_index],
        )?;
        {
            let mut insert = tx.prepare(&format!(
                "INSERT OR REPLACE INTO hourly_points (cells, lat_idx, lon_idx, {}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                POINT_COLUMNS
            ))?;
            for point in &forecast.points {
                insert.execute(params![
                    bucket.cells_per_degree,
                    bucket.lat_index,
                    bucket.lon_index,
                    point.at.timestamp_millis(),
                    point.temperature,
                    point.feels_like,
                    point.humidity,
                    point.pressure,
                    point.wind.speed,
                    point.wind.direction,
                    point.condition_code,
                    point.description,
                    point.precipitation_chance,
                    point.rain_mm,
                ])?;
            }
        }
        tx.commit()?;

        Ok(PutOutcome::Written)
    }

    fn is_hourly_fresh(&self, entry: &HourlyEntry, now: DateTime<Utc>) -> bool {
        age_ms(entry.fetched_at, now) < duration_ms(self.ttl.current)
    }
}
