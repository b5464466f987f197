use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use meteo_core::App;
use meteo_weather::{
    Coordinate, FetchPolicy, Freshness, HourlyReading, SavedLocation, Units, WeatherReading,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "meteo", version, about = "Cached weather lookups")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// An optional explicit coordinate. Without one the configured or most
/// recently used location is used.
#[derive(Debug, Args)]
pub struct Place {
    #[arg(long, allow_hyphen_values = true, requires = "lon")]
    pub lat: Option<f64>,

    #[arg(long, allow_hyphen_values = true, requires = "lat")]
    pub lon: Option<f64>,
}

impl Place {
    fn coordinate(&self) -> anyhow::Result<Option<Coordinate>> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Ok(Some(Coordinate::new(lat, lon)?)),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show current conditions.
    Current {
        #[command(flatten)]
        place: Place,

        /// Look the place up by name instead, e.g. "Paris,FR". The place is saved.
        #[arg(long, conflicts_with_all = ["lat", "lon"])]
        city: Option<String>,

        /// Return cached data immediately and refresh in the background.
        #[arg(long)]
        stale: bool,
    },

    /// Show the daily forecast.
    Forecast {
        #[command(flatten)]
        place: Place,

        /// Number of days, today included.
        #[arg(long, default_value_t = 5)]
        days: u32,

        #[arg(long)]
        stale: bool,
    },

    /// Show the 3-hour forecast.
    Hourly {
        #[command(flatten)]
        place: Place,

        /// Number of 3-hour steps to show.
        #[arg(long, default_value_t = 8)]
        steps: usize,

        #[arg(long)]
        stale: bool,
    },

    /// List past fetches for a location.
    History {
        #[command(flatten)]
        place: Place,

        /// Days ahead; 0 is current conditions.
        #[arg(long, default_value_t = 0)]
        horizon: u32,

        /// How far back to look.
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Search places by name.
    Search {
        query: String,

        #[arg(long, default_value_t = 5)]
        limit: u32,

        /// Save the n-th result (1-based) to the location list.
        #[arg(long)]
        save: Option<usize>,
    },

    /// List saved locations, most recent first.
    Locations {
        #[arg(long)]
        favorites: bool,
    },

    /// Toggle the favorite flag of a saved location.
    Favorite { id: i64 },

    /// Remove a saved location.
    Forget { id: i64 },

    /// Pull the backend's copies for a location, then run every due sync task.
    Sync {
        #[command(flatten)]
        place: Place,

        /// Days to pull, today included; 0 only pushes.
        #[arg(long, default_value_t = 1)]
        pull: u32,
    },

    /// List sync tasks that ran out of attempts.
    DeadLetters {
        /// Put the task with this id back in the queue.
        #[arg(long)]
        retry: Option<i64>,
    },
}

impl Cli {
    pub async fn run(self, app: &App) -> anyhow::Result<()> {
        let repo = app.repository();

        match self.command {
            Command::Current { place, city, stale } => {
                let reading = match (city, place.coordinate()?) {
                    (Some(city), _) => {
                        let reading = repo.current_weather_by_city(&city).await?;
                        let name = reading.record.place_name.as_deref().unwrap_or(&city);
                        app.locations()
                            .save(name, None, reading.record.coordinate, Utc::now())?;
                        reading
                    }
                    (None, Some(coordinate)) => repo.get_weather(coordinate, 0, policy(stale)).await?,
                    (None, None) => repo.current_weather(policy(stale)).await?,
                };
                print_reading(&reading);
            }
            Command::Hourly { place, steps, stale } => {
                let coordinate = resolve(app, &place)?;
                let reading = repo.hourly_forecast(coordinate, policy(stale)).await?;
                print_hourly(&reading, steps);
            }
            Command::Forecast { place, days, stale } => {
                let coordinate = resolve(app, &place)?;
                for reading in repo.forecast(coordinate, days, policy(stale)).await? {
                    print_reading(&reading);
                }
            }
            Command::History { place, horizon, hours } => {
                let coordinate = resolve(app, &place)?;
                let since = history_since(Utc::now(), hours)?;
                let points = repo.history(coordinate, horizon, since).await?;
                if points.is_empty() {
                    println!("No history in the last {} hours", hours);
                }
                for point in points {
                    println!(
                        "{}  {:>6.1}{}  {:>3}%  {}",
                        point.fetched_at.format("%Y-%m-%d %H:%M"),
                        point.record.temperature,
                        unit_symbol(point.record.units),
                        point.record.humidity,
                        point.record.condition().description()
                    );
                }
            }
            Command::Search { query, limit, save } => {
                let places = app.weather_client().search_locations(&query, limit).await?;
                if places.is_empty() {
                    println!("No places match \"{}\"", query);
                }
                for (i, place) in places.iter().enumerate() {
                    println!(
                        "{:>2}. {} ({:.4}, {:.4})",
                        i + 1,
                        place.display_name(),
                        place.coordinate.latitude,
                        place.coordinate.longitude
                    );
                }
                if let Some(n) = save {
                    let place = n
                        .checked_sub(1)
                        .and_then(|i| places.get(i))
                        .with_context(|| format!("no result number {}", n))?;
                    let saved = app.locations().save_place(place, Utc::now())?;
                    println!("Saved as location {}", saved.id);
                }
            }
            Command::Locations { favorites } => {
                let locations = if favorites {
                    app.locations().favorites()?
                } else {
                    app.locations().recent(meteo_weather::locations::DEFAULT_RECENT_LIMIT)?
                };
                if locations.is_empty() {
                    println!("No saved locations");
                }
                for location in &locations {
                    print_location(location);
                }
            }
            Command::Favorite { id } => match app.locations().toggle_favorite(id)? {
                Some(true) => println!("Location {} marked as favorite", id),
                Some(false) => println!("Location {} is no longer a favorite", id),
                None => bail!("no saved location with id {}", id),
            },
            Command::Forget { id } => {
                if !app.locations().delete(id)? {
                    bail!("no saved location with id {}", id);
                }
                println!("Location {} removed", id);
            }
            Command::Sync { place, pull } => {
                if pull > 0 {
                    match locate(app, &place)? {
                        Some(coordinate) => {
                            let queued = app.request_pull(coordinate, pull).await?;
                            println!("Queued {} downloads", queued);
                        }
                        None => println!("No location to pull for; pushing only"),
                    }
                }
                let handled = app.sync_now().await?;
                println!("Processed {} sync tasks", handled);
            }
            Command::DeadLetters { retry } => {
                let Some(reconciler) = app.reconciler() else {
                    bail!("sync is not enabled");
                };
                if let Some(id) = retry {
                    if !reconciler.retry_dead_letter(id).await? {
                        bail!("no dead-lettered task with id {}", id);
                    }
                    println!("Task {} requeued", id);
                    return Ok(());
                }
                let tasks = reconciler.list_dead_letters().await?;
                if tasks.is_empty() {
                    println!("No dead-lettered tasks");
                }
                for task in tasks {
                    println!(
                        "{:>4}  {:<8} {}  attempts={}  {}",
                        task.id,
                        task.operation.as_str(),
                        task.key,
                        task.attempts,
                        task.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        Ok(())
    }
}

fn policy(stale: bool) -> FetchPolicy {
    if stale {
        FetchPolicy::stale_while_revalidate()
    } else {
        FetchPolicy::fresh_only()
    }
}

/// Explicit coordinate, else the configured one, else the last used saved location.
fn locate(app: &App, place: &Place) -> anyhow::Result<Option<Coordinate>> {
    if let Some(coordinate) = place.coordinate()? {
        return Ok(Some(coordinate));
    }
    if let Some(coordinate) = app.config().location.coordinate() {
        return Ok(Some(coordinate));
    }
    Ok(app.locations().most_recent()?.map(|saved| saved.coordinate))
}

fn resolve(app: &App, place: &Place) -> anyhow::Result<Coordinate> {
    locate(app, place)?.context("no location given and none saved; pass --lat and --lon")
}

/// Start of a `--hours` look-back window ending at `now`.
fn history_since(now: DateTime<Utc>, hours: i64) -> anyhow::Result<DateTime<Utc>> {
    chrono::Duration::try_hours(hours.max(0))
        .and_then(|span| now.checked_sub_signed(span))
        .with_context(|| format!("--hours {} is out of range", hours))
}

fn unit_symbol(units: Units) -> &'static str {
    match units {
        Units::Metric => "°C",
        Units::Imperial => "°F",
    }
}

fn print_reading(reading: &WeatherReading) {
    let record = &reading.record;
    let label = match record.horizon {
        0 => "Now".to_string(),
        1 => "Tomorrow".to_string(),
        n => format!("+{} days", n),
    };
    let place = record.place_name.as_deref().unwrap_or("");

    println!(
        "{:<9} {:>6.1}{}  {:>3}%  wind {:.1}  {}  {}",
        label,
        record.temperature,
        unit_symbol(record.units),
        record.humidity,
        record.wind.speed,
        record.description.as_deref().unwrap_or(record.condition().description()),
        place
    );

    print_freshness(&reading.freshness, reading.fetched_at);
}

fn print_hourly(reading: &HourlyReading, steps: usize) {
    let forecast = &reading.forecast;
    if let Some(place) = &forecast.place_name {
        println!("{}", place);
    }
    for point in forecast.points.iter().take(steps) {
        let rain = point
            .rain_mm
            .map(|mm| format!("  {:.1} mm", mm))
            .unwrap_or_default();
        println!(
            "{}  {:>6.1}{}  {:>3}%  rain {:>3}%{}  {}",
            point.at.format("%a %H:%M"),
            point.temperature,
            unit_symbol(forecast.units),
            point.humidity,
            point.precipitation_chance,
            rain,
            point.description.as_deref().unwrap_or(point.condition().description())
        );
    }
    print_freshness(&reading.freshness, reading.fetched_at);
}

fn print_freshness(freshness: &Freshness, fetched_at: DateTime<Utc>) {
    match freshness {
        Freshness::Fresh => {}
        Freshness::Stale => println!("          (cached {}, refreshing)", fetched_at.format("%H:%M")),
        Freshness::Degraded { reason } => println!(
            "          (data may be outdated, fetched {}: {})",
            fetched_at.format("%Y-%m-%d %H:%M"),
            reason
        ),
    }
}

fn print_location(location: &SavedLocation) {
    println!(
        "{:>4} {} {}  ({:.4}, {:.4})  last used {}",
        location.id,
        if location.is_favorite { "*" } else { " " },
        location.display_name(),
        location.coordinate.latitude,
        location.coordinate.longitude,
        location.last_accessed.format("%Y-%m-%d %H:%M")
    );
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_history_since() {
        assert_eq!(history_since(now(), 24).unwrap(), now() - chrono::Duration::hours(24));
        assert_eq!(history_since(now(), -5).unwrap(), now());
    }

    #[test]
    fn test_history_since_out_of_range() {
        assert!(history_since(now(), 9_999_999_999_999).is_err());
        assert!(history_since(now(), i64::MAX).is_err());
    }

    #[test]
    fn test_city_conflicts_with_coordinates() {
        assert!(Cli::try_parse_from(["meteo", "current", "--city", "Paris", "--lat", "1", "--lon", "2"])
            .is_err());

        let cli = Cli::try_parse_from(["meteo", "current", "--city", "Paris,FR"]).unwrap();
        match cli.command {
            Command::Current { city, .. } => assert_eq!(city.as_deref(), Some("Paris,FR")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_sync_with_pull() {
        let cli = Cli::try_parse_from(["meteo", "sync", "--pull", "3", "--lat", "51.5", "--lon", "-0.12"])
            .unwrap();
        match cli.command {
            Command::Sync { place, pull } => {
                assert_eq!(pull, 3);
                assert_eq!(place.lat, Some(51.5));
                assert_eq!(place.lon, Some(-0.12));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
