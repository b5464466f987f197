//! Binary crate for the `meteo` command-line tool.

use clap::Parser;
use meteo_core::{App, AppError};
use meteo_weather::WeatherError;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = cli::Cli::parse();
    meteo_core::init()?;

    let mut app = App::load().map_err(|e| {
        eprintln!("{}", e.user_message());
        e
    })?;
    app.initialize();

    let result = cmd.run(&app).await;
    app.shutdown().await;

    if let Err(e) = &result {
        if let Some(message) = user_message(e) {
            eprintln!("{}", message);
        }
    }
    result
}

fn user_message(error: &anyhow::Error) -> Option<&'static str> {
    if let Some(e) = error.downcast_ref::<AppError>() {
        return Some(e.user_message());
    }
    error.downcast_ref::<WeatherError>().map(WeatherError::user_message)
}
