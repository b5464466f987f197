//! Weather pipeline error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the acquisition and caching pipeline.
#[derive(Debug, Clone, Error)]
pub enum WeatherError {
    #[error("Location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transient transport or 5xx failure. Retried before it is surfaced.
    #[error("Network error: {0}")]
    Network(String),

    /// 4xx response (bad request, auth, rate limit). Never retried.
    #[error("Client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Malformed payload: {0}")]
    DataFormat(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Sync conflict on {key}: remote version is newer")]
    SyncConflict { key: String },

    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Request cancelled")]
    Cancelled,
}

/// Result alias used throughout the crate.
pub type WeatherResult<T> = Result<T, WeatherError>;

impl WeatherError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn data_format(message: impl Into<String>) -> Self {
        Self::DataFormat(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Whether the retry policy may attempt the operation again.
    ///
    /// Only transient network failures qualify. A malformed payload will
    /// recur on every attempt and 4xx responses are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// True for HTTP 429 responses.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Client { status: 429, .. })
    }

    /// User-friendly error message for UI display.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::LocationUnavailable(_) => {
                "Your location is unavailable. Pick a place or enable location services."
            }
            Self::InvalidInput(_) => "That location or forecast day is not valid.",
            Self::Network(_) => "Unable to reach the weather service. Check your connection.",
            Self::Client { status: 401, .. } | Self::Client { status: 403, .. } => {
                "Weather API key is invalid. Check settings."
            }
            Self::Client { status: 429, .. } => {
                "Too many weather requests. Please wait a moment."
            }
            Self::Client { .. } => "The weather service rejected the request.",
            Self::DataFormat(_) => "Received unexpected weather data. Please try again later.",
            Self::Storage(_) => "Local weather data could not be accessed.",
            Self::SyncConflict { .. } => "Weather data was updated from another device.",
            Self::DeadlineExceeded(_) => "The weather request took too long. Please try again.",
            Self::Cancelled => "The weather request was cancelled.",
        }
    }
}

impl From<reqwest::Error> for WeatherError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return Self::DataFormat(error.to_string());
        }
        if let Some(status) = error.status() {
            if status.is_client_error() {
                return Self::Client {
                    status: status.as_u16(),
                    message: error.to_string(),
                };
            }
        }
        // Timeouts, connection resets, refused connections and 5xx all land here.
        Self::Network(error.to_string())
    }
}

impl From<rusqlite::Error> for WeatherError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for WeatherError {
    fn from(error: serde_json::Error) -> Self {
        Self::DataFormat(error.to_string())
    }
}

impl From<tokio::task::JoinError> for WeatherError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::Storage(format!("blocking task failed: {}", error))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(WeatherError::network("reset").is_retryable());
        assert!(!WeatherError::data_format("missing temp").is_retryable());
        assert!(!WeatherError::Client { status: 400, message: "bad".into() }.is_retryable());
        assert!(!WeatherError::Client { status: 429, message: "slow down".into() }.is_retryable());
        assert!(!WeatherError::storage("disk").is_retryable());
    }

    #[test]
    fn test_rate_limited() {
        assert!(WeatherError::Client { status: 429, message: String::new() }.is_rate_limited());
        assert!(!WeatherError::Client { status: 404, message: String::new() }.is_rate_limited());
    }

    #[test]
    fn test_user_messages() {
        let err = WeatherError::Client { status: 401, message: "Invalid API key".into() };
        assert!(err.user_message().contains("API key"));

        let err = WeatherError::LocationUnavailable("gps off".into());
        assert!(err.user_message().contains("location"));
    }

    #[test]
    fn test_serde_error_is_data_format() {
        let err: WeatherError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(matches!(err, WeatherError::DataFormat(_)));
    }
}
