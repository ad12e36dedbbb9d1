//! Error types for the application.

use thiserror::Error;

/// Top-level application error.
#[derive(Debug, Error)]
#[allow(dead_code)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),
}

/// Configuration-related errors. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{path}': {message}")]
    ParseError { path: String, message: String },

    #[error("Config validation failed:\n{message}")]
    ValidationError { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// Attachment download errors. The relay turns every one of these into a
/// text-label fallback.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("attachment has no URL")]
    EmptyUrl,

    #[error("attachment too large: {size} bytes (max {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("HTTP {status}")]
    Status { status: u16 },

    #[error("fetch timed out")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Raised by driver-provided fetchers.
    #[allow(dead_code)]
    #[error("fetch failed: {message}")]
    Fetcher { message: String },
}

/// Errors returned by a driver's send capability.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("driver not ready: {message}")]
    NotReady { message: String },

    #[error("invalid channel address: {message}")]
    InvalidAddress { message: String },

    #[error("platform rejected message: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("send timed out")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("platform error: {message}")]
    Platform { message: String },
}

impl From<serenity::Error> for SendError {
    fn from(e: serenity::Error) -> Self {
        SendError::Platform {
            message: e.to_string(),
        }
    }
}

/// Result type alias for attachment fetches.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Result type alias for driver sends.
pub type SendResult<T> = std::result::Result<T, SendError>;
