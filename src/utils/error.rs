use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Parsing error: {message}")]
    Parse { message: String },

    #[error("Telegram transport error: {0}")]
    Transport(String),

    #[error("State persistence error: {0}")]
    State(String),
}

// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MonitorError>;
