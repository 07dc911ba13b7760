use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("geocoding service is rate limiting requests (HTTP {status})")]
    RateLimited { status: u16 },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl AppError {
    /// Errors that end the whole run rather than a single record or country.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Config(_) | AppError::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_throttling_and_configuration_end_the_run() {
        assert!(AppError::RateLimited { status: 429 }.is_fatal());
        assert!(AppError::Config("unknown strategy".into()).is_fatal());
        assert!(!AppError::Transport("timeout".into()).is_fatal());
        assert!(!AppError::Validation("missing input".into()).is_fatal());
    }
}
