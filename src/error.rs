use thiserror::Error;

use crate::middleware::{InvalidCidr, RateLimitError};

/// Application-level errors raised while configuring or running the server.
///
/// Request-time failures never surface here: each middleware answers them
/// with its own status code.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Rate limiter error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Invalid CIDR: {0}")]
    Cidr(#[from] InvalidCidr),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server error: {0}")]
    Server(String),
}

impl AppError {
    /// BSD `sysexits` code for this error.
    pub fn exit_code(&self) -> exitcode::ExitCode {
        match self {
            AppError::ConfigError(_) | AppError::RateLimit(_) | AppError::Cidr(_) => {
                exitcode::CONFIG
            }
            AppError::Metrics(_) | AppError::Io(_) => exitcode::UNAVAILABLE,
            AppError::Server(_) => exitcode::SOFTWARE,
        }
    }
}

/// Result type alias for application operations.
pub type AppResult<T> = Result<T, AppError>;
