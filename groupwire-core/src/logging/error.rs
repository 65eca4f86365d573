//! Error types for the logging subsystem

use std::fmt;

#[derive(Debug, Clone)]
pub enum LoggingError {
    /// A global subscriber is already installed, or the layer stack failed to build
    InitializationFailed(String),
    /// The logging section of the config could not be interpreted
    InvalidConfiguration(String),
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggingError::InitializationFailed(msg) => {
                write!(f, "Failed to initialize logging: {}", msg)
            }
            LoggingError::InvalidConfiguration(msg) => {
                write!(f, "Invalid logging configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for LoggingError {}
