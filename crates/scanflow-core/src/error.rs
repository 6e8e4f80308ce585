/*!
 * Error types for the scanflow core crate.
 */
use thiserror::Error;

/// Error type for scanflow core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event loop error
    #[error("Event loop error: {0}")]
    Eloop(String),

    /// Logging error
    #[error("Logging error: {0}")]
    Logging(String),

    /// URI error
    #[error("URI error: {0}")]
    Uri(#[from] url::ParseError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for scanflow core operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        Error::Config(msg.as_ref().to_string())
    }

    /// Create a new event loop error
    pub fn eloop<S: AsRef<str>>(msg: S) -> Self {
        Error::Eloop(msg.as_ref().to_string())
    }

    /// Create a new logging error
    pub fn logging<S: AsRef<str>>(msg: S) -> Self {
        Error::Logging(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}
