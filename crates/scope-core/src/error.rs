//! Error handling for inferscope
//!
//! Provides a unified error type and result type shared by the observability
//! crates. Observability errors are reported to callers but must never abort
//! request serving; the serving layer logs them and continues.

/// Result type alias for inferscope operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for inferscope core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }
}

/// Extension trait for adding context to Results
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let original_error = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", context.into(), original_error))
        })
    }

    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let original_error = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", f(), original_error))
        })
    }
}
