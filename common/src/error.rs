use config::ConfigError;
use thiserror::Error;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Degenerate vector: {0}")]
    DegenerateVector(String),
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("Generation failure: {0}")]
    Generation(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl AppError {
    /// Short, stable label used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::DegenerateVector(_) => "degenerate_vector",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::Generation(_) => "generation_failure",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::InternalError(_) => "internal",
        }
    }
}

/// Classifies a transport error from an outbound HTTP call.
///
/// Connection and timeout failures mean the dependency is unreachable; anything
/// else came back from a reachable endpoint and is wrapped as a generation failure.
pub fn classify_reqwest_error(context: &str, err: &reqwest::Error) -> AppError {
    if err.is_connect() || err.is_timeout() {
        AppError::ProviderUnavailable(format!("{context}: {err}"))
    } else {
        AppError::Generation(format!("{context}: {err}"))
    }
}
