use thiserror::Error;

/// Filter configuration error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be finite and positive, got {value}")]
    NonPositiveNoise { name: &'static str, value: f64 },

    #[error("Fading coefficient must lie in (0, 1], got {0}")]
    FadingOutOfRange(f64),

    #[error("Chi-square threshold must be finite and positive, got {0}")]
    NonPositiveThreshold(f64),
}

/// Result type for filter construction
pub type ConfigResult<T> = Result<T, ConfigError>;
