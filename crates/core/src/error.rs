use thiserror::Error;

/// Errors raised while building configuration. Always fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(String),

    #[error("failed to parse settings: {0}")]
    Parse(String),

    #[error("invalid setting: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
