use thiserror::Error;

/// Errors raised while resolving configuration, before the engine exists.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Manifest not found: no .civicrc in {start} or any parent directory")]
    ManifestNotFound { start: String },

    #[error("Invalid manifest {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    #[error("Config Error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("YAML Error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
