use thiserror::Error;

/// DDX errors that escape a single connection
#[derive(Error, Debug)]
pub enum DdxError {
    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("TLS Error: {0}")]
    TlsError(String),

    #[error("Failed to bind {addr}: {source}")]
    BindError {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    SerdeError(#[from] serde_json::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Result type for DDX operations
pub type DdxResult<T> = Result<T, DdxError>;
