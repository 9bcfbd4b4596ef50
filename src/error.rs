use thiserror::Error;

/// Failures of the durable store or the flat-list key-value storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be opened (denied, missing, locked). A capability
    /// absence for this call, not a fatal condition.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A send attempt that produced no HTTP response.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request cannot be built for this endpoint. Retrying never helps.
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// The server could not be reached, as reported by a transport that does
    /// not go through reqwest.
    #[error("{endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
}

impl TransportError {
    /// Whether the same request may get a response later.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::InvalidEndpoint { .. } => false,
            TransportError::Network(err) => !err.is_builder(),
            TransportError::Unreachable { .. } => true,
        }
    }
}
