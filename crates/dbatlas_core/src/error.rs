use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Query timed out")]
    Timeout,

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Invalid connection parameters: {0}")]
    InvalidParams(String),

    #[error("Connection limit reached ({max} connections)")]
    CapacityExceeded { max: usize },

    #[error("Invalid dialect catalog: {0}")]
    Catalog(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DbError {
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryFailed(message.into())
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    /// Bad or missing connection parameters, or a malformed catalog. Never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidParams(_) | Self::Catalog(_))
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }

    /// Failures of a single round trip that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::QueryFailed(_) | Self::Timeout | Self::ConnectionFailed(_)
        )
    }
}
