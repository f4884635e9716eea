use thiserror::Error;

/// Transport failures. Every variant is treated as transient by the callers:
/// answers get queued, telemetry batches get dropped.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server returned status {0}")]
    Status(u16),

    #[error("invalid request: {0}")]
    Request(String),
}

impl ApiError {
    pub fn label(&self) -> &'static str {
        match self {
            ApiError::Timeout => "timeout",
            ApiError::Connection(_) => "connection",
            ApiError::Status(code) if *code >= 500 => "server_error",
            ApiError::Status(_) => "rejected",
            ApiError::Request(_) => "request",
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if let Some(status) = err.status() {
            ApiError::Status(status.as_u16())
        } else if err.is_builder() {
            ApiError::Request(err.to_string())
        } else {
            ApiError::Connection(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize answer queue: {0}")]
    Serialization(#[from] serde_json::Error),
}
