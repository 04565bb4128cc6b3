use murmur_fast::FastStoreError;
use murmur_types::events::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    /// A durable write failed. Never shown to clients; the buffer retries.
    #[error("persistence degraded: {0}")]
    PersistenceDegraded(String),

    #[error(transparent)]
    FastStore(#[from] FastStoreError),

    #[error("durable store error: {0:#}")]
    Durable(#[from] anyhow::Error),

    #[error("could not encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<FrameError> for GatewayError {
    fn from(err: FrameError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl GatewayError {
    /// Text sent to the client in an `error` event. Internal failures are
    /// not spelled out.
    pub fn client_message(&self) -> String {
        match self {
            Self::Unauthorized(_) | Self::NotFound(_) | Self::Validation(_) => self.to_string(),
            Self::PersistenceDegraded(_) | Self::FastStore(_) | Self::Durable(_) | Self::Encode(_) => {
                "Internal server error".to_string()
            }
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
