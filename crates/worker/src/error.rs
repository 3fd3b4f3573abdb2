use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("network error: {0}")]
    Network(#[from] netcode::NetworkError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key/value serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown job {0:?}")]
    UnknownJob(String),
    #[error("{0} invoked before the coordinator installed it")]
    FunctionNotInstalled(&'static str),
    #[error("unexpected verb {0:?} for this phase")]
    UnexpectedVerb(String),
    #[error("connection closed before the handshake completed")]
    ConnectionClosed,
}
