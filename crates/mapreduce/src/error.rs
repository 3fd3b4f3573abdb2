use thiserror::Error;

pub type MapReduceResult<T> = Result<T, MapReduceError>;

#[derive(Debug, Error)]
pub enum MapReduceError {
    #[error("resume requested but the durable store has no prior state")]
    ResumeWithoutState,
    #[error("durable store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("key/value serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown job {0:?}")]
    UnknownJob(String),
    #[error("batch size must be greater than zero")]
    BadBatchSize,
}
