use thiserror::Error;

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("network error: {0}")]
    Network(#[from] netcode::NetworkError),
    #[error(transparent)]
    MapReduce(#[from] mapreduce::MapReduceError),
    #[error("durable store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown job {0:?}")]
    UnknownJob(String),
    #[error("connection closed before the worker replied")]
    ConnectionClosed,
    #[error("worker sent {got:?} where {expected} was expected")]
    UnexpectedReply { expected: &'static str, got: String },
}
