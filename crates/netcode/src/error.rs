use std::io;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Mirrors the teacher's `ErrorType`/`NetworkError` split: `Wait` denotes a
/// recoverable, try-again condition (not applicable to the blocking I/O used
/// here, but kept so the error shape matches the rest of the stack), `Fatal`
/// denotes a connection that must be closed.
#[derive(Debug)]
pub enum NetworkError {
    Fatal(ErrorType),
}

#[derive(Debug)]
pub enum ErrorType {
    MalformedFrame(String),
    UnknownVerb(String),
    PayloadBeforeAuth(String),
    AuthFailed,
    Serialization(bincode::Error),
    Io(io::ErrorKind),
    ConnectionClosed,
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(err: io::Error) -> Self {
        NetworkError::Fatal(ErrorType::Io(err.kind()))
    }
}

impl From<bincode::Error> for NetworkError {
    #[inline]
    fn from(err: bincode::Error) -> Self {
        NetworkError::Fatal(ErrorType::Serialization(err))
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::Fatal(kind) => write!(f, "fatal network error: {:?}", kind),
        }
    }
}

impl std::error::Error for NetworkError {}
