//! Framed, authenticated line/length protocol between coordinator and worker.

pub mod error;
pub mod frame;
pub mod message;
pub mod session;
pub mod transport;

pub use error::{NetworkError, NetworkResult};
pub use frame::{Frame, CONTROL_VERBS};
pub use session::{HandshakeEvent, Phase, Session};
pub use transport::Connection;
