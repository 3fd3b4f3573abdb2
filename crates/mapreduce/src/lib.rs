//! The job-agnostic coordinator core: datasources, the task manager contract
//! and its three implementations (in-memory, persistent, batched), and the
//! named-function job registry.

pub mod batched;
pub mod datasource;
pub mod error;
pub mod jobs;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod sqlite;

pub use error::{MapReduceError, MapReduceResult};
pub use manager::{Assignment, OutstandingHandle, Phase, TaskManager};
pub use netcode::message::canonical_key;
pub use registry::{FunctionRegistry, JobDef};
