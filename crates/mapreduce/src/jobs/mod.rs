//! Built-in jobs, registered by name in the [`crate::registry::FunctionRegistry`].

pub mod wordcount;
