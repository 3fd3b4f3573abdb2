//! The read-only, externally supplied map input described by the data model.

use serde_json::Value;
use std::collections::HashMap;

use crate::canonical_key;

/// An opaque mapping from map key to map input value, iterable in some
/// order. The coordinator never mutates it during a job's lifetime.
pub trait Datasource: Send {
    /// Keys in iteration order. Returned as an owned `Vec` since every
    /// implementation in this rewrite fits comfortably in memory; a truly
    /// external datasource could stream this instead.
    fn keys(&self) -> Vec<Value>;

    /// The input value for a given key, if still present.
    fn get(&self, key: &Value) -> Option<Value>;

    fn len(&self) -> usize {
        self.keys().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `Datasource` backed by an in-memory table, built once at job start.
pub struct MemoryDatasource {
    order: Vec<Value>,
    data: HashMap<String, Value>,
}

impl MemoryDatasource {
    pub fn new(pairs: impl IntoIterator<Item = (Value, Value)>) -> MemoryDatasource {
        let mut order = Vec::new();
        let mut data = HashMap::new();

        for (key, value) in pairs {
            data.insert(canonical_key(&key), value);
            order.push(key);
        }

        MemoryDatasource { order, data }
    }
}

impl Datasource for MemoryDatasource {
    fn keys(&self) -> Vec<Value> {
        self.order.clone()
    }

    fn get(&self, key: &Value) -> Option<Value> {
        self.data.get(&canonical_key(key)).cloned()
    }
}
