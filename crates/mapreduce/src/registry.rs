//! Named-function selection, replacing the transported-code design of the
//! original implementation (see the `§9` redesign note): both the
//! coordinator and the worker resolve `mapfn`/`reducefn`/`collectfn` against
//! an identical local registry, keyed by the job name carried on the wire.

use serde_json::Value;
use std::collections::HashMap;

pub type MapFn = fn(&Value, &Value) -> Vec<(Value, Value)>;
pub type ReduceFn = fn(&Value, &[Value]) -> Value;
pub type CollectFn = fn(&Value, &[Value]) -> Value;

/// The three user callables for one job, plus the name both ends agree on.
#[derive(Clone, Copy)]
pub struct JobDef {
    pub name: &'static str,
    pub mapfn: MapFn,
    pub reducefn: ReduceFn,
    pub collectfn: Option<CollectFn>,
}

/// A table of jobs a worker (or coordinator, for validation) can run,
/// populated at process start. Both binaries in this workspace populate it
/// identically via [`FunctionRegistry::with_builtin_jobs`].
#[derive(Default)]
pub struct FunctionRegistry {
    jobs: HashMap<&'static str, JobDef>,
}

impl FunctionRegistry {
    pub fn new() -> FunctionRegistry {
        FunctionRegistry { jobs: HashMap::new() }
    }

    pub fn register(&mut self, job: JobDef) {
        self.jobs.insert(job.name, job);
    }

    pub fn get(&self, name: &str) -> Option<&JobDef> {
        self.jobs.get(name)
    }

    /// The registry this workspace ships: currently just `wordcount`.
    pub fn with_builtin_jobs() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register(crate::jobs::wordcount::job());
        registry
    }
}
