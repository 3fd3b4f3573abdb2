//! The task manager contract shared by the in-memory (C5), persistent (C6),
//! and batched (C7) implementations.

use crate::error::MapReduceResult;
use netcode::message::{MapDonePayload, MapPayload, ReduceKey, ReducePayload};
use serde_json::Value;
use std::collections::BTreeMap;

/// Job phase, modeled as an explicit tagged variant (per the "phase as data"
/// design note) so a transition like `Finished -> Mapping` cannot be
/// expressed. The batched manager re-enters `Reducing` internally by
/// bumping its own `depth` counter; externally this is still one phase.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    Start,
    Mapping,
    Reducing,
    Finished,
}

/// What the coordinator should hand to a worker next.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Map(MapPayload),
    Reduce(ReducePayload),
    Disconnect,
}

/// The shared state-machine contract. `next_task`/`map_done`/`reduce_done`
/// must be called under external serialization (the coordinator holds a
/// single mutex around its task manager) so the outstanding-set invariants
/// in the spec's data model hold.
pub trait TaskManager: Send {
    fn phase(&self) -> Phase;

    /// Produces the next assignment, recording it as outstanding as a
    /// side effect. Pure function of state otherwise.
    fn next_task(&mut self) -> MapReduceResult<Assignment>;

    /// Applies a worker's `mapdone` result. A no-op if `k_in` is no longer
    /// outstanding (late/duplicate result).
    fn map_done(&mut self, done: MapDonePayload) -> MapReduceResult<()>;

    /// Applies a worker's `reducedone` result. A no-op if the composite key
    /// is no longer outstanding.
    fn reduce_done(&mut self, key: ReduceKey, value: Value) -> MapReduceResult<()>;

    /// Final `(k_mid, v_out)` pairs. Only meaningful once `phase() ==
    /// Phase::Finished`.
    fn results(&mut self) -> MapReduceResult<Vec<(Value, Value)>>;

    /// Called when a session that was holding an assignment disconnects.
    /// The default (and every implementation's) behavior is a no-op: the
    /// cursor has already moved past the key, so the outstanding entry is
    /// the only remaining record of it, and removing it here would drop
    /// the key's output for good. Leaving it outstanding lets the
    /// speculative branch of `next_task` re-pick it on the next call,
    /// matching the original's `random.choice(working_maps)` re-dispatch
    /// of a stalled assignment.
    fn release(&mut self, _outstanding: &OutstandingHandle) {}
}

/// Identifies the assignment(s) a particular session was holding, so the
/// coordinator can notify the task manager which session disconnected.
/// Sessions track which key(s) they were last handed; this is intentionally
/// a thin wrapper rather than a back-pointer into the task manager (see the
/// cyclic-ownership design note).
#[derive(Debug, Clone, Default)]
pub struct OutstandingHandle {
    pub map_key: Option<String>,
    pub reduce_key: Option<String>,
}

/// Groups a stream of `(canonical_key, value)` pairs into ordered,
/// consecutive-run groups, exactly mirroring the `itertools.groupby` the
/// original implementation relies on after an `order by key asc` read.
pub fn group_consecutive(rows: Vec<(String, Value)>) -> Vec<(String, Vec<Value>)> {
    let mut groups: Vec<(String, Vec<Value>)> = Vec::new();

    for (key, value) in rows {
        match groups.last_mut() {
            Some((last_key, values)) if *last_key == key => values.push(value),
            _ => groups.push((key, vec![value])),
        }
    }

    groups
}

/// Merges a worker's per-key map output into an intermediate store keyed by
/// canonical JSON text, extending each key's value list.
pub fn merge_groups(store: &mut BTreeMap<String, Vec<Value>>, groups: BTreeMap<String, Vec<Value>>) {
    for (key, mut values) in groups {
        store.entry(key).or_default().append(&mut values);
    }
}
