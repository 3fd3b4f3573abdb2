//! In-memory task manager (C5): the phase state machine, assignment
//! generation, and result accumulation, held entirely in process memory.

use crate::canonical_key;
use crate::datasource::Datasource;
use crate::error::MapReduceResult;
use crate::manager::{group_consecutive, merge_groups, Assignment, Phase, TaskManager};
use netcode::message::{MapDonePayload, MapPayload, ReduceKey, ReducePayload};
use rand::seq::IteratorRandom;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

pub struct InMemoryTaskManager {
    datasource: Box<dyn Datasource>,
    phase: Phase,

    map_keys: Vec<Value>,
    map_cursor: usize,
    outstanding_maps: HashMap<String, (Value, Value)>,

    intermediate: BTreeMap<String, Vec<Value>>,

    reduce_groups: Vec<(Value, Vec<Value>)>,
    reduce_cursor: usize,
    outstanding_reduces: HashMap<String, (Value, Vec<Value>)>,

    results: BTreeMap<String, (Value, Value)>,
}

impl InMemoryTaskManager {
    pub fn new(datasource: Box<dyn Datasource>) -> InMemoryTaskManager {
        InMemoryTaskManager {
            datasource,
            phase: Phase::Start,
            map_keys: Vec::new(),
            map_cursor: 0,
            outstanding_maps: HashMap::new(),
            intermediate: BTreeMap::new(),
            reduce_groups: Vec::new(),
            reduce_cursor: 0,
            outstanding_reduces: HashMap::new(),
            results: BTreeMap::new(),
        }
    }

    fn open_reduce_iter(&mut self) -> MapReduceResult<()> {
        let rows: Vec<(String, Value)> = self
            .intermediate
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| (key.clone(), v.clone())))
            .collect();

        let mut groups = Vec::new();
        for (key, values) in group_consecutive(rows) {
            let k_mid: Value = serde_json::from_str(&key)?;
            groups.push((k_mid, values));
        }

        self.reduce_groups = groups;
        self.reduce_cursor = 0;
        Ok(())
    }
}

impl TaskManager for InMemoryTaskManager {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn next_task(&mut self) -> MapReduceResult<Assignment> {
        loop {
            match self.phase {
                Phase::Start => {
                    self.map_keys = self.datasource.keys();
                    self.map_cursor = 0;
                    self.phase = Phase::Mapping;
                }
                Phase::Mapping => {
                    if self.map_cursor < self.map_keys.len() {
                        let k_in = self.map_keys[self.map_cursor].clone();
                        self.map_cursor += 1;
                        let v_in = self
                            .datasource
                            .get(&k_in)
                            .expect("datasource key disappeared mid-job");

                        self.outstanding_maps
                            .insert(canonical_key(&k_in), (k_in.clone(), v_in.clone()));

                        return Ok(Assignment::Map(MapPayload { k_in, v_in }));
                    } else if !self.outstanding_maps.is_empty() {
                        let (k_in, v_in) = self
                            .outstanding_maps
                            .values()
                            .choose(&mut rand::thread_rng())
                            .expect("non-empty outstanding set")
                            .clone();

                        return Ok(Assignment::Map(MapPayload { k_in, v_in }));
                    } else {
                        self.phase = Phase::Reducing;
                        self.open_reduce_iter()?;
                    }
                }
                Phase::Reducing => {
                    if self.reduce_cursor < self.reduce_groups.len() {
                        let (k_mid, values) = self.reduce_groups[self.reduce_cursor].clone();
                        self.reduce_cursor += 1;

                        let reduce_key = ReduceKey::Simple(k_mid.clone());
                        self.outstanding_reduces
                            .insert(reduce_key.canonical(), (k_mid, values.clone()));

                        return Ok(Assignment::Reduce(ReducePayload { key: reduce_key, values }));
                    } else if !self.outstanding_reduces.is_empty() {
                        let (k_mid, values) = self
                            .outstanding_reduces
                            .values()
                            .choose(&mut rand::thread_rng())
                            .expect("non-empty outstanding set")
                            .clone();

                        let reduce_key = ReduceKey::Simple(k_mid);
                        return Ok(Assignment::Reduce(ReducePayload { key: reduce_key, values }));
                    } else {
                        self.phase = Phase::Finished;
                    }
                }
                Phase::Finished => return Ok(Assignment::Disconnect),
            }
        }
    }

    fn map_done(&mut self, done: MapDonePayload) -> MapReduceResult<()> {
        let canon = canonical_key(&done.k_in);

        if self.outstanding_maps.remove(&canon).is_some() {
            merge_groups(&mut self.intermediate, done.groups);
        }

        Ok(())
    }

    fn reduce_done(&mut self, key: ReduceKey, value: Value) -> MapReduceResult<()> {
        let canon = key.canonical();

        if self.outstanding_reduces.remove(&canon).is_some() {
            let k_mid = key.base_key().clone();
            self.results.insert(canonical_key(&k_mid), (k_mid, value));
        }

        Ok(())
    }

    fn results(&mut self) -> MapReduceResult<Vec<(Value, Value)>> {
        Ok(self.results.values().cloned().collect())
    }

    // `release` is intentionally left at the trait default (a no-op): the
    // cursor has already passed the key, so the outstanding entry is the
    // only remaining record of it. Removing it here would drop the key's
    // output for good; leaving it outstanding lets the speculative branch
    // above re-pick it once the cursor drains, exactly as the original's
    // `random.choice(working_maps)` does on a stalled worker.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::MemoryDatasource;
    use crate::jobs::wordcount;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn run_single_worker_job(datasource: MemoryDatasource) -> Vec<(Value, Value)> {
        let job = wordcount::job();
        let mut manager = InMemoryTaskManager::new(Box::new(datasource));

        loop {
            match manager.next_task().unwrap() {
                Assignment::Map(MapPayload { k_in, v_in }) => {
                    let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                    for (k, v) in (job.mapfn)(&k_in, &v_in) {
                        groups.entry(canonical_key(&k)).or_default().push(v);
                    }
                    manager.map_done(MapDonePayload { k_in, groups }).unwrap();
                }
                Assignment::Reduce(ReducePayload { key, values }) => {
                    let value = (job.reducefn)(key.base_key(), &values);
                    manager.reduce_done(key, value).unwrap();
                }
                Assignment::Disconnect => break,
            }
        }

        manager.results().unwrap()
    }

    #[test]
    fn s1_word_count_in_memory() {
        let datasource = MemoryDatasource::new([
            (json!("a"), json!("x y x")),
            (json!("b"), json!("y z")),
        ]);

        let results: BTreeSet<(Value, Value)> = run_single_worker_job(datasource).into_iter().collect();

        let expected: BTreeSet<(Value, Value)> =
            [(json!("x"), json!(2)), (json!("y"), json!(2)), (json!("z"), json!(1))]
                .into_iter()
                .collect();

        assert_eq!(results, expected);
    }

    #[test]
    fn late_duplicate_map_result_is_dropped() {
        let datasource = MemoryDatasource::new([(json!("a"), json!("x"))]);
        let mut manager = InMemoryTaskManager::new(Box::new(datasource));

        let Assignment::Map(MapPayload { k_in, .. }) = manager.next_task().unwrap() else {
            panic!("expected map")
        };

        let mut groups = BTreeMap::new();
        groups.insert(canonical_key(&json!("x")), vec![json!(1)]);
        manager.map_done(MapDonePayload { k_in: k_in.clone(), groups: groups.clone() }).unwrap();

        // Duplicate application after the key is no longer outstanding must be a no-op.
        groups.insert(canonical_key(&json!("x")), vec![json!(1)]);
        manager.map_done(MapDonePayload { k_in, groups }).unwrap();

        assert_eq!(manager.intermediate.get("\"x\"").unwrap().len(), 1);
    }

    #[test]
    fn speculative_redispatch_of_stalled_map_assignment() {
        let datasource = MemoryDatasource::new([(json!("a"), json!("x"))]);
        let mut manager = InMemoryTaskManager::new(Box::new(datasource));

        let Assignment::Map(first) = manager.next_task().unwrap() else {
            panic!("expected map")
        };

        // The only key is already outstanding and uncompleted; with the
        // cursor drained the manager must re-dispatch it rather than stall.
        let Assignment::Map(second) = manager.next_task().unwrap() else {
            panic!("expected a speculative re-dispatch, not a stall")
        };
        assert_eq!(first.k_in, second.k_in);
        assert_eq!(manager.outstanding_maps.len(), 1);

        let mut groups = BTreeMap::new();
        groups.insert(canonical_key(&json!("x")), vec![json!(1)]);
        manager.map_done(MapDonePayload { k_in: second.k_in, groups }).unwrap();

        assert_eq!(manager.phase(), Phase::Reducing);
    }

    #[test]
    fn release_leaves_the_assignment_outstanding_for_respeculation() {
        let datasource = MemoryDatasource::new([(json!("a"), json!("x"))]);
        let mut manager = InMemoryTaskManager::new(Box::new(datasource));

        let Assignment::Map(MapPayload { k_in, .. }) = manager.next_task().unwrap() else {
            panic!("expected map")
        };
        assert_eq!(manager.outstanding_maps.len(), 1);

        let handle = crate::manager::OutstandingHandle {
            map_key: Some(canonical_key(&k_in)),
            reduce_key: None,
        };
        manager.release(&handle);

        // The key must still be outstanding: a disconnect releases the
        // session holding it, it does not erase the only record of it.
        assert_eq!(manager.outstanding_maps.len(), 1);

        let Assignment::Map(redispatched) = manager.next_task().unwrap() else {
            panic!("expected the speculative path to re-dispatch the same key")
        };
        assert_eq!(redispatched.k_in, k_in);
    }

    #[test]
    fn finite_datasource_reaches_finished() {
        let datasource = MemoryDatasource::new([(json!("a"), json!("x y")), (json!("b"), json!("y"))]);
        let results = run_single_worker_job(datasource);
        assert!(!results.is_empty());
    }
}
