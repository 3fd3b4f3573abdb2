//! Batched task manager (C7): on top of the persistent manager's schema and
//! resume contract, splits an oversize per-key value group into bounded
//! slices and iterates the reduce phase to a fixed point.
//!
//! Grounded on the original implementation's `BatchSqliteTaskManager`, which
//! layers the same idea onto `SqliteTaskManager`: a `depth` column on
//! `map_results` keeps successive rounds from mixing, and a key whose value
//! group didn't fit in one slice has its per-slice `reducedone` results fed
//! back in as depth+1 map output instead of a final result.

use crate::canonical_key;
use crate::datasource::Datasource;
use crate::error::{MapReduceError, MapReduceResult};
use crate::manager::{group_consecutive, Assignment, Phase, TaskManager};
use netcode::message::{MapDonePayload, MapPayload, ReduceKey, ReducePayload};
use rand::seq::IteratorRandom;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

const SCHEMA: &str = include_str!("../sql/schema_batch.sql");

fn phase_code(phase: Phase) -> i64 {
    match phase {
        Phase::Start => 0,
        Phase::Mapping => 1,
        Phase::Reducing => 2,
        Phase::Finished => 3,
    }
}

fn phase_from_code(code: i64) -> Phase {
    match code {
        0 => Phase::Start,
        1 => Phase::Mapping,
        2 => Phase::Reducing,
        _ => Phase::Finished,
    }
}

/// One `partialreduce` unit of work: a `k_mid`'s values chunked into groups
/// of at most `batch_size`, numbered from 1.
#[derive(Clone)]
struct ReduceSlice {
    key: Value,
    slice_no: u32,
    values: Vec<Value>,
}

pub struct BatchedTaskManager {
    conn: Connection,
    datasource: Box<dyn Datasource>,
    phase: Phase,
    batch_size: usize,

    map_keys: Vec<Value>,
    map_cursor: usize,
    outstanding_maps: HashMap<String, (Value, Value)>,

    depth: u32,
    reduce_slices: Vec<ReduceSlice>,
    reduce_cursor: usize,
    outstanding_reduces: HashMap<String, ReduceSlice>,
    /// `k_mid` canonical keys whose value group spanned more than one slice
    /// in the round currently being reduced at `depth`.
    multi_sliced: HashSet<String>,
}

impl BatchedTaskManager {
    pub fn new(
        conn: Connection,
        datasource: Box<dyn Datasource>,
        resume: bool,
        batch_size: usize,
    ) -> MapReduceResult<BatchedTaskManager> {
        if batch_size == 0 {
            return Err(MapReduceError::BadBatchSize);
        }

        conn.execute_batch(SCHEMA)?;

        let phase = if resume {
            let stored: Option<i64> = conn
                .query_row("select current_state from state limit 1", [], |row| row.get(0))
                .optional()?;
            match stored {
                Some(code) => phase_from_code(code),
                None => return Err(MapReduceError::ResumeWithoutState),
            }
        } else {
            conn.execute("delete from map_results", [])?;
            conn.execute("delete from reduce_results", [])?;
            conn.execute("delete from state", [])?;
            conn.execute("insert into state (current_state) values (?1)", params![phase_code(Phase::Start)])?;
            Phase::Start
        };

        let mut manager = BatchedTaskManager {
            conn,
            datasource,
            phase,
            batch_size,
            map_keys: Vec::new(),
            map_cursor: 0,
            outstanding_maps: HashMap::new(),
            depth: 0,
            reduce_slices: Vec::new(),
            reduce_cursor: 0,
            outstanding_reduces: HashMap::new(),
            multi_sliced: HashSet::new(),
        };

        if manager.phase == Phase::Reducing {
            // The current round's depth isn't separately persisted; the
            // highest depth written so far is the round still in progress.
            let depth: i64 =
                manager.conn.query_row("select coalesce(max(depth), 0) from map_results", [], |row| row.get(0))?;
            manager.depth = depth as u32;
            manager.open_reduce_iter_at(manager.depth)?;
        }

        Ok(manager)
    }

    fn set_phase(&mut self, phase: Phase) -> MapReduceResult<()> {
        self.conn.execute("update state set current_state = ?1", params![phase_code(phase)])?;
        self.phase = phase;
        Ok(())
    }

    /// Rebuilds the slice worklist for one reduce round: groups `map_results`
    /// rows at `depth` by key, chunks each group's values into `batch_size`
    /// pieces, and records any key spanning more than one chunk as
    /// multi-sliced (§4.7 peek-ahead).
    fn open_reduce_iter_at(&mut self, depth: u32) -> MapReduceResult<()> {
        let mut stmt = self.conn.prepare("select key, value from map_results where depth = ?1 order by key asc")?;
        let rows = stmt.query_map(params![depth], |row| {
            let key: String = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            Ok((key, bytes))
        })?;

        let mut pairs = Vec::new();
        for row in rows {
            let (key, bytes) = row?;
            let value: Value = serde_json::from_slice(&bytes)?;
            pairs.push((key, value));
        }

        let mut slices = Vec::new();
        self.multi_sliced.clear();

        for (key_text, values) in group_consecutive(pairs) {
            let k_mid: Value = serde_json::from_str(&key_text)?;
            let chunks: Vec<&[Value]> = values.chunks(self.batch_size).collect();

            if chunks.len() > 1 {
                self.multi_sliced.insert(key_text.clone());
            }

            for (i, chunk) in chunks.into_iter().enumerate() {
                slices.push(ReduceSlice { key: k_mid.clone(), slice_no: (i + 1) as u32, values: chunk.to_vec() });
            }
        }

        self.reduce_slices = slices;
        self.reduce_cursor = 0;
        Ok(())
    }

    fn reduce_key_for(&self, slice: &ReduceSlice) -> ReduceKey {
        ReduceKey::Sliced { key: slice.key.clone(), slice: slice.slice_no, depth: self.depth }
    }
}

impl TaskManager for BatchedTaskManager {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn next_task(&mut self) -> MapReduceResult<Assignment> {
        loop {
            match self.phase {
                Phase::Start => {
                    self.map_keys = self.datasource.keys();
                    self.map_cursor = 0;
                    self.set_phase(Phase::Mapping)?;
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
                        self.set_phase(Phase::Reducing)?;
                        self.depth = 0;
                        self.open_reduce_iter_at(0)?;
                    }
                }
                Phase::Reducing => {
                    if self.reduce_cursor < self.reduce_slices.len() {
                        let slice = self.reduce_slices[self.reduce_cursor].clone();
                        self.reduce_cursor += 1;

                        let reduce_key = self.reduce_key_for(&slice);
                        self.outstanding_reduces.insert(reduce_key.canonical(), slice.clone());

                        return Ok(Assignment::Reduce(ReducePayload { key: reduce_key, values: slice.values }));
                    } else if !self.outstanding_reduces.is_empty() {
                        let slice = self
                            .outstanding_reduces
                            .values()
                            .choose(&mut rand::thread_rng())
                            .expect("non-empty outstanding set")
                            .clone();

                        let reduce_key = self.reduce_key_for(&slice);
                        return Ok(Assignment::Reduce(ReducePayload { key: reduce_key, values: slice.values }));
                    } else if !self.multi_sliced.is_empty() {
                        self.depth += 1;
                        self.open_reduce_iter_at(self.depth)?;
                    } else {
                        self.set_phase(Phase::Finished)?;
                    }
                }
                Phase::Finished => return Ok(Assignment::Disconnect),
            }
        }
    }

    fn map_done(&mut self, done: MapDonePayload) -> MapReduceResult<()> {
        let canon = canonical_key(&done.k_in);

        if self.outstanding_maps.remove(&canon).is_some() {
            for (key, values) in done.groups {
                for value in values {
                    let bytes = serde_json::to_vec(&value)?;
                    self.conn.execute(
                        "insert into map_results (key, value, depth) values (?1, ?2, 0)",
                        params![key, bytes],
                    )?;
                }
            }
        }

        Ok(())
    }

    fn reduce_done(&mut self, key: ReduceKey, value: Value) -> MapReduceResult<()> {
        let canon = key.canonical();

        if self.outstanding_reduces.remove(&canon).is_some() {
            let k_mid = key.base_key().clone();
            let row_key = canonical_key(&k_mid);
            let bytes = serde_json::to_vec(&value)?;

            if self.multi_sliced.contains(&row_key) {
                self.conn.execute(
                    "insert into map_results (key, value, depth) values (?1, ?2, ?3)",
                    params![row_key, bytes, self.depth + 1],
                )?;
            } else {
                self.conn.execute(
                    "insert into reduce_results (key, value) values (?1, ?2) \
                     on conflict(key) do update set value = excluded.value",
                    params![row_key, bytes],
                )?;
            }
        }

        Ok(())
    }

    fn results(&mut self) -> MapReduceResult<Vec<(Value, Value)>> {
        let mut stmt = self.conn.prepare("select key, value from reduce_results order by key asc")?;
        let rows = stmt.query_map([], |row| {
            let key: String = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            Ok((key, bytes))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, bytes) = row?;
            let k_mid: Value = serde_json::from_str(&key)?;
            let value: Value = serde_json::from_slice(&bytes)?;
            out.push((k_mid, value));
        }

        Ok(out)
    }

    // `release` stays at the trait default: see the note in
    // `memory::InMemoryTaskManager` for why removing the outstanding entry
    // on disconnect would drop the key's output instead of re-dispatching it.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::MemoryDatasource;
    use crate::jobs::wordcount;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn run_single_worker_job(
        manager: &mut BatchedTaskManager,
        job: &crate::registry::JobDef,
    ) -> Vec<(Value, Value)> {
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
    fn zero_batch_size_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let datasource = MemoryDatasource::new(Vec::<(Value, Value)>::new());
        let err = BatchedTaskManager::new(conn, Box::new(datasource), false, 0).unwrap_err();
        assert!(matches!(err, MapReduceError::BadBatchSize));
    }

    #[test]
    fn single_slice_groups_resolve_like_the_unbatched_manager() {
        // No key ever accumulates more than `batch_size` values, so this
        // degenerates to one reduce round, same result as S1.
        let job = wordcount::job();
        let conn = Connection::open_in_memory().unwrap();
        let datasource = MemoryDatasource::new([(json!("a"), json!("x y x")), (json!("b"), json!("y z"))]);
        let mut manager = BatchedTaskManager::new(conn, Box::new(datasource), false, 10).unwrap();

        let results: BTreeSet<(Value, Value)> = run_single_worker_job(&mut manager, &job).into_iter().collect();
        let expected: BTreeSet<(Value, Value)> =
            [(json!("x"), json!(2)), (json!("y"), json!(2)), (json!("z"), json!(1))]
                .into_iter()
                .collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn s5_oversize_group_splits_and_converges() {
        // "x" accumulates 5 values at depth 0; batch_size 2 forces 3 slices
        // (2 + 2 + 1) whose partial sums [2, 2, 1] feed back in as depth-1
        // map output. That group of 3 values again splits into 2 slices
        // (2 + 1), whose sums [4, 1] feed back as depth-2 map output, which
        // finally fits in one slice and reduces to a single final value.
        let job = wordcount::job();
        let conn = Connection::open_in_memory().unwrap();
        let datasource = MemoryDatasource::new([(json!("a"), json!("x x x x x"))]);
        let mut manager = BatchedTaskManager::new(conn, Box::new(datasource), false, 2).unwrap();

        let results = run_single_worker_job(&mut manager, &job);
        assert_eq!(results, vec![(json!("x"), json!(5))]);
        assert_eq!(manager.depth, 2);
    }

    #[test]
    fn late_duplicate_reduce_result_is_dropped() {
        let job = wordcount::job();
        let conn = Connection::open_in_memory().unwrap();
        let datasource = MemoryDatasource::new([(json!("a"), json!("x"))]);
        let mut manager = BatchedTaskManager::new(conn, Box::new(datasource), false, 10).unwrap();

        let Assignment::Map(MapPayload { k_in, .. }) = manager.next_task().unwrap() else {
            panic!("expected map")
        };
        let mut groups = BTreeMap::new();
        groups.insert(canonical_key(&json!("x")), vec![json!(1)]);
        manager.map_done(MapDonePayload { k_in, groups }).unwrap();

        let Assignment::Reduce(ReducePayload { key, values }) = manager.next_task().unwrap() else {
            panic!("expected reduce")
        };
        let value = (job.reducefn)(key.base_key(), &values);
        manager.reduce_done(key.clone(), value.clone()).unwrap();

        // Key is no longer outstanding; a duplicate reply must not upsert again.
        manager.reduce_done(key, json!(999)).unwrap();

        let results = manager.results().unwrap();
        assert_eq!(results, vec![(json!("x"), json!(1))]);
    }
}
