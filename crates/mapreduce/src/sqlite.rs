//! Persistent task manager (C6): the same phase machine as
//! [`crate::memory::InMemoryTaskManager`], but `map_results`/`reduce_results`
//! live in a SQLite store so a job survives a coordinator restart.
//!
//! Grounded on the original implementation's `SqliteTaskManager`, which
//! mirrors the in-memory manager's phase onto a `state` table and reads
//! `map_results` back out with `order by key asc` to rebuild the reduce
//! groups. The one deliberate departure: `reduce_results` is keyed on `key`
//! with an upsert, not an append log (see `sql/schema.sql`), so a resumed
//! job's reduce round is safe to re-run. Resuming mid-`Mapping` is not: the
//! store has no record of which `k_in` already produced output, so a
//! restart there re-maps every key from scratch. Operators who need a crash
//! window narrower than "between phases" should drive the job to a phase
//! boundary before restarting; this is an inherited limitation of the
//! original design, not a hidden one.

use crate::canonical_key;
use crate::datasource::Datasource;
use crate::error::{MapReduceError, MapReduceResult};
use crate::manager::{group_consecutive, Assignment, Phase, TaskManager};
use netcode::message::{MapDonePayload, MapPayload, ReduceKey, ReducePayload};
use rand::seq::IteratorRandom;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;

const SCHEMA: &str = include_str!("../sql/schema.sql");

pub struct SqliteTaskManager {
    conn: Connection,
    datasource: Box<dyn Datasource>,
    phase: Phase,

    map_keys: Vec<Value>,
    map_cursor: usize,
    outstanding_maps: HashMap<String, (Value, Value)>,

    reduce_groups: Vec<(Value, Vec<Value>)>,
    reduce_cursor: usize,
    outstanding_reduces: HashMap<String, (Value, Vec<Value>)>,
}

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

impl SqliteTaskManager {
    /// `resume` mirrors the coordinator's `--resume` flag: when false, the
    /// schema is (re)created and the job starts fresh; when true, the
    /// store's mirrored phase is trusted and the job picks up from there.
    pub fn new(
        conn: Connection,
        datasource: Box<dyn Datasource>,
        resume: bool,
    ) -> MapReduceResult<SqliteTaskManager> {
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

        let mut manager = SqliteTaskManager {
            conn,
            datasource,
            phase,
            map_keys: Vec::new(),
            map_cursor: 0,
            outstanding_maps: HashMap::new(),
            reduce_groups: Vec::new(),
            reduce_cursor: 0,
            outstanding_reduces: HashMap::new(),
        };

        if manager.phase == Phase::Reducing {
            manager.open_reduce_iter()?;
        }

        Ok(manager)
    }

    fn set_phase(&mut self, phase: Phase) -> MapReduceResult<()> {
        self.conn.execute("update state set current_state = ?1", params![phase_code(phase)])?;
        self.phase = phase;
        Ok(())
    }

    /// Reads the full `map_results` table back in key order and groups it
    /// exactly as the in-memory manager groups its `BTreeMap`, using a
    /// dedicated read statement so it never contends with the `insert`
    /// statements `map_done` issues.
    fn open_reduce_iter(&mut self) -> MapReduceResult<()> {
        let mut stmt = self.conn.prepare("select key, value from map_results order by key asc")?;
        let rows = stmt.query_map([], |row| {
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

        let mut groups = Vec::new();
        for (key, values) in group_consecutive(pairs) {
            let k_mid: Value = serde_json::from_str(&key)?;
            groups.push((k_mid, values));
        }

        self.reduce_groups = groups;
        self.reduce_cursor = 0;
        Ok(())
    }
}

impl TaskManager for SqliteTaskManager {
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
                    self.conn
                        .execute("insert into map_results (key, value) values (?1, ?2)", params![key, bytes])?;
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
            self.conn.execute(
                "insert into reduce_results (key, value) values (?1, ?2) \
                 on conflict(key) do update set value = excluded.value",
                params![row_key, bytes],
            )?;
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
    use crate::registry::JobDef;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn wordcount_datasource() -> MemoryDatasource {
        MemoryDatasource::new([(json!("a"), json!("x y x")), (json!("b"), json!("y z"))])
    }

    fn drain_until_reducing(manager: &mut SqliteTaskManager, job: &JobDef) {
        loop {
            match manager.next_task().unwrap() {
                Assignment::Map(MapPayload { k_in, v_in }) => {
                    let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                    for (k, v) in (job.mapfn)(&k_in, &v_in) {
                        groups.entry(canonical_key(&k)).or_default().push(v);
                    }
                    manager.map_done(MapDonePayload { k_in, groups }).unwrap();
                }
                _ => break,
            }
        }
    }

    #[test]
    fn s1_word_count_sqlite() {
        let job = wordcount::job();
        let conn = Connection::open_in_memory().unwrap();
        let mut manager = SqliteTaskManager::new(conn, Box::new(wordcount_datasource()), false).unwrap();

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

        let results: BTreeSet<(Value, Value)> = manager.results().unwrap().into_iter().collect();
        let expected: BTreeSet<(Value, Value)> =
            [(json!("x"), json!(2)), (json!("y"), json!(2)), (json!("z"), json!(1))]
                .into_iter()
                .collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn resuming_without_a_prior_state_row_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        let err = SqliteTaskManager::new(conn, Box::new(wordcount_datasource()), true).unwrap_err();
        assert!(matches!(err, MapReduceError::ResumeWithoutState));
    }

    #[test]
    fn resumes_after_restart_preserves_phase() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        let job = wordcount::job();

        {
            let conn = Connection::open(&path).unwrap();
            let mut manager = SqliteTaskManager::new(conn, Box::new(wordcount_datasource()), false).unwrap();
            drain_until_reducing(&mut manager, &job);
            assert_eq!(manager.phase(), Phase::Reducing);
        }

        // Simulated restart: a fresh connection and datasource, same store.
        let conn = Connection::open(&path).unwrap();
        let mut manager = SqliteTaskManager::new(conn, Box::new(wordcount_datasource()), true).unwrap();
        assert_eq!(manager.phase(), Phase::Reducing);

        loop {
            match manager.next_task().unwrap() {
                Assignment::Reduce(ReducePayload { key, values }) => {
                    let value = (job.reducefn)(key.base_key(), &values);
                    manager.reduce_done(key, value).unwrap();
                }
                Assignment::Disconnect => break,
                Assignment::Map(_) => panic!("resumed manager should not re-enter mapping"),
            }
        }

        let results: BTreeSet<(Value, Value)> = manager.results().unwrap().into_iter().collect();
        let expected: BTreeSet<(Value, Value)> =
            [(json!("x"), json!(2)), (json!("y"), json!(2)), (json!("z"), json!(1))]
                .into_iter()
                .collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn late_duplicate_map_result_is_dropped() {
        let conn = Connection::open_in_memory().unwrap();
        let mut manager =
            SqliteTaskManager::new(conn, Box::new(MemoryDatasource::new([(json!("a"), json!("x"))])), false).unwrap();

        let Assignment::Map(MapPayload { k_in, .. }) = manager.next_task().unwrap() else {
            panic!("expected map")
        };

        let mut groups = BTreeMap::new();
        groups.insert(canonical_key(&json!("x")), vec![json!(1)]);
        manager.map_done(MapDonePayload { k_in: k_in.clone(), groups: groups.clone() }).unwrap();

        groups.insert(canonical_key(&json!("x")), vec![json!(1)]);
        manager.map_done(MapDonePayload { k_in, groups }).unwrap();

        let count: i64 = manager
            .conn
            .query_row("select count(*) from map_results where key = ?1", params!["\"x\""], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
