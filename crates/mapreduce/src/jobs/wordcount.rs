//! The bundled word-count job (scenario `S1` in the spec): `mapfn` splits a
//! string value into `(word, 1)` pairs, `reducefn`/`collectfn` sum.

use crate::datasource::MemoryDatasource;
use crate::registry::JobDef;
use serde_json::{json, Value};

fn mapfn(_k_in: &Value, v_in: &Value) -> Vec<(Value, Value)> {
    v_in.as_str()
        .unwrap_or_default()
        .split_whitespace()
        .map(|word| (json!(word), json!(1)))
        .collect()
}

fn sum(_k_mid: &Value, values: &[Value]) -> Value {
    let total: i64 = values.iter().filter_map(Value::as_i64).sum();
    json!(total)
}

pub fn job() -> JobDef {
    JobDef { name: "wordcount", mapfn, reducefn: sum, collectfn: Some(sum) }
}

/// The datasource the `--job wordcount` CLI selector runs against. The
/// datasource itself is an external collaborator per the spec's scope note;
/// this is the small fixed corpus the bundled job demo ships with.
pub fn demo_datasource() -> MemoryDatasource {
    MemoryDatasource::new([
        (json!("line-1"), json!("the quick brown fox jumps over the lazy dog")),
        (json!("line-2"), json!("the dog barks at the fox in the quick night")),
        (json!("line-3"), json!("a lazy cat watches the quick fox and the dog")),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_words_to_ones() {
        let pairs = mapfn(&json!("a"), &json!("x y x"));
        assert_eq!(pairs, vec![(json!("x"), json!(1)), (json!("y"), json!(1)), (json!("x"), json!(1))]);
    }

    #[test]
    fn reduces_by_summing() {
        assert_eq!(sum(&json!("x"), &[json!(1), json!(1), json!(1)]), json!(3));
    }
}
