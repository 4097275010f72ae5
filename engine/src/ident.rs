//! Identity tokens and value ordering.
//!
//! Every entity gets a process-local client id at construction; every emitter
//! gets a listen id. Both come from the same thread-local counter (the engine
//! is single-threaded by contract). Neither is ever persisted.

use std::cell::Cell;
use std::cmp::Ordering;

use serde_json::Value;

use crate::{ClientId, EmitterId};

thread_local! {
    static NEXT_TOKEN: Cell<u64> = const { Cell::new(1) };
}

fn next_token() -> u64 {
    NEXT_TOKEN.with(|t| {
        let id = t.get();
        t.set(id + 1);
        id
    })
}

/// Allocate a client id for a new entity.
pub(crate) fn next_client_id() -> ClientId {
    next_token()
}

/// Allocate a listen id for a new emitter.
pub(crate) fn next_emitter_id() -> EmitterId {
    next_token()
}

/// Canonical index key for an entity id value.
///
/// `Null` means "no identity" and produces no key, so two members of a set
/// may both lack an id without colliding. Strings map to themselves, numbers
/// and booleans to their display form, anything else to its JSON text.
pub fn id_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Total order over JSON values, used by attribute-name comparators.
///
/// Ordering rules:
/// 1. Type rank: null < bool < number < string < array < object
/// 2. Numbers compare numerically, strings lexicographically
/// 3. Arrays element-wise, objects by their JSON text
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

pub fn value_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = value_cmp(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
