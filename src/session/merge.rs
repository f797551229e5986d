//! Deterministic recursive merge of tool-configuration documents.
//!
//! Conflict policy: when a key exists on both sides and both values are
//! objects, merge them recursively; in every other case (scalar, array, null,
//! or a type mismatch) the override replaces the base value wholesale.

use serde_json::Value;

pub fn deep_merge(base: Value, overrides: Value) -> Value {
    match (base, overrides) {
        (Value::Object(mut base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(slot) => {
                        let existing = slot.take();
                        *slot = deep_merge(existing, value);
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Value::Object(base)
        }
        (_, overrides) => overrides,
    }
}
