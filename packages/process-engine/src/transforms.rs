//! Built-in transform functions.
//!
//! List selectors (`FirstValue`, `LastValue`, `Random`) pass non-list input
//! through unchanged; string functions (`UpperCase`, `LowerCase`, `Trim`)
//! pass non-string input through unchanged.

use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use crate::error::ProcessError;
use crate::id::Ref;
use crate::model::Function;
use crate::registry::{Transform, TransformRegistry};

pub const FIRST_VALUE: Ref<Function> = Ref::from_static("process:function:FirstValue");
pub const LAST_VALUE: Ref<Function> = Ref::from_static("process:function:LastValue");
pub const RANDOM: Ref<Function> = Ref::from_static("process:function:Random");
pub const UPPER_CASE: Ref<Function> = Ref::from_static("process:function:UpperCase");
pub const LOWER_CASE: Ref<Function> = Ref::from_static("process:function:LowerCase");
pub const TRIM: Ref<Function> = Ref::from_static("process:function:Trim");

const BUILTINS: [Ref<Function>; 6] = [FIRST_VALUE, LAST_VALUE, RANDOM, UPPER_CASE, LOWER_CASE, TRIM];

pub(crate) fn is_builtin(id: &Ref<Function>) -> bool {
    BUILTINS.contains(id)
}

pub(crate) fn register_builtins(registry: &mut TransformRegistry, seed: Option<u64>) {
    registry.register(FIRST_VALUE, first_value);
    registry.register(LAST_VALUE, last_value);
    registry.register(RANDOM, Random::new(seed));
    registry.register(UPPER_CASE, upper_case);
    registry.register(LOWER_CASE, lower_case);
    registry.register(TRIM, trim);
}

fn first_value(value: Value) -> Result<Value, ProcessError> {
    Ok(match value {
        Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
        other => other,
    })
}

fn last_value(value: Value) -> Result<Value, ProcessError> {
    Ok(match value {
        Value::Array(items) => items.into_iter().last().unwrap_or(Value::Null),
        other => other,
    })
}

fn upper_case(value: Value) -> Result<Value, ProcessError> {
    Ok(match value {
        Value::String(s) => Value::String(s.to_uppercase()),
        other => other,
    })
}

fn lower_case(value: Value) -> Result<Value, ProcessError> {
    Ok(match value {
        Value::String(s) => Value::String(s.to_lowercase()),
        other => other,
    })
}

fn trim(value: Value) -> Result<Value, ProcessError> {
    Ok(match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other,
    })
}

/// Picks a uniformly random element of a list.
pub struct Random {
    rng: Mutex<fastrand::Rng>,
}

impl Random {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self { rng: Mutex::new(rng) }
    }
}

impl Transform for Random {
    fn apply(&self, value: Value) -> Result<Value, ProcessError> {
        Ok(match value {
            Value::Array(mut items) if !items.is_empty() => {
                let index = self
                    .rng
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .usize(..items.len());
                items.swap_remove(index)
            }
            Value::Array(_) => Value::Null,
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_ids() {
        assert!(is_builtin(&TRIM));
        assert!(!is_builtin(&Ref::new("custom:function:Trim")));
    }

    #[test]
    fn test_list_selectors() {
        assert_eq!(first_value(json!([1, 2, 3])).unwrap(), json!(1));
        assert_eq!(last_value(json!([1, 2, 3])).unwrap(), json!(3));
        assert_eq!(first_value(json!([])).unwrap(), Value::Null);
    }

    #[test]
    fn test_list_selectors_pass_through_non_lists() {
        assert_eq!(first_value(json!("x")).unwrap(), json!("x"));
        assert_eq!(last_value(json!({ "a": 1 })).unwrap(), json!({ "a": 1 }));
        assert_eq!(Random::new(Some(1)).apply(json!(5)).unwrap(), json!(5));
    }

    #[test]
    fn test_random_is_deterministic_with_seed() {
        let items = json!(["a", "b", "c", "d", "e"]);
        let first = Random::new(Some(42));
        let second = Random::new(Some(42));
        for _ in 0..10 {
            let a = first.apply(items.clone()).unwrap();
            let b = second.apply(items.clone()).unwrap();
            assert_eq!(a, b);
            assert!(items.as_array().unwrap().contains(&a));
        }
    }

    #[test]
    fn test_random_on_empty_list_is_null() {
        assert_eq!(Random::new(None).apply(json!([])).unwrap(), Value::Null);
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(upper_case(json!("MiXed")).unwrap(), json!("MIXED"));
        assert_eq!(lower_case(json!("MiXed")).unwrap(), json!("mixed"));
        assert_eq!(trim(json!("  pad  ")).unwrap(), json!("pad"));
    }

    #[test]
    fn test_string_functions_pass_through_non_strings() {
        assert_eq!(upper_case(json!(3)).unwrap(), json!(3));
        assert_eq!(lower_case(json!(null)).unwrap(), json!(null));
        assert_eq!(trim(json!(["  a "])).unwrap(), json!(["  a "]));
    }
}
