//! Layered configuration merge.
//!
//! Precedence, lowest to highest: context defaults, spec parameters, CLI
//! overrides, `overwrite_dict`. Mappings merge recursively; any other collision
//! is won outright by the higher layer.

use crate::errors::{LaunchError, Result};
use serde_json::{Map, Value};

pub const OVERWRITE_KEY: &str = "overwrite_dict";

pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            Value::Object(deep_merge_maps(base_map, overlay_map))
        }
        (_, overlay) => overlay.clone(),
    }
}

pub fn deep_merge_maps(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (k, v) in overlay {
        let value = match base.get(k) {
            Some(base_v) => deep_merge(base_v, v),
            None => v.clone(),
        };
        merged.insert(k.clone(), value);
    }
    merged
}

/// Combines every source into one flat record.
///
/// `overwrite_dict` may come from any layer (normally the spec) and is applied
/// as a final pass after the explicit `overwrite` argument has been folded into
/// it; it never survives into the output. Fails with a validation error if no
/// layer supplied `backend_type`.
pub fn merge(
    cli_overrides: &Map<String, Value>,
    spec_parameters: &Map<String, Value>,
    context_defaults: &Map<String, Value>,
    overwrite: Option<&Map<String, Value>>,
) -> Result<Map<String, Value>> {
    let mut merged = deep_merge_maps(context_defaults, spec_parameters);
    merged = deep_merge_maps(&merged, cli_overrides);

    let embedded = match merged.remove(OVERWRITE_KEY) {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(LaunchError::validation(format!(
                "\"{}\" must be a mapping, got {}",
                OVERWRITE_KEY, other
            )))
        }
    };
    let final_layer = match overwrite {
        Some(explicit) => deep_merge_maps(&embedded, explicit),
        None => embedded,
    };
    merged = deep_merge_maps(&merged, &final_layer);
    merged.remove(OVERWRITE_KEY);

    match merged.get("backend_type") {
        Some(Value::String(s)) if !s.is_empty() => Ok(merged),
        _ => Err(LaunchError::validation(
            "merged experiment has no \"backend_type\"",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn nested_mappings_merge_and_scalars_replace() {
        let merged = deep_merge(&json!({"a": 1, "b": {"x": 1}}), &json!({"b": {"y": 2}, "c": 3}));
        assert_eq!(merged, json!({"a": 1, "b": {"x": 1, "y": 2}, "c": 3}));
        assert_eq!(deep_merge(&json!({"a": 1}), &json!({"a": 2})), json!({"a": 2}));
    }

    #[test]
    fn lists_are_not_concatenated() {
        let merged = deep_merge(&json!({"tags": ["a", "b"]}), &json!({"tags": ["c"]}));
        assert_eq!(merged, json!({"tags": ["c"]}));
    }

    #[test]
    fn precedence_is_context_spec_cli_overwrite() {
        let context = obj(json!({"backend_type": "slurm", "partition": "ctx", "time": "ctx", "account": "ctx", "ntasks": "ctx"}));
        let spec = obj(json!({"partition": "spec", "time": "spec", "account": "spec",
            "overwrite_dict": {"partition": "overwrite"}}));
        let cli = obj(json!({"partition": "cli", "time": "cli"}));
        let merged = merge(&cli, &spec, &context, None).expect("merge");
        assert_eq!(merged["partition"], json!("overwrite"));
        assert_eq!(merged["time"], json!("cli"));
        assert_eq!(merged["account"], json!("spec"));
        assert_eq!(merged["ntasks"], json!("ctx"));
        assert!(!merged.contains_key(OVERWRITE_KEY));
    }

    #[test]
    fn env_collisions_resolve_last_writer_wins() {
        let context = obj(json!({"backend_type": "local", "env": {"A": "ctx", "B": "ctx"}}));
        let spec = obj(json!({"env": {"B": "spec", "C": "spec"}, "overwrite_dict": {"env": {"C": "final"}}}));
        let cli = obj(json!({"env": {"A": "cli"}}));
        let merged = merge(&cli, &spec, &context, None).expect("merge");
        assert_eq!(merged["env"], json!({"A": "cli", "B": "spec", "C": "final"}));
    }

    #[test]
    fn explicit_overwrite_beats_embedded_one() {
        let spec = obj(json!({"backend_type": "local", "overwrite_dict": {"time": "embedded"}}));
        let explicit = obj(json!({"time": "explicit"}));
        let merged = merge(&Map::new(), &spec, &Map::new(), Some(&explicit)).expect("merge");
        assert_eq!(merged["time"], json!("explicit"));
    }

    #[test]
    fn overwrite_can_supply_backend_type() {
        let spec = obj(json!({"overwrite_dict": {"backend_type": "local"}}));
        let merged = merge(&Map::new(), &spec, &Map::new(), None).expect("merge");
        assert_eq!(merged["backend_type"], json!("local"));
    }

    #[test]
    fn missing_backend_type_is_validation_error() {
        let err = merge(&Map::new(), &obj(json!({"a": 1})), &Map::new(), None).expect_err("fails");
        assert!(matches!(err, LaunchError::Validation(_)));
    }

    #[test]
    fn non_mapping_overwrite_is_rejected() {
        let spec = obj(json!({"backend_type": "local", "overwrite_dict": [1, 2]}));
        assert!(merge(&Map::new(), &spec, &Map::new(), None).is_err());
    }

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,6}".prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ]
    }

    fn tree() -> impl Strategy<Value = Value> {
        scalar().prop_recursive(3, 24, 4, |inner| {
            prop::collection::btree_map("[a-d]", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect()))
        })
    }

    proptest! {
        #[test]
        fn merging_with_self_is_identity(v in tree()) {
            prop_assert_eq!(deep_merge(&v, &v), v);
        }

        #[test]
        fn overlay_keys_always_win_on_scalars(base in tree(), key in "[a-d]", s in scalar()) {
            let overlay = json!({ key.clone(): s.clone() });
            let merged = deep_merge(&base, &overlay);
            prop_assert_eq!(&merged[&key], &s);
        }

        #[test]
        fn disjoint_merges_are_associative(
            a in prop::collection::btree_map("[a-c]", scalar(), 0..3),
            b in prop::collection::btree_map("[d-f]", scalar(), 0..3),
            c in prop::collection::btree_map("[g-i]", scalar(), 0..3),
        ) {
            let to_value = |m: std::collections::BTreeMap<String, Value>| Value::Object(m.into_iter().collect());
            let (a, b, c) = (to_value(a), to_value(b), to_value(c));
            let left = deep_merge(&deep_merge(&a, &b), &c);
            let right = deep_merge(&a, &deep_merge(&b, &c));
            prop_assert_eq!(left, right);
        }
    }
}
