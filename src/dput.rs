//! Delta-put merge helper (spec §4.5 / §1 "specified only at interface
//! level"). Ported in spirit from `store.py`'s `data_merge`/`dot2dict`: JSON
//! object fields merge recursively, list updates extend or merge-by-`name`,
//! scalars overwrite.

use serde_json::{Map, Value};

/// Recursively merge `updates` into `base`, returning the merged value.
///
/// - scalar/`null` `base` is replaced outright by `updates`.
/// - object `base` merges key-by-key, recursing when both sides share a key.
/// - array `base` merges element-wise by a shared `"name"` field when every
///   element of `updates` is an object and at least one `base` element
///   shares a `name` with an `updates` element; otherwise `updates` is
///   appended wholesale.
pub fn merge(base: Value, updates: Value) -> Value {
    match base {
        Value::Object(base_map) => merge_object(base_map, updates),
        Value::Array(base_vec) => merge_array(base_vec, updates),
        _ => updates,
    }
}

fn merge_object(mut base: Map<String, Value>, updates: Value) -> Value {
    let Value::Object(updates) = updates else {
        return Value::Object(base);
    };
    for (key, update_val) in updates {
        match base.remove(&key) {
            Some(existing) => {
                base.insert(key, merge(existing, update_val));
            }
            None => {
                base.insert(key, update_val);
            }
        }
    }
    Value::Object(base)
}

fn merge_array(mut base: Vec<Value>, updates: Value) -> Value {
    let Value::Array(updates) = updates else {
        base.push(updates);
        return Value::Array(base);
    };

    let all_objects = updates.iter().all(Value::is_object);
    let update_names: Vec<Option<&str>> = updates.iter().map(name_of).collect();
    let any_shared_name = all_objects
        && base
            .iter()
            .any(|item| update_names.iter().any(|n| n.is_some() && *n == name_of(item)));

    if all_objects && any_shared_name {
        for update_item in updates {
            let update_name = name_of(&update_item).map(str::to_string);
            if let Some(name) = &update_name {
                if let Some(existing) = base.iter_mut().find(|item| name_of(item) == Some(name.as_str())) {
                    let taken = std::mem::replace(existing, Value::Null);
                    *existing = merge(taken, update_item);
                    continue;
                }
            }
            base.push(update_item);
        }
        Value::Array(base)
    } else {
        base.extend(updates);
        Value::Array(base)
    }
}

fn name_of(v: &Value) -> Option<&str> {
    v.as_object()?.get("name")?.as_str()
}

/// Turn `a.b.c` + a value into the nested object `{"a":{"b":{"c": value}}}`
/// (`dot2dict` in the original).
pub fn dot_to_value(dotted_key: &str, value: &str) -> Value {
    let mut parts: Vec<&str> = dotted_key.split('.').collect();
    let leaf = parts.pop().unwrap_or(dotted_key);
    let mut node = Value::String(value.to_string());
    node = {
        let mut obj = Map::new();
        obj.insert(leaf.to_string(), node);
        Value::Object(obj)
    };
    for part in parts.into_iter().rev() {
        let mut obj = Map::new();
        obj.insert(part.to_string(), node);
        node = Value::Object(obj);
    }
    node
}

/// Split a `uri#k1=v1&k2=v2` inline delta-put suffix into `(base_uri, pairs)`.
/// Returns `(uri, vec![])` if there's no `#` suffix.
pub fn split_inline_patch(uri: &str) -> (&str, Vec<(&str, &str)>) {
    match uri.split_once('#') {
        None => (uri, Vec::new()),
        Some((base, suffix)) => {
            let pairs = suffix
                .split('&')
                .filter(|tok| !tok.is_empty())
                .filter_map(|tok| tok.split_once('='))
                .collect();
            (base, pairs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_base_is_overwritten() {
        assert_eq!(merge(json!(1), json!(2)), json!(2));
        assert_eq!(merge(Value::Null, json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn object_merge_recurses_on_shared_keys() {
        let base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        let updates = json!({"a": {"b": 10}, "e": 4});
        assert_eq!(merge(base, updates), json!({"a": {"b": 10, "c": 2}, "d": 3, "e": 4}));
    }

    #[test]
    fn empty_patch_is_idempotent() {
        let base = json!({"a": 1, "b": [1, 2]});
        assert_eq!(merge(base.clone(), json!({})), base);
    }

    #[test]
    fn array_merges_by_shared_name_field() {
        let base = json!([{"name": "x", "v": 1}, {"name": "y", "v": 2}]);
        let updates = json!([{"name": "x", "v": 99}]);
        assert_eq!(merge(base, updates), json!([{"name": "x", "v": 99}, {"name": "y", "v": 2}]));
    }

    #[test]
    fn array_extends_when_no_shared_name() {
        let base = json!([1, 2]);
        let updates = json!([3, 4]);
        assert_eq!(merge(base, updates), json!([1, 2, 3, 4]));
    }

    #[test]
    fn dot_to_value_builds_nested_object() {
        assert_eq!(dot_to_value("a.b.c", "v"), json!({"a": {"b": {"c": "v"}}}));
        assert_eq!(dot_to_value("status", "run"), json!({"status": "run"}));
    }

    #[test]
    fn inline_patch_splits_pairs() {
        let (base, pairs) = split_inline_patch("/r/a/x#status=run&entity_data.memory=2GB");
        assert_eq!(base, "/r/a/x");
        assert_eq!(pairs, vec![("status", "run"), ("entity_data.memory", "2GB")]);
    }

    #[test]
    fn no_hash_suffix_yields_empty_pairs() {
        let (base, pairs) = split_inline_patch("/r/a/x");
        assert_eq!(base, "/r/a/x");
        assert!(pairs.is_empty());
    }
}
