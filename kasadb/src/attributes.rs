//! Attribute maps and the merge rule used by inserts and updates.
//!
//! Removal is expressed by merging `null` (or a blank string) over a key.

use serde_json::map::Entry;
use serde_json::{Map, Value};

/// Insertion-ordered attribute map.
pub type Attributes = Map<String, Value>;

/// Deep-merges `right` onto `left`, then strips null and blank leaves.
///
/// Nested objects present on both sides are merged recursively; in every
/// other case the right-hand value wins.
///
/// # Example
///
/// ```
/// use kasadb::attributes::merge;
/// use serde_json::json;
///
/// let left = json!({"a": 1, "nested": {"x": 1, "y": 2}});
/// let right = json!({"a": null, "nested": {"y": null, "z": 3}});
/// let merged = merge(left.as_object().unwrap().clone(), right.as_object().unwrap().clone());
/// assert_eq!(serde_json::Value::Object(merged), json!({"nested": {"x": 1, "z": 3}}));
/// ```
#[must_use]
pub fn merge(left: Attributes, right: Attributes) -> Attributes {
    strip(merge_maps(left, right))
}

/// Normalizes a fresh attribute map (merge onto an empty base).
#[must_use]
pub fn normalize(attributes: Attributes) -> Attributes {
    merge(Attributes::new(), attributes)
}

fn merge_maps(mut left: Attributes, right: Attributes) -> Attributes {
    for (key, value) in right {
        match left.entry(key) {
            Entry::Occupied(mut slot) => {
                let merged = match (slot.get_mut(), value) {
                    (Value::Object(existing), Value::Object(incoming)) => {
                        Value::Object(merge_maps(std::mem::take(existing), incoming))
                    }
                    (_, value) => value,
                };
                slot.insert(merged);
            }
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }
    left
}

fn strip(attributes: Attributes) -> Attributes {
    attributes
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::Object(map) => Some((key, Value::Object(strip(map)))),
            other => Some((key, other)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test helper expects an object"),
        }
    }

    #[test]
    fn test_update_merge_rule() {
        let existing = attrs(json!({"hello": "world", "foobar": 123, "object": {"a": 1, "b": "B"}}));
        let update = attrs(json!({"foobar": null, "gonzo": 456, "object": {"b": null, "c": 999}}));

        let merged = merge(existing, update);
        assert_eq!(
            Value::Object(merged),
            json!({"hello": "world", "gonzo": 456, "object": {"a": 1, "c": 999}})
        );
    }

    #[test]
    fn test_normalize_strips_blank_values() {
        let normalized = normalize(attrs(json!({
            "name": "Alice",
            "nick": "   ",
            "empty": "",
            "gone": null,
            "profile": {"bio": "\t\n", "age": 30}
        })));

        assert_eq!(Value::Object(normalized), json!({"name": "Alice", "profile": {"age": 30}}));
    }

    #[test]
    fn test_right_wins_for_non_objects() {
        let merged = merge(
            attrs(json!({"tags": ["a"], "value": {"x": 1}, "flag": true})),
            attrs(json!({"tags": ["b"], "value": 7, "flag": {"on": false}})),
        );
        assert_eq!(Value::Object(merged), json!({"tags": ["b"], "value": 7, "flag": {"on": false}}));
    }

    #[test]
    fn test_preserves_insertion_order() {
        let merged = merge(attrs(json!({"z": 1, "a": 2})), attrs(json!({"m": 3})));
        let keys: Vec<_> = merged.keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_arrays_are_kept_verbatim() {
        let normalized = normalize(attrs(json!({"list": [null, " ", 1]})));
        assert_eq!(Value::Object(normalized), json!({"list": [null, " ", 1]}));
    }
}
