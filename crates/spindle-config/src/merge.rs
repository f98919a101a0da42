// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deep-merge for YAML cascade layers.

use serde_yaml::Value;

/// Merge `overlay` onto `base`, returning the combined value.
///
/// - Mappings merge per key, recursing; the overlay wins on conflicts.
/// - Sequences whose entries are mappings carrying an `id` key merge by id:
///   same-id entries are replaced by the overlay entry, new ids append in
///   overlay order.
/// - All other sequences, scalars, and type mismatches are replaced by the
///   overlay wholesale.
#[must_use]
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_val) => deep_merge(base_val, overlay_val),
                    None => overlay_val,
                };
                base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        (Value::Sequence(base_seq), Value::Sequence(overlay_seq)) => {
            if is_id_keyed(&base_seq) && is_id_keyed(&overlay_seq) {
                Value::Sequence(merge_by_id(base_seq, overlay_seq))
            } else {
                Value::Sequence(overlay_seq)
            }
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

fn is_id_keyed(seq: &[Value]) -> bool {
    !seq.is_empty()
        && seq.iter().all(|item| {
            item.as_mapping()
                .is_some_and(|m| m.contains_key(Value::String("id".into())))
        })
}

fn entry_id(item: &Value) -> Option<&str> {
    item.as_mapping()?
        .get(Value::String("id".into()))?
        .as_str()
}

fn merge_by_id(base: Vec<Value>, overlay: Vec<Value>) -> Vec<Value> {
    let mut out = base;
    for item in overlay {
        let id = entry_id(&item).map(ToString::to_string);
        match id.and_then(|id| out.iter().position(|e| entry_id(e) == Some(id.as_str()))) {
            Some(pos) => out[pos] = item,
            None => out.push(item),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn maps_merge_per_key() {
        let merged = deep_merge(yaml("a: 1\nb: {x: 1, y: 2}"), yaml("b: {y: 3}\nc: 4"));
        assert_eq!(merged, yaml("a: 1\nb: {x: 1, y: 3}\nc: 4"));
    }

    #[test]
    fn plain_lists_replace_wholesale() {
        let merged = deep_merge(yaml("tags: [a, b, c]"), yaml("tags: [z]"));
        assert_eq!(merged, yaml("tags: [z]"));
    }

    #[test]
    fn id_lists_replace_by_id_and_append() {
        let base = yaml("- {id: a, v: 1}\n- {id: b, v: 2}");
        let overlay = yaml("- {id: b, v: 9}\n- {id: c, v: 3}");
        let merged = deep_merge(base, overlay);
        assert_eq!(merged, yaml("- {id: a, v: 1}\n- {id: b, v: 9}\n- {id: c, v: 3}"));
    }

    #[test]
    fn null_overlay_keeps_base() {
        let merged = deep_merge(yaml("a: 1"), Value::Null);
        assert_eq!(merged, yaml("a: 1"));
    }

    #[test]
    fn scalar_overlay_replaces() {
        let merged = deep_merge(yaml("a: {deep: true}"), yaml("42"));
        assert_eq!(merged, yaml("42"));
    }
}
