// SPDX-License-Identifier: MIT OR Apache-2.0
//! The hook condition evaluator and `{placeholder}` interpolation.
//!
//! Deliberately not an expression language: dotted path lookup, a closed
//! operator set, and `all`/`any`/`not`. A minimal evaluator keeps hook
//! tables analyzable.

use serde_json::Value;
use spindle_core::{CmpOp, Condition};

/// Dotted lookup into a JSON context. Numeric segments index arrays.
#[must_use]
pub fn lookup_path<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = ctx;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(arr) => {
                let index: usize = segment.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Evaluate a condition against the ambient context.
///
/// Missing paths compare as null; a malformed regex never matches.
#[must_use]
pub fn evaluate_condition(condition: &Condition, ctx: &Value) -> bool {
    match condition {
        Condition::All(subs) => subs.iter().all(|c| evaluate_condition(c, ctx)),
        Condition::Any(subs) => subs.iter().any(|c| evaluate_condition(c, ctx)),
        Condition::Not(sub) => !evaluate_condition(sub, ctx),
        Condition::Cmp { path, op, value } => {
            let left = lookup_path(ctx, path).unwrap_or(&Value::Null);
            compare(left, *op, value)
        }
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    match op {
        CmpOp::Eq => left == right,
        CmpOp::Ne => left != right,
        CmpOp::Contains => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        CmpOp::Regex => match (left, right) {
            (Value::String(text), Value::String(pattern)) => regex::Regex::new(pattern)
                .map(|re| re.is_match(text))
                .unwrap_or(false),
            _ => false,
        },
        CmpOp::Gt | CmpOp::Lt | CmpOp::Gte | CmpOp::Lte => {
            let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                return false;
            };
            match op {
                CmpOp::Gt => l > r,
                CmpOp::Lt => l < r,
                CmpOp::Gte => l >= r,
                CmpOp::Lte => l <= r,
                _ => unreachable!(),
            }
        }
    }
}

/// Interpolate `{dotted.path}` placeholders from the context.
///
/// A string that is exactly one placeholder resolves to the looked-up
/// value itself (preserving its type); embedded placeholders are replaced
/// with their string form. Unresolvable placeholders are left intact.
/// Objects and arrays interpolate recursively.
#[must_use]
pub fn interpolate(template: &Value, ctx: &Value) -> Value {
    match template {
        Value::String(s) => interpolate_string(s, ctx),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate(v, ctx)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate(v, ctx)).collect()),
        other => other.clone(),
    }
}

fn interpolate_string(s: &str, ctx: &Value) -> Value {
    // Whole-string placeholder: preserve the value's type.
    if s.len() > 2 && s.starts_with('{') && s.ends_with('}') && !s[1..s.len() - 1].contains('{') {
        let path = &s[1..s.len() - 1];
        if let Some(value) = lookup_path(ctx, path) {
            return value.clone();
        }
        return Value::String(s.to_string());
    }

    let mut out = String::new();
    let mut rest = s;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let path = &after[..close];
                match lookup_path(ctx, path) {
                    Some(Value::String(v)) => out.push_str(v),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        out.push('{');
                        out.push_str(path);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "event": {"name": "limit", "code": "spend_exceeded"},
            "cost": {"turns": 7, "spend": 0.42},
            "directive": {"name": "spindle/agent/review"},
            "tags": ["a", "b"],
        })
    }

    #[test]
    fn path_lookup_walks_objects_and_arrays() {
        let ctx = ctx();
        assert_eq!(lookup_path(&ctx, "event.code").unwrap(), "spend_exceeded");
        assert_eq!(lookup_path(&ctx, "tags.1").unwrap(), "b");
        assert!(lookup_path(&ctx, "event.missing").is_none());
        assert!(lookup_path(&ctx, "cost.turns.deeper").is_none());
    }

    #[test]
    fn comparison_operators() {
        let ctx = ctx();
        let check = |path: &str, op, value| {
            evaluate_condition(
                &Condition::Cmp {
                    path: path.into(),
                    op,
                    value,
                },
                &ctx,
            )
        };
        assert!(check("event.code", CmpOp::Eq, json!("spend_exceeded")));
        assert!(check("event.code", CmpOp::Ne, json!("turns_exceeded")));
        assert!(check("cost.turns", CmpOp::Gt, json!(5)));
        assert!(check("cost.turns", CmpOp::Lte, json!(7)));
        assert!(!check("cost.turns", CmpOp::Lt, json!(7)));
        assert!(check("event.code", CmpOp::Contains, json!("spend")));
        assert!(check("tags", CmpOp::Contains, json!("a")));
        assert!(check("directive.name", CmpOp::Regex, json!("^spindle/agent/")));
        assert!(!check("directive.name", CmpOp::Regex, json!("[unclosed")));
    }

    #[test]
    fn combinators() {
        let ctx = ctx();
        let eq = |path: &str, value| Condition::Cmp {
            path: path.into(),
            op: CmpOp::Eq,
            value,
        };
        assert!(evaluate_condition(
            &Condition::All(vec![
                eq("event.name", json!("limit")),
                eq("event.code", json!("spend_exceeded")),
            ]),
            &ctx,
        ));
        assert!(evaluate_condition(
            &Condition::Any(vec![
                eq("event.name", json!("nope")),
                eq("event.name", json!("limit")),
            ]),
            &ctx,
        ));
        assert!(evaluate_condition(
            &Condition::Not(Box::new(eq("event.name", json!("nope")))),
            &ctx,
        ));
    }

    #[test]
    fn missing_path_compares_as_null() {
        let ctx = ctx();
        assert!(evaluate_condition(
            &Condition::Cmp {
                path: "does.not.exist".into(),
                op: CmpOp::Eq,
                value: Value::Null,
            },
            &ctx,
        ));
    }

    #[test]
    fn whole_string_placeholder_preserves_type() {
        let ctx = ctx();
        let result = interpolate(&json!("{cost.turns}"), &ctx);
        assert_eq!(result, json!(7));
    }

    #[test]
    fn embedded_placeholders_stringify() {
        let ctx = ctx();
        let result = interpolate(
            &json!("turn {cost.turns} of {directive.name}"),
            &ctx,
        );
        assert_eq!(result, json!("turn 7 of spindle/agent/review"));
    }

    #[test]
    fn unresolved_placeholders_stay_intact() {
        let ctx = ctx();
        assert_eq!(
            interpolate(&json!("{missing.path}"), &ctx),
            json!("{missing.path}")
        );
        assert_eq!(
            interpolate(&json!("x {missing.path} y"), &ctx),
            json!("x {missing.path} y")
        );
    }

    #[test]
    fn nested_structures_interpolate() {
        let ctx = ctx();
        let result = interpolate(
            &json!({"params": {"code": "{event.code}", "list": ["{cost.spend}"]}}),
            &ctx,
        );
        assert_eq!(result["params"]["code"], "spend_exceeded");
        assert_eq!(result["params"]["list"][0], 0.42);
    }
}
