//! Condition expression evaluator.

use serde_json::Value;

use super::ast::{CompareOp, Expression, Operand};
use crate::ExecutionContext;

/// Evaluate a condition expression against a run's context.
///
/// Unknown references evaluate as `null`.  Comparisons between values of
/// incompatible types are `false` (except `!=`, which is `true`).
pub fn evaluate(expr: &Expression, ctx: &ExecutionContext) -> bool {
    match expr {
        Expression::Compare { left, op, right } => {
            compare(&operand_value(left, ctx), *op, &operand_value(right, ctx))
        }
        Expression::Truthy(operand) => truthy(&operand_value(operand, ctx)),
        Expression::And(left, right) => evaluate(left, ctx) && evaluate(right, ctx),
        Expression::Or(left, right) => evaluate(left, ctx) || evaluate(right, ctx),
        Expression::Not(inner) => !evaluate(inner, ctx),
    }
}

fn operand_value(operand: &Operand, ctx: &ExecutionContext) -> Value {
    match operand {
        Operand::Literal(lit) => lit.to_value(),
        Operand::Reference(path) => ctx.lookup(path).cloned().unwrap_or(Value::Null),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::NotEq => !values_equal(left, right),
        CompareOp::Gt => ordering(left, right).is_some_and(|o| o.is_gt()),
        CompareOp::Gte => ordering(left, right).is_some_and(|o| o.is_ge()),
        CompareOp::Lt => ordering(left, right).is_some_and(|o| o.is_lt()),
        CompareOp::Lte => ordering(left, right).is_some_and(|o| o.is_le()),
        CompareOp::Contains => contains(left, right),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}
