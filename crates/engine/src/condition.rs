//! Condition node evaluation.
//!
//! Comparisons are loosely typed: two values that both read as numbers
//! compare numerically, anything else compares by its string form. A missing
//! context key reads as `null`.

use std::cmp::Ordering;
use std::str::FromStr;

use serde_json::Value;

use crate::models::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    NotContains,
}

impl FromStr for ConditionOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equals"       => Ok(Self::Equals),
            "not_equals"   => Ok(Self::NotEquals),
            "greater_than" => Ok(Self::GreaterThan),
            "less_than"    => Ok(Self::LessThan),
            "contains"     => Ok(Self::Contains),
            "not_contains" => Ok(Self::NotContains),
            other          => Err(format!("unsupported operator: {other}")),
        }
    }
}

/// Evaluate `context[field] <operator> expected`.
///
/// An unsupported operator evaluates to `false`.
pub fn evaluate(ctx: &Context, field: &str, operator: &str, expected: &Value) -> bool {
    let actual = ctx.get(field).unwrap_or(&Value::Null);

    let Ok(operator) = operator.parse::<ConditionOperator>() else {
        return false;
    };

    match operator {
        ConditionOperator::Equals => loose_eq(actual, expected),
        ConditionOperator::NotEquals => !loose_eq(actual, expected),
        ConditionOperator::GreaterThan => compare(actual, expected) == Some(Ordering::Greater),
        ConditionOperator::LessThan => compare(actual, expected) == Some(Ordering::Less),
        ConditionOperator::Contains => contains(actual, expected),
        ConditionOperator::NotContains => !contains(actual, expected),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => as_text(a) == as_text(b),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() {
        return None;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(as_text(a).cmp(&as_text(b))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Null => false,
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        other => as_text(other).contains(&as_text(needle)),
    }
}
