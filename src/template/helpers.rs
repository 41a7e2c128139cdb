//! Built-in value helpers (`equals`, `concat`, `add`, ...).
//!
//! Helpers receive already-evaluated arguments and never touch the function
//! catalog or the scope chain.

use serde_json::{Map, Number, Value};

use crate::error::PlannerError;

use super::ast::Helper;
use super::value::{as_number, is_truthy, render};

/// Largest sequence `range` will build.
pub const MAX_RANGE_LEN: i64 = 10_000;

pub fn apply(
    helper: Helper,
    positional: Vec<Value>,
    named: Vec<(String, Value)>,
) -> Result<Value, PlannerError> {
    if helper != Helper::Object && !named.is_empty() {
        return Err(invalid(helper, "named arguments are not supported"));
    }

    match helper {
        Helper::Equals => {
            let [a, b] = exactly::<2>(helper, positional)?;
            Ok(Value::Bool(loosely_equal(&a, &b)))
        }
        Helper::NotEquals => {
            let [a, b] = exactly::<2>(helper, positional)?;
            Ok(Value::Bool(!loosely_equal(&a, &b)))
        }
        Helper::LessThan => compare(helper, positional, |a, b| a < b),
        Helper::GreaterThan => compare(helper, positional, |a, b| a > b),
        Helper::LessThanOrEqual => compare(helper, positional, |a, b| a <= b),
        Helper::GreaterThanOrEqual => compare(helper, positional, |a, b| a >= b),
        Helper::And => Ok(Value::Bool(positional.iter().all(is_truthy))),
        Helper::Or => Ok(Value::Bool(positional.iter().any(is_truthy))),
        Helper::Not => {
            let [a] = exactly::<1>(helper, positional)?;
            Ok(Value::Bool(!is_truthy(&a)))
        }
        Helper::Concat => Ok(Value::String(positional.iter().map(render).collect())),
        Helper::Array => Ok(Value::Array(positional)),
        Helper::Object => {
            if !positional.is_empty() {
                return Err(invalid(helper, "expects only named arguments"));
            }
            Ok(Value::Object(named.into_iter().collect::<Map<_, _>>()))
        }
        Helper::Range => {
            let [start, count] = exactly::<2>(helper, positional)?;
            let start = integer(helper, &start)?;
            let count = integer(helper, &count)?;
            if !(0..=MAX_RANGE_LEN).contains(&count) {
                return Err(invalid(
                    helper,
                    format!("count must be between 0 and {MAX_RANGE_LEN}, got {count}"),
                ));
            }
            let end = start
                .checked_add(count)
                .ok_or_else(|| invalid(helper, "range end overflows"))?;
            Ok(Value::Array((start..end).map(Value::from).collect()))
        }
        Helper::Json => {
            let [a] = exactly::<1>(helper, positional)?;
            Ok(match a {
                Value::String(s) => Value::String(s),
                other => Value::String(other.to_string()),
            })
        }
        Helper::Add => arithmetic(helper, positional, |a, b| a.checked_add(b), |a, b| a + b),
        Helper::Subtract => {
            let args = exactly::<2>(helper, positional)?;
            arithmetic(helper, args.into(), |a, b| a.checked_sub(b), |a, b| a - b)
        }
        Helper::Multiply => arithmetic(helper, positional, |a, b| a.checked_mul(b), |a, b| a * b),
        Helper::Divide => {
            let [a, b] = exactly::<2>(helper, positional)?;
            let a = number(helper, &a)?;
            let b = number(helper, &b)?;
            if b == 0.0 {
                return Err(PlannerError::TypeMismatch {
                    context: "divide".to_owned(),
                    detail: "division by zero".to_owned(),
                });
            }
            float(a / b)
        }
        Helper::Length => {
            let [a] = exactly::<1>(helper, positional)?;
            let len = match &a {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => {
                    return Err(PlannerError::TypeMismatch {
                        context: "length".to_owned(),
                        detail: format!("cannot take the length of {other}"),
                    });
                }
            };
            Ok(Value::from(len))
        }
    }
}

fn invalid(helper: Helper, detail: impl Into<String>) -> PlannerError {
    PlannerError::InvalidArguments {
        function: helper.name().to_owned(),
        detail: detail.into(),
    }
}

fn exactly<const N: usize>(helper: Helper, args: Vec<Value>) -> Result<[Value; N], PlannerError> {
    let got = args.len();
    args.try_into()
        .map_err(|_| invalid(helper, format!("expects {N} argument(s), got {got}")))
}

/// Equal as JSON, or equal once both sides are read as numbers or text.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => match (a, b) {
            (Value::String(_), Value::Number(_) | Value::Bool(_))
            | (Value::Number(_) | Value::Bool(_), Value::String(_)) => render(a) == render(b),
            _ => false,
        },
    }
}

fn number(helper: Helper, value: &Value) -> Result<f64, PlannerError> {
    as_number(value).ok_or_else(|| PlannerError::TypeMismatch {
        context: helper.name().to_owned(),
        detail: format!("expected a number, got {value}"),
    })
}

fn integer(helper: Helper, value: &Value) -> Result<i64, PlannerError> {
    if let Some(n) = as_integer(value) {
        return Ok(n);
    }
    let n = number(helper, value)?;
    // 2^63 as f64; anything at or past it does not fit in i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if !n.is_finite() || n.fract() != 0.0 || n < -LIMIT || n >= LIMIT {
        return Err(PlannerError::TypeMismatch {
            context: helper.name().to_owned(),
            detail: format!("expected an integer, got {value}"),
        });
    }
    Ok(n as i64)
}

fn float(f: f64) -> Result<Value, PlannerError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| PlannerError::TypeMismatch {
            context: "arithmetic".to_owned(),
            detail: "result is not a finite number".to_owned(),
        })
}

fn compare(
    helper: Helper,
    positional: Vec<Value>,
    op: fn(f64, f64) -> bool,
) -> Result<Value, PlannerError> {
    let [a, b] = exactly::<2>(helper, positional)?;
    Ok(Value::Bool(op(number(helper, &a)?, number(helper, &b)?)))
}

/// Fold `args` with `int_op` while every operand is an integer and nothing
/// overflows; otherwise fold as floats.
fn arithmetic(
    helper: Helper,
    args: Vec<Value>,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, PlannerError> {
    if args.len() < 2 {
        return Err(invalid(helper, format!("expects at least 2 arguments, got {}", args.len())));
    }
    let ints: Option<Vec<i64>> = args.iter().map(as_integer).collect();
    if let Some(ints) = ints {
        let folded = ints[1..]
            .iter()
            .try_fold(ints[0], |acc, &n| int_op(acc, n));
        if let Some(total) = folded {
            return Ok(Value::from(total));
        }
    }
    let floats = args
        .iter()
        .map(|v| number(helper, v))
        .collect::<Result<Vec<f64>, _>>()?;
    let total = floats[1..].iter().fold(floats[0], |acc, &n| float_op(acc, n));
    float(total)
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
