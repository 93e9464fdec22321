//! Evaluator: reduces an expression tree against a variable scope

use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::parser::{BinaryOp, Expr, Path, Segment, UnaryOp};
use super::ExpressionError;

/// Evaluate a parsed expression against `scope`
pub fn eval(expr: &Expr, scope: &Map<String, Value>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => resolve(path, scope),
        Expr::Unary { op, operand } => {
            let value = eval(operand, scope)?;
            match op {
                UnaryOp::Not => match value {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(mismatch("!", &other, None)),
                },
                UnaryOp::Negate => negate(&value),
            }
        }
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => {
                if !expect_bool(op, eval(left, scope)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(expect_bool(op, eval(right, scope)?)?))
            }
            BinaryOp::Or => {
                if expect_bool(op, eval(left, scope)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(expect_bool(op, eval(right, scope)?)?))
            }
            _ => {
                let l = eval(left, scope)?;
                let r = eval(right, scope)?;
                apply(*op, &l, &r)
            }
        },
    }
}

fn resolve(path: &Path, scope: &Map<String, Value>) -> Result<Value, ExpressionError> {
    let mut current = scope
        .get(&path.root)
        .ok_or_else(|| ExpressionError::UnknownVariable(path.root.clone()))?;
    let mut rendered = path.root.clone();

    for segment in &path.segments {
        match segment {
            Segment::Field(name) => {
                rendered.push('.');
                rendered.push_str(name);
                current = current
                    .as_object()
                    .and_then(|obj| obj.get(name))
                    .ok_or_else(|| ExpressionError::UnknownVariable(rendered.clone()))?;
            }
            Segment::Index(index_expr) => {
                let index = eval(index_expr, scope)?;
                rendered.push_str(&format!("[{}]", index));
                let next = match (&index, current) {
                    (Value::Number(n), Value::Array(items)) => n
                        .as_u64()
                        .and_then(|i| usize::try_from(i).ok())
                        .and_then(|i| items.get(i)),
                    (Value::String(key), Value::Object(obj)) => obj.get(key),
                    _ => None,
                };
                current = next.ok_or_else(|| ExpressionError::UnknownVariable(rendered.clone()))?;
            }
        }
    }

    Ok(current.clone())
}

fn apply(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(op, l, r)?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add if l.is_string() || r.is_string() => {
            Ok(Value::String(format!("{}{}", display(l), display(r))))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, l, r)
        }
        BinaryOp::And | BinaryOp::Or => unreachable_logic(op),
    }
}

// Logical operators short-circuit in `eval` and never reach `apply`.
fn unreachable_logic(op: BinaryOp) -> Result<Value, ExpressionError> {
    Err(ExpressionError::TypeMismatch(format!(
        "operator {} evaluated without operands",
        op.symbol()
    )))
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExpressionError> {
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(mismatch(op.symbol(), l, Some(r)));
    };

    // Integer operands stay integers while the result is exact
    if let (Some(x), Some(y)) = (l.as_i64(), r.as_i64()) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div => {
                if y == 0 {
                    return Err(ExpressionError::DivisionByZero);
                }
                if x % y == 0 {
                    x.checked_div(y)
                } else {
                    None
                }
            }
            _ => {
                if y == 0 {
                    return Err(ExpressionError::DivisionByZero);
                }
                x.checked_rem(y)
            }
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }

    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            a / b
        }
        _ => {
            if b == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            a % b
        }
    };

    finite(result)
}

fn negate(value: &Value) -> Result<Value, ExpressionError> {
    if let Some(n) = value.as_i64() {
        if let Some(neg) = n.checked_neg() {
            return Ok(Value::from(neg));
        }
    }
    match value.as_f64() {
        Some(f) => finite(-f),
        None => Err(mismatch("-", value, None)),
    }
}

fn finite(result: f64) -> Result<Value, ExpressionError> {
    if result.is_finite() {
        Ok(Value::from(result))
    } else {
        Err(ExpressionError::InvalidNumber(result.to_string()))
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<Ordering, ExpressionError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b))
            .ok_or_else(|| mismatch(op.symbol(), l, Some(r))),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(mismatch(op.symbol(), l, Some(r))),
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => l == r,
    }
}

fn expect_bool(op: &BinaryOp, value: Value) -> Result<bool, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(mismatch(op.symbol(), &other, None)),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(operator: &str, left: &Value, right: Option<&Value>) -> ExpressionError {
    let message = match right {
        Some(r) => format!(
            "operator {} cannot be applied to {} and {}",
            operator,
            type_name(left),
            type_name(r)
        ),
        None => format!("operator {} cannot be applied to {}", operator, type_name(left)),
    };
    ExpressionError::TypeMismatch(message)
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;
    use serde_json::json;

    fn scope(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn run(expr: &str, vars: Value) -> Result<Value, ExpressionError> {
        eval(&parse(expr).unwrap(), &scope(vars))
    }

    #[test]
    fn test_integer_arithmetic_stays_integer() {
        assert_eq!(run("x + 1", json!({"x": 1})).unwrap(), json!(2));
        assert_eq!(run("10 / 2", json!({})).unwrap(), json!(5));
        assert_eq!(run("7 % 4", json!({})).unwrap(), json!(3));
    }

    #[test]
    fn test_inexact_division_is_float() {
        assert_eq!(run("7 / 2", json!({})).unwrap(), json!(3.5));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            run("1 / zero", json!({"zero": 0})),
            Err(ExpressionError::DivisionByZero)
        );
    }

    #[test]
    fn test_mixed_number_equality() {
        assert_eq!(run("a == 2", json!({"a": 2.0})).unwrap(), json!(true));
        assert_eq!(run("a != 2", json!({"a": 2})).unwrap(), json!(false));
    }

    #[test]
    fn test_string_comparison_and_concat() {
        assert_eq!(run("'abc' < 'abd'", json!({})).unwrap(), json!(true));
        assert_eq!(
            run("'order-' + id", json!({"id": 42})).unwrap(),
            json!("order-42")
        );
    }

    #[test]
    fn test_dotted_path_lookup() {
        let vars = json!({"var": {"status": "approved"}});
        assert_eq!(
            run("var.status == 'approved'", vars).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_unknown_variable_reports_full_path() {
        assert_eq!(
            run("var.missing == 1", json!({"var": {}})),
            Err(ExpressionError::UnknownVariable("var.missing".into()))
        );
        assert_eq!(
            run("nope", json!({})),
            Err(ExpressionError::UnknownVariable("nope".into()))
        );
    }

    #[test]
    fn test_short_circuit_skips_unknown_variable() {
        assert_eq!(run("false && missing", json!({})).unwrap(), json!(false));
        assert_eq!(run("true || missing", json!({})).unwrap(), json!(true));
    }

    #[test]
    fn test_logical_operands_must_be_boolean() {
        assert!(matches!(
            run("1 && true", json!({})),
            Err(ExpressionError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_comparison_type_mismatch() {
        assert!(matches!(
            run("'a' < 1", json!({})),
            Err(ExpressionError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_array_index() {
        let vars = json!({"items": [{"qty": 3}, {"qty": 5}]});
        assert_eq!(run("items[1].qty * 2", vars.clone()).unwrap(), json!(10));
        assert_eq!(
            run("items[5]", vars),
            Err(ExpressionError::UnknownVariable("items[5]".into()))
        );
    }

    #[test]
    fn test_negation() {
        assert_eq!(run("-x", json!({"x": 4})).unwrap(), json!(-4));
        assert_eq!(run("!(x > 3)", json!({"x": 4})).unwrap(), json!(false));
    }

    #[test]
    fn test_null_literal_equality() {
        assert_eq!(run("v == null", json!({"v": null})).unwrap(), json!(true));
    }
}
