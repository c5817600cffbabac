//! Expression evaluation over a row view.
//!
//! Rows are positional: column lookups resolve to positions once per
//! plan, not per row. NULL follows SQL three-valued logic through
//! comparisons and AND/OR; WHERE treats a non-TRUE result as filtered
//! out. Subqueries and aggregates are materialized by the executor
//! before scalar evaluation — meeting one here is an internal error.

use std::collections::HashMap;

use chrono::{Datelike, Months, Utc};
use rust_decimal::Decimal;

use crate::error::{Result, VaultError};
use crate::sql::ast::{BinaryOp, Expr, Literal, ParamRef, UnaryOp};
use crate::types::{
    datetime_to_ticks, now_ticks, parse_datetime_text, ticks_to_datetime, Value,
};

/// Bound statement parameters.
#[derive(Debug, Clone, Default)]
pub struct Params {
    positional: Vec<Value>,
    named: HashMap<String, Value>,
}

impl Params {
    pub fn none() -> Self {
        Params::default()
    }

    pub fn positional(values: Vec<Value>) -> Self {
        Params { positional: values, named: HashMap::new() }
    }

    pub fn named<I: IntoIterator<Item = (String, Value)>>(pairs: I) -> Self {
        Params {
            positional: Vec::new(),
            named: pairs.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect(),
        }
    }

    pub fn get(&self, param: &ParamRef) -> Result<Value> {
        match param {
            ParamRef::Positional(index) => self.positional.get(*index).cloned().ok_or_else(|| {
                VaultError::Execution(format!("missing positional parameter {}", index + 1))
            }),
            ParamRef::Named(name) => {
                self.named.get(&name.to_lowercase()).cloned().ok_or_else(|| {
                    VaultError::Execution(format!("missing named parameter @{name}"))
                })
            }
        }
    }

    /// Stable fingerprint of the bound values, for result-cache keys.
    pub fn fingerprint(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for value in &self.positional {
            let _ = write!(out, "{value:?};");
        }
        let mut named: Vec<_> = self.named.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in named {
            let _ = write!(out, "{name}={value:?};");
        }
        out
    }
}

/// Column namespace of a row: qualified names resolved to positions.
#[derive(Debug, Clone, Default)]
pub struct RowSchema {
    /// (binding, column name), both lowercase; binding is the table
    /// alias or name the column came from.
    columns: Vec<(Option<String>, String)>,
    /// Output labels in display case.
    labels: Vec<String>,
}

impl RowSchema {
    pub fn new() -> Self {
        RowSchema::default()
    }

    pub fn push(&mut self, binding: Option<&str>, name: &str) {
        self.columns
            .push((binding.map(str::to_lowercase), name.to_lowercase()));
        self.labels.push(name.to_string());
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn column_binding(&self, position: usize) -> Option<&str> {
        self.columns.get(position).and_then(|(b, _)| b.as_deref())
    }

    /// Positions of every column bound to `binding`, in order.
    pub fn binding_positions(&self, binding: &str) -> Vec<usize> {
        let binding = binding.to_lowercase();
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, (b, _))| b.as_deref() == Some(binding.as_str()))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn resolve(&self, table: Option<&str>, name: &str) -> Result<usize> {
        let name = name.to_lowercase();
        let table = table.map(str::to_lowercase);
        let mut found = None;
        for (position, (binding, column)) in self.columns.iter().enumerate() {
            if *column != name {
                continue;
            }
            if let Some(ref wanted) = table {
                if binding.as_deref() != Some(wanted.as_str()) {
                    continue;
                }
            }
            if found.is_some() {
                return Err(VaultError::Catalog(format!("ambiguous column name: {name}")));
            }
            found = Some(position);
        }
        found.ok_or_else(|| match table {
            Some(t) => VaultError::Catalog(format!("unknown column: {t}.{name}")),
            None => VaultError::Catalog(format!("unknown column: {name}")),
        })
    }
}

pub struct EvalContext<'a> {
    pub schema: &'a RowSchema,
    pub row: &'a [Value],
    pub params: &'a Params,
    /// Pre-computed aggregate results keyed by expression fingerprint.
    pub aggregates: Option<&'a HashMap<String, Value>>,
}

impl<'a> EvalContext<'a> {
    pub fn rowless(schema: &'a RowSchema, params: &'a Params) -> Self {
        EvalContext { schema, row: &[], params, aggregates: None }
    }
}

/// Stable key for an aggregate expression within one statement.
pub fn aggregate_fingerprint(expr: &Expr) -> String {
    format!("{expr:?}")
}

pub fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Integer(v) => Value::Integer(*v),
        Literal::Real(v) => Value::Real(*v),
        Literal::Text(s) => Value::Text(s.clone()),
        Literal::Boolean(b) => Value::Boolean(*b),
        Literal::Blob(b) => Value::Blob(b.clone()),
        Literal::Null => Value::Null,
    }
}

/// WHERE-clause truthiness: TRUE passes, FALSE and NULL do not.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Boolean(b) => *b,
        Value::Integer(v) => *v != 0,
        _ => false,
    }
}

fn bool3(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        other => Some(is_truthy(other)),
    }
}

fn from_bool3(value: Option<bool>) -> Value {
    match value {
        Some(b) => Value::Boolean(b),
        None => Value::Null,
    }
}

pub fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Value> {
    match expr {
        Expr::Literal(literal) => Ok(literal_value(literal)),
        Expr::Column { table, name } => {
            let position = ctx.schema.resolve(table.as_deref(), name)?;
            Ok(ctx.row.get(position).cloned().unwrap_or(Value::Null))
        }
        Expr::Param(param) => ctx.params.get(param),
        Expr::Binary { left, op, right } => eval_binary(left, *op, right, ctx),
        Expr::Unary { op, operand } => {
            let value = eval(operand, ctx)?;
            match op {
                UnaryOp::Not => Ok(from_bool3(bool3(&value).map(|b| !b))),
                UnaryOp::Neg => negate(value),
            }
        }
        Expr::Like { expr, pattern, negated } => {
            let value = eval(expr, ctx)?;
            let pattern = eval(pattern, ctx)?;
            match (value, pattern) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (Value::Text(s), Value::Text(p)) => {
                    let hit = like_match(&s, &p);
                    Ok(Value::Boolean(hit != *negated))
                }
                _ => Err(VaultError::Type("LIKE requires text operands".to_string())),
            }
        }
        Expr::InList { expr, items, negated } => {
            let needle = eval(expr, ctx)?;
            if needle.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            for item in items {
                let candidate = eval(item, ctx)?;
                if candidate.is_null() {
                    saw_null = true;
                    continue;
                }
                if needle.compare(&candidate) == Some(std::cmp::Ordering::Equal) {
                    return Ok(Value::Boolean(!negated));
                }
            }
            if saw_null {
                Ok(Value::Null)
            } else {
                Ok(Value::Boolean(*negated))
            }
        }
        Expr::Between { expr, low, high, negated } => {
            let value = eval(expr, ctx)?;
            let low = eval(low, ctx)?;
            let high = eval(high, ctx)?;
            let ge_low = value.compare(&low).map(|o| o != std::cmp::Ordering::Less);
            let le_high = value.compare(&high).map(|o| o != std::cmp::Ordering::Greater);
            match (ge_low, le_high) {
                (Some(a), Some(b)) => Ok(Value::Boolean((a && b) != *negated)),
                _ => Ok(Value::Null),
            }
        }
        Expr::IsNull { expr, negated } => {
            let value = eval(expr, ctx)?;
            Ok(Value::Boolean(value.is_null() != *negated))
        }
        Expr::Function { name, args } => eval_function(name, args, ctx),
        Expr::Aggregate { .. } => {
            if let Some(aggregates) = ctx.aggregates {
                if let Some(value) = aggregates.get(&aggregate_fingerprint(expr)) {
                    return Ok(value.clone());
                }
            }
            Err(VaultError::Internal("aggregate outside aggregation context".to_string()))
        }
        Expr::Resolved(value) => Ok(value.clone()),
        Expr::Subquery(_) | Expr::InSubquery { .. } => Err(VaultError::Internal(
            "subquery reached scalar evaluation without materialization".to_string(),
        )),
    }
}

fn eval_binary(left: &Expr, op: BinaryOp, right: &Expr, ctx: &EvalContext) -> Result<Value> {
    // AND/OR short-circuit with three-valued logic.
    match op {
        BinaryOp::And => {
            let lhs = bool3(&eval(left, ctx)?);
            if lhs == Some(false) {
                return Ok(Value::Boolean(false));
            }
            let rhs = bool3(&eval(right, ctx)?);
            return Ok(match (lhs, rhs) {
                (Some(true), Some(b)) => Value::Boolean(b),
                (_, Some(false)) => Value::Boolean(false),
                _ => Value::Null,
            });
        }
        BinaryOp::Or => {
            let lhs = bool3(&eval(left, ctx)?);
            if lhs == Some(true) {
                return Ok(Value::Boolean(true));
            }
            let rhs = bool3(&eval(right, ctx)?);
            return Ok(match (lhs, rhs) {
                (Some(false), Some(b)) => Value::Boolean(b),
                (_, Some(true)) => Value::Boolean(true),
                _ => Value::Null,
            });
        }
        _ => {}
    }

    let lhs = eval(left, ctx)?;
    let rhs = eval(right, ctx)?;
    match op {
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            Ok(compare_values(&lhs, op, &rhs))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(lhs, op, rhs)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

pub fn compare_values(lhs: &Value, op: BinaryOp, rhs: &Value) -> Value {
    let Some(ordering) = lhs.compare(rhs) else {
        return Value::Null;
    };
    let result = match op {
        BinaryOp::Eq => ordering == std::cmp::Ordering::Equal,
        BinaryOp::Ne => ordering != std::cmp::Ordering::Equal,
        BinaryOp::Lt => ordering == std::cmp::Ordering::Less,
        BinaryOp::Le => ordering != std::cmp::Ordering::Greater,
        BinaryOp::Gt => ordering == std::cmp::Ordering::Greater,
        BinaryOp::Ge => ordering != std::cmp::Ordering::Less,
        _ => unreachable!("comparison operator"),
    };
    Value::Boolean(result)
}

fn negate(value: Value) -> Result<Value> {
    Ok(match value {
        Value::Null => Value::Null,
        Value::Integer(v) => Value::Integer(v.checked_neg().ok_or_else(|| {
            VaultError::Execution("integer overflow in negation".to_string())
        })?),
        Value::Real(v) => Value::Real(-v),
        Value::Decimal(d) => Value::Decimal(-d),
        other => {
            return Err(VaultError::Type(format!("cannot negate {}", other.type_name())));
        }
    })
}

fn arithmetic(lhs: Value, op: BinaryOp, rhs: Value) -> Result<Value> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }
    // Decimal arithmetic stays exact; mixing with REAL falls to f64.
    if let (Value::Decimal(a), Some(b)) = (&lhs, decimal_of(&rhs)) {
        return decimal_arithmetic(*a, op, b);
    }
    if let (Some(a), Value::Decimal(b)) = (decimal_of(&lhs), &rhs) {
        return decimal_arithmetic(a, op, *b);
    }
    match (&lhs, &rhs) {
        (Value::Integer(a), Value::Integer(b)) => integer_arithmetic(*a, op, *b),
        _ => {
            let a = lhs.as_f64().ok_or_else(|| arithmetic_type_error(&lhs))?;
            let b = rhs.as_f64().ok_or_else(|| arithmetic_type_error(&rhs))?;
            Ok(match op {
                BinaryOp::Add => Value::Real(a + b),
                BinaryOp::Sub => Value::Real(a - b),
                BinaryOp::Mul => Value::Real(a * b),
                BinaryOp::Div => {
                    if b == 0.0 {
                        Value::Null
                    } else {
                        Value::Real(a / b)
                    }
                }
                BinaryOp::Mod => {
                    if b == 0.0 {
                        Value::Null
                    } else {
                        Value::Real(a % b)
                    }
                }
                _ => unreachable!("arithmetic operator"),
            })
        }
    }
}

fn arithmetic_type_error(value: &Value) -> VaultError {
    VaultError::Type(format!("cannot do arithmetic on {}", value.type_name()))
}

fn decimal_of(value: &Value) -> Option<Decimal> {
    match value {
        Value::Decimal(d) => Some(*d),
        Value::Integer(v) => Some(Decimal::from(*v)),
        _ => None,
    }
}

fn decimal_arithmetic(a: Decimal, op: BinaryOp, b: Decimal) -> Result<Value> {
    let overflow = || VaultError::Execution("decimal overflow".to_string());
    Ok(match op {
        BinaryOp::Add => Value::Decimal(a.checked_add(b).ok_or_else(overflow)?),
        BinaryOp::Sub => Value::Decimal(a.checked_sub(b).ok_or_else(overflow)?),
        BinaryOp::Mul => Value::Decimal(a.checked_mul(b).ok_or_else(overflow)?),
        BinaryOp::Div => match a.checked_div(b) {
            Some(result) => Value::Decimal(result),
            None => Value::Null,
        },
        BinaryOp::Mod => match a.checked_rem(b) {
            Some(result) => Value::Decimal(result),
            None => Value::Null,
        },
        _ => unreachable!("arithmetic operator"),
    })
}

fn integer_arithmetic(a: i64, op: BinaryOp, b: i64) -> Result<Value> {
    let overflow = || VaultError::Execution("integer overflow".to_string());
    Ok(match op {
        BinaryOp::Add => Value::Integer(a.checked_add(b).ok_or_else(overflow)?),
        BinaryOp::Sub => Value::Integer(a.checked_sub(b).ok_or_else(overflow)?),
        BinaryOp::Mul => Value::Integer(a.checked_mul(b).ok_or_else(overflow)?),
        BinaryOp::Div => match a.checked_div(b) {
            Some(result) => Value::Integer(result),
            None => Value::Null,
        },
        BinaryOp::Mod => match a.checked_rem(b) {
            Some(result) => Value::Integer(result),
            None => Value::Null,
        },
        _ => unreachable!("arithmetic operator"),
    })
}

/// SQL LIKE: `%` any run, `_` one character. Case-sensitive.
pub fn like_match(text: &str, pattern: &str) -> bool {
    fn matches(text: &[char], pattern: &[char]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some(('%', rest)) => {
                (0..=text.len()).any(|skip| matches(&text[skip..], rest))
            }
            Some(('_', rest)) => match text.split_first() {
                Some((_, text_rest)) => matches(text_rest, rest),
                None => false,
            },
            Some((c, rest)) => match text.split_first() {
                Some((t, text_rest)) => t == c && matches(text_rest, rest),
                None => false,
            },
        }
    }
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    matches(&text, &pattern)
}

fn eval_function(name: &str, args: &[Expr], ctx: &EvalContext) -> Result<Value> {
    let arity = |expected: std::ops::RangeInclusive<usize>| -> Result<()> {
        if expected.contains(&args.len()) {
            Ok(())
        } else {
            Err(VaultError::Execution(format!(
                "{name} takes {}..{} arguments, got {}",
                expected.start(),
                expected.end(),
                args.len()
            )))
        }
    };
    let arg = |index: usize| eval(&args[index], ctx);

    match name {
        "UPPER" => {
            arity(1..=1)?;
            text_fn(arg(0)?, |s| Value::Text(s.to_uppercase()))
        }
        "LOWER" => {
            arity(1..=1)?;
            text_fn(arg(0)?, |s| Value::Text(s.to_lowercase()))
        }
        "LENGTH" => {
            arity(1..=1)?;
            text_fn(arg(0)?, |s| Value::Integer(s.chars().count() as i64))
        }
        "TRIM" => {
            arity(1..=1)?;
            text_fn(arg(0)?, |s| Value::Text(s.trim().to_string()))
        }
        "SUBSTR" | "SUBSTRING" => {
            arity(2..=3)?;
            let value = arg(0)?;
            let start = arg(1)?;
            let length = if args.len() == 3 { Some(arg(2)?) } else { None };
            substr(value, start, length)
        }
        "REPLACE" => {
            arity(3..=3)?;
            match (arg(0)?, arg(1)?, arg(2)?) {
                (Value::Null, _, _) => Ok(Value::Null),
                (Value::Text(s), Value::Text(from), Value::Text(to)) => {
                    Ok(Value::Text(s.replace(&from, &to)))
                }
                _ => Err(VaultError::Type("REPLACE requires text arguments".to_string())),
            }
        }
        "CONCAT" => {
            let mut out = String::new();
            for item in args {
                let value = eval(item, ctx)?;
                if !value.is_null() {
                    out.push_str(&value.to_string());
                }
            }
            Ok(Value::Text(out))
        }
        "ABS" => {
            arity(1..=1)?;
            Ok(match arg(0)? {
                Value::Null => Value::Null,
                Value::Integer(v) => Value::Integer(v.checked_abs().ok_or_else(|| {
                    VaultError::Execution("integer overflow in ABS".to_string())
                })?),
                Value::Real(v) => Value::Real(v.abs()),
                Value::Decimal(d) => Value::Decimal(d.abs()),
                other => return Err(VaultError::Type(format!("ABS of {}", other.type_name()))),
            })
        }
        "ROUND" => {
            arity(1..=2)?;
            let digits = if args.len() == 2 {
                arg(1)?.as_i64().unwrap_or(0)
            } else {
                0
            };
            Ok(match arg(0)? {
                Value::Null => Value::Null,
                Value::Integer(v) => Value::Integer(v),
                Value::Real(v) => {
                    let factor = 10f64.powi(digits as i32);
                    Value::Real((v * factor).round() / factor)
                }
                Value::Decimal(d) => Value::Decimal(d.round_dp(digits.max(0) as u32)),
                other => return Err(VaultError::Type(format!("ROUND of {}", other.type_name()))),
            })
        }
        "COALESCE" => {
            for item in args {
                let value = eval(item, ctx)?;
                if !value.is_null() {
                    return Ok(value);
                }
            }
            Ok(Value::Null)
        }
        "IFNULL" => {
            arity(2..=2)?;
            let value = arg(0)?;
            if value.is_null() {
                arg(1)
            } else {
                Ok(value)
            }
        }
        "NOW" => {
            arity(0..=0)?;
            Ok(Value::DateTime(now_ticks()))
        }
        "DATE" => {
            arity(1..=1)?;
            let ticks = datetime_arg(arg(0)?)?;
            match ticks {
                None => Ok(Value::Null),
                Some(ticks) => {
                    let dt = ticks_to_datetime(ticks)
                        .ok_or_else(|| VaultError::Type("datetime out of range".to_string()))?;
                    Ok(Value::Text(dt.format("%Y-%m-%d").to_string()))
                }
            }
        }
        "DATEADD" => {
            arity(3..=3)?;
            let unit = match arg(0)? {
                Value::Text(s) => s.to_lowercase(),
                other => {
                    return Err(VaultError::Type(format!(
                        "DATEADD unit must be text, got {}",
                        other.type_name()
                    )));
                }
            };
            let amount = arg(1)?
                .as_i64()
                .ok_or_else(|| VaultError::Type("DATEADD amount must be an integer".to_string()))?;
            let Some(ticks) = datetime_arg(arg(2)?)? else {
                return Ok(Value::Null);
            };
            date_add(&unit, amount, ticks).map(Value::DateTime)
        }
        "STRFTIME" => {
            arity(2..=2)?;
            let format = match arg(0)? {
                Value::Text(s) => s,
                other => {
                    return Err(VaultError::Type(format!(
                        "STRFTIME format must be text, got {}",
                        other.type_name()
                    )));
                }
            };
            let Some(ticks) = datetime_arg(arg(1)?)? else {
                return Ok(Value::Null);
            };
            let dt = ticks_to_datetime(ticks)
                .ok_or_else(|| VaultError::Type("datetime out of range".to_string()))?;
            Ok(Value::Text(strftime(&format, &dt)))
        }
        other => Err(VaultError::Execution(format!("unknown function: {other}"))),
    }
}

fn text_fn(value: Value, f: impl Fn(&str) -> Value) -> Result<Value> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Text(s) => Ok(f(&s)),
        other => Ok(f(&other.to_string())),
    }
}

fn substr(value: Value, start: Value, length: Option<Value>) -> Result<Value> {
    let Value::Text(s) = value else {
        return match value {
            Value::Null => Ok(Value::Null),
            other => Err(VaultError::Type(format!("SUBSTR of {}", other.type_name()))),
        };
    };
    let start = start
        .as_i64()
        .ok_or_else(|| VaultError::Type("SUBSTR start must be an integer".to_string()))?;
    let chars: Vec<char> = s.chars().collect();
    // 1-based start, SQL style.
    let begin = (start.max(1) - 1) as usize;
    if begin >= chars.len() {
        return Ok(Value::Text(String::new()));
    }
    let end = match length {
        Some(len) => {
            let len = len
                .as_i64()
                .ok_or_else(|| VaultError::Type("SUBSTR length must be an integer".to_string()))?;
            (begin + len.max(0) as usize).min(chars.len())
        }
        None => chars.len(),
    };
    Ok(Value::Text(chars[begin..end].iter().collect()))
}

/// Accept DATETIME, ticks as INTEGER, or text ('now' included).
fn datetime_arg(value: Value) -> Result<Option<i64>> {
    Ok(match value {
        Value::Null => None,
        Value::DateTime(t) => Some(t),
        Value::Integer(t) => Some(t),
        Value::Text(s) if s.eq_ignore_ascii_case("now") => Some(now_ticks()),
        Value::Text(s) => Some(parse_datetime_text(&s)?),
        other => {
            return Err(VaultError::Type(format!(
                "expected a datetime, got {}",
                other.type_name()
            )));
        }
    })
}

fn date_add(unit: &str, amount: i64, ticks: i64) -> Result<i64> {
    use crate::types::TICKS_PER_SECOND;
    let simple = match unit {
        "second" | "seconds" => Some(TICKS_PER_SECOND),
        "minute" | "minutes" => Some(60 * TICKS_PER_SECOND),
        "hour" | "hours" => Some(3600 * TICKS_PER_SECOND),
        "day" | "days" => Some(86_400 * TICKS_PER_SECOND),
        "week" | "weeks" => Some(7 * 86_400 * TICKS_PER_SECOND),
        _ => None,
    };
    if let Some(per_unit) = simple {
        return amount
            .checked_mul(per_unit)
            .and_then(|delta| ticks.checked_add(delta))
            .ok_or_else(|| VaultError::Execution("DATEADD overflow".to_string()));
    }

    let dt = ticks_to_datetime(ticks)
        .ok_or_else(|| VaultError::Type("datetime out of range".to_string()))?;
    let shifted = match unit {
        "month" | "months" => {
            if amount >= 0 {
                dt.checked_add_months(Months::new(amount as u32))
            } else {
                dt.checked_sub_months(Months::new((-amount) as u32))
            }
        }
        "year" | "years" => {
            let target_year = dt.year() + amount as i32;
            dt.with_year(target_year)
        }
        other => {
            return Err(VaultError::Execution(format!("unknown DATEADD unit: {other}")));
        }
    }
    .ok_or_else(|| VaultError::Execution("DATEADD out of range".to_string()))?;
    Ok(datetime_to_ticks(&shifted))
}

/// Minimal strftime over UTC datetimes: %Y %m %d %H %M %S %s %% pass
/// through; unknown directives are copied verbatim.
fn strftime(format: &str, dt: &chrono::DateTime<Utc>) -> String {
    let mut out = String::with_capacity(format.len() + 8);
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", dt.year())),
            Some('m') => out.push_str(&format!("{:02}", dt.month())),
            Some('d') => out.push_str(&format!("{:02}", dt.day())),
            Some('H') => out.push_str(&format!("{:02}", chrono::Timelike::hour(dt))),
            Some('M') => out.push_str(&format!("{:02}", chrono::Timelike::minute(dt))),
            Some('S') => out.push_str(&format!("{:02}", chrono::Timelike::second(dt))),
            Some('s') => out.push_str(&dt.timestamp().to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::parse_sql;
    use crate::sql::ast::Statement;

    fn eval_scalar(sql: &str) -> Result<Value> {
        let stmt = parse_sql(&format!("SELECT {sql}")).into_single().unwrap();
        let Statement::Select(select) = stmt else { panic!("expected SELECT") };
        let crate::sql::ast::SelectColumn::Expr { expr, .. } = &select.columns[0] else {
            panic!("expected expression column");
        };
        let schema = RowSchema::new();
        let params = Params::none();
        eval(expr, &EvalContext::rowless(&schema, &params))
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval_scalar("1 + 2 * 3").unwrap(), Value::Integer(7));
        assert_eq!(eval_scalar("(1 + 2) * 3").unwrap(), Value::Integer(9));
        assert_eq!(eval_scalar("7 / 2").unwrap(), Value::Integer(3));
        assert_eq!(eval_scalar("7.0 / 2").unwrap(), Value::Real(3.5));
        assert_eq!(eval_scalar("10 % 3").unwrap(), Value::Integer(1));
        assert_eq!(eval_scalar("1 / 0").unwrap(), Value::Null);
    }

    #[test]
    fn test_three_valued_logic() {
        assert_eq!(eval_scalar("NULL AND TRUE").unwrap(), Value::Null);
        assert_eq!(eval_scalar("NULL AND FALSE").unwrap(), Value::Boolean(false));
        assert_eq!(eval_scalar("NULL OR TRUE").unwrap(), Value::Boolean(true));
        assert_eq!(eval_scalar("NULL OR FALSE").unwrap(), Value::Null);
        assert_eq!(eval_scalar("NOT NULL").unwrap(), Value::Null);
        assert_eq!(eval_scalar("1 = NULL").unwrap(), Value::Null);
        assert_eq!(eval_scalar("NULL IS NULL").unwrap(), Value::Boolean(true));
        assert_eq!(eval_scalar("1 IS NOT NULL").unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval_scalar("2 < 3").unwrap(), Value::Boolean(true));
        assert_eq!(eval_scalar("2 >= 3").unwrap(), Value::Boolean(false));
        assert_eq!(eval_scalar("'abc' = 'abc'").unwrap(), Value::Boolean(true));
        assert_eq!(eval_scalar("2 = 2.0").unwrap(), Value::Boolean(true));
        assert_eq!(eval_scalar("1 <> 2").unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_between_and_in() {
        assert_eq!(eval_scalar("5 BETWEEN 1 AND 10").unwrap(), Value::Boolean(true));
        assert_eq!(eval_scalar("5 NOT BETWEEN 1 AND 10").unwrap(), Value::Boolean(false));
        assert_eq!(eval_scalar("2 IN (1, 2, 3)").unwrap(), Value::Boolean(true));
        assert_eq!(eval_scalar("9 IN (1, 2, 3)").unwrap(), Value::Boolean(false));
        assert_eq!(eval_scalar("9 IN (1, NULL)").unwrap(), Value::Null);
    }

    #[test]
    fn test_like() {
        assert_eq!(eval_scalar("'hello' LIKE 'h%'").unwrap(), Value::Boolean(true));
        assert_eq!(eval_scalar("'hello' LIKE 'h_llo'").unwrap(), Value::Boolean(true));
        assert_eq!(eval_scalar("'hello' LIKE 'H%'").unwrap(), Value::Boolean(false));
        assert_eq!(eval_scalar("'hello' NOT LIKE 'x%'").unwrap(), Value::Boolean(true));
        assert_eq!(eval_scalar("'abc' LIKE '%'").unwrap(), Value::Boolean(true));
        assert_eq!(eval_scalar("'' LIKE '_'").unwrap(), Value::Boolean(false));
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(eval_scalar("UPPER('abc')").unwrap(), Value::Text("ABC".into()));
        assert_eq!(eval_scalar("LOWER('ABC')").unwrap(), Value::Text("abc".into()));
        assert_eq!(eval_scalar("LENGTH('hello')").unwrap(), Value::Integer(5));
        assert_eq!(eval_scalar("SUBSTR('hello', 2, 3)").unwrap(), Value::Text("ell".into()));
        assert_eq!(eval_scalar("SUBSTR('hello', 4)").unwrap(), Value::Text("lo".into()));
        assert_eq!(
            eval_scalar("REPLACE('a-b-c', '-', '+')").unwrap(),
            Value::Text("a+b+c".into())
        );
        assert_eq!(
            eval_scalar("CONCAT('a', 1, NULL, 'b')").unwrap(),
            Value::Text("a1b".into())
        );
        assert_eq!(eval_scalar("TRIM('  x  ')").unwrap(), Value::Text("x".into()));
    }

    #[test]
    fn test_null_propagation_in_functions() {
        assert_eq!(eval_scalar("UPPER(NULL)").unwrap(), Value::Null);
        assert_eq!(eval_scalar("COALESCE(NULL, NULL, 3)").unwrap(), Value::Integer(3));
        assert_eq!(eval_scalar("IFNULL(NULL, 'x')").unwrap(), Value::Text("x".into()));
        assert_eq!(eval_scalar("IFNULL(1, 'x')").unwrap(), Value::Integer(1));
    }

    #[test]
    fn test_datetime_functions() {
        assert_eq!(
            eval_scalar("DATE('2024-03-01 10:30:00')").unwrap(),
            Value::Text("2024-03-01".into())
        );
        let added = eval_scalar("DATEADD('day', 1, '2024-02-28')").unwrap();
        let Value::DateTime(ticks) = added else { panic!("expected DATETIME") };
        let dt = ticks_to_datetime(ticks).unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2024-02-29");
        assert_eq!(
            eval_scalar("STRFTIME('%Y/%m/%d %H:%M', '2024-03-01 10:30:00')").unwrap(),
            Value::Text("2024/03/01 10:30".into())
        );
        assert!(matches!(eval_scalar("NOW()").unwrap(), Value::DateTime(_)));
    }

    #[test]
    fn test_dateadd_months_clamps() {
        let added = eval_scalar("DATEADD('month', 1, '2024-01-31')").unwrap();
        let Value::DateTime(ticks) = added else { panic!("expected DATETIME") };
        let dt = ticks_to_datetime(ticks).unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2024-02-29");
    }

    #[test]
    fn test_round_and_abs() {
        assert_eq!(eval_scalar("ABS(-5)").unwrap(), Value::Integer(5));
        assert_eq!(eval_scalar("ROUND(2.567, 2)").unwrap(), Value::Real(2.57));
        assert_eq!(eval_scalar("ROUND(2.5)").unwrap(), Value::Real(3.0));
    }

    #[test]
    fn test_schema_resolution() {
        let mut schema = RowSchema::new();
        schema.push(Some("u"), "id");
        schema.push(Some("o"), "id");
        schema.push(Some("u"), "name");
        assert_eq!(schema.resolve(Some("o"), "id").unwrap(), 1);
        assert_eq!(schema.resolve(None, "name").unwrap(), 2);
        assert!(matches!(
            schema.resolve(None, "id"),
            Err(VaultError::Catalog(msg)) if msg.contains("ambiguous")
        ));
        assert!(schema.resolve(None, "missing").is_err());
    }
}
