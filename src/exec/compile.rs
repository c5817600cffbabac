//! WHERE-clause compiler.
//!
//! Compiles an expression into a closure over positional row buffers:
//! column references resolve to positions once, constant subtrees fold
//! to values once, and each comparison operator specializes to its own
//! closure. Parameters stay late-bound so one compiled plan serves every
//! execution.
//!
//! Aggregates and unmaterialized subqueries cannot be compiled; callers
//! materialize subqueries first and route aggregate-bearing expressions
//! through the interpreter.

use std::sync::Arc;

use crate::error::{Result, VaultError};
use crate::sql::ast::{BinaryOp, Expr, UnaryOp};
use crate::sql::eval::{self, EvalContext, Params, RowSchema};
use crate::types::Value;

pub type ValueFn = Arc<dyn Fn(&[Value], &Params) -> Result<Value> + Send + Sync>;
pub type PredicateFn = Arc<dyn Fn(&[Value], &Params) -> Result<bool> + Send + Sync>;

/// True when the expression depends on nothing but itself.
fn is_constant(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(_) | Expr::Resolved(_) => true,
        Expr::Column { .. } | Expr::Param(_) | Expr::Aggregate { .. } => false,
        Expr::Subquery(_) | Expr::InSubquery { .. } => false,
        Expr::Binary { left, right, .. } => is_constant(left) && is_constant(right),
        Expr::Unary { operand, .. } => is_constant(operand),
        Expr::Like { expr, pattern, .. } => is_constant(expr) && is_constant(pattern),
        Expr::InList { expr, items, .. } => is_constant(expr) && items.iter().all(is_constant),
        Expr::Between { expr, low, high, .. } => {
            is_constant(expr) && is_constant(low) && is_constant(high)
        }
        Expr::IsNull { expr, .. } => is_constant(expr),
        // Conservative: NOW() is not foldable.
        Expr::Function { .. } => false,
    }
}

/// Compile a WHERE predicate. Row truthiness: TRUE passes.
pub fn compile_predicate(expr: &Expr, schema: &RowSchema) -> Result<PredicateFn> {
    let value_fn = compile_expr(expr, schema)?;
    Ok(Arc::new(move |row, params| {
        Ok(eval::is_truthy(&value_fn(row, params)?))
    }))
}

pub fn compile_expr(expr: &Expr, schema: &RowSchema) -> Result<ValueFn> {
    // Constant folding: evaluate once, capture the value.
    if is_constant(expr) {
        let empty_schema = RowSchema::new();
        let empty_params = Params::none();
        let folded = eval::eval(expr, &EvalContext::rowless(&empty_schema, &empty_params))?;
        return Ok(Arc::new(move |_, _| Ok(folded.clone())));
    }

    match expr {
        Expr::Literal(_) | Expr::Resolved(_) => unreachable!("literals are constant"),
        Expr::Column { table, name } => {
            let position = schema.resolve(table.as_deref(), name)?;
            Ok(Arc::new(move |row, _| {
                Ok(row.get(position).cloned().unwrap_or(Value::Null))
            }))
        }
        Expr::Param(param) => {
            let param = param.clone();
            Ok(Arc::new(move |_, params| params.get(&param)))
        }
        Expr::Binary { left, op, right } => compile_binary(left, *op, right, schema),
        Expr::Unary { op, operand } => {
            let inner = compile_expr(operand, schema)?;
            match op {
                UnaryOp::Not => Ok(Arc::new(move |row, params| {
                    Ok(match inner(row, params)? {
                        Value::Null => Value::Null,
                        value => Value::Boolean(!eval::is_truthy(&value)),
                    })
                })),
                UnaryOp::Neg => {
                    let zero = Expr::Literal(crate::sql::ast::Literal::Integer(0));
                    let negate = compile_binary(&zero, BinaryOp::Sub, operand, schema)?;
                    Ok(negate)
                }
            }
        }
        Expr::Between { expr, low, high, negated } => {
            let value_fn = compile_expr(expr, schema)?;
            let low_fn = compile_expr(low, schema)?;
            let high_fn = compile_expr(high, schema)?;
            let negated = *negated;
            Ok(Arc::new(move |row, params| {
                let value = value_fn(row, params)?;
                let low = low_fn(row, params)?;
                let high = high_fn(row, params)?;
                let ge_low = value.compare(&low).map(|o| o != std::cmp::Ordering::Less);
                let le_high = value.compare(&high).map(|o| o != std::cmp::Ordering::Greater);
                Ok(match (ge_low, le_high) {
                    (Some(a), Some(b)) => Value::Boolean((a && b) != negated),
                    _ => Value::Null,
                })
            }))
        }
        Expr::IsNull { expr, negated } => {
            let inner = compile_expr(expr, schema)?;
            let negated = *negated;
            Ok(Arc::new(move |row, params| {
                Ok(Value::Boolean(inner(row, params)?.is_null() != negated))
            }))
        }
        Expr::InList { expr, items, negated } => {
            let needle_fn = compile_expr(expr, schema)?;
            let item_fns: Vec<ValueFn> = items
                .iter()
                .map(|item| compile_expr(item, schema))
                .collect::<Result<_>>()?;
            let negated = *negated;
            Ok(Arc::new(move |row, params| {
                let needle = needle_fn(row, params)?;
                if needle.is_null() {
                    return Ok(Value::Null);
                }
                let mut saw_null = false;
                for item in &item_fns {
                    let candidate = item(row, params)?;
                    if candidate.is_null() {
                        saw_null = true;
                        continue;
                    }
                    if needle.compare(&candidate) == Some(std::cmp::Ordering::Equal) {
                        return Ok(Value::Boolean(!negated));
                    }
                }
                Ok(if saw_null { Value::Null } else { Value::Boolean(negated) })
            }))
        }
        Expr::Like { expr, pattern, negated } => {
            let value_fn = compile_expr(expr, schema)?;
            let pattern_fn = compile_expr(pattern, schema)?;
            let negated = *negated;
            Ok(Arc::new(move |row, params| {
                match (value_fn(row, params)?, pattern_fn(row, params)?) {
                    (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                    (Value::Text(s), Value::Text(p)) => {
                        Ok(Value::Boolean(eval::like_match(&s, &p) != negated))
                    }
                    _ => Err(VaultError::Type("LIKE requires text operands".to_string())),
                }
            }))
        }
        // Functions fall back to the interpreter with resolved context.
        Expr::Function { .. } => {
            let expr = expr.clone();
            let schema = schema.clone();
            Ok(Arc::new(move |row, params| {
                eval::eval(&expr, &EvalContext { schema: &schema, row, params, aggregates: None })
            }))
        }
        Expr::Aggregate { .. } => Err(VaultError::Internal(
            "aggregate in a compiled predicate".to_string(),
        )),
        Expr::Subquery(_) | Expr::InSubquery { .. } => Err(VaultError::Internal(
            "subquery must be materialized before compilation".to_string(),
        )),
    }
}

fn compile_binary(left: &Expr, op: BinaryOp, right: &Expr, schema: &RowSchema) -> Result<ValueFn> {
    let left_fn = compile_expr(left, schema)?;
    let right_fn = compile_expr(right, schema)?;

    // Operator specialization: pick the closure shape per operator at
    // compile time instead of dispatching per row.
    macro_rules! comparison {
        ($test:expr) => {{
            Ok(Arc::new(move |row: &[Value], params: &Params| {
                let lhs = left_fn(row, params)?;
                let rhs = right_fn(row, params)?;
                Ok(match lhs.compare(&rhs) {
                    None => Value::Null,
                    Some(ordering) => Value::Boolean($test(ordering)),
                })
            }) as ValueFn)
        }};
    }

    use std::cmp::Ordering;
    match op {
        BinaryOp::Eq => comparison!(|o| o == Ordering::Equal),
        BinaryOp::Ne => comparison!(|o| o != Ordering::Equal),
        BinaryOp::Lt => comparison!(|o| o == Ordering::Less),
        BinaryOp::Le => comparison!(|o| o != Ordering::Greater),
        BinaryOp::Gt => comparison!(|o| o == Ordering::Greater),
        BinaryOp::Ge => comparison!(|o| o != Ordering::Less),
        BinaryOp::And => Ok(Arc::new(move |row, params| {
            let lhs = left_fn(row, params)?;
            if !lhs.is_null() && !eval::is_truthy(&lhs) {
                return Ok(Value::Boolean(false));
            }
            let rhs = right_fn(row, params)?;
            Ok(match (lhs.is_null(), rhs.is_null()) {
                (false, false) => Value::Boolean(eval::is_truthy(&rhs)),
                (_, false) if !eval::is_truthy(&rhs) => Value::Boolean(false),
                _ => Value::Null,
            })
        })),
        BinaryOp::Or => Ok(Arc::new(move |row, params| {
            let lhs = left_fn(row, params)?;
            if !lhs.is_null() && eval::is_truthy(&lhs) {
                return Ok(Value::Boolean(true));
            }
            let rhs = right_fn(row, params)?;
            Ok(match (lhs.is_null(), rhs.is_null()) {
                (false, false) => Value::Boolean(eval::is_truthy(&rhs)),
                (_, false) if eval::is_truthy(&rhs) => Value::Boolean(true),
                _ => Value::Null,
            })
        })),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            // Arithmetic shares the interpreter's promotion rules.
            let left = left.clone();
            let right = right.clone();
            let schema = schema.clone();
            let op_expr = Expr::Binary { left: Box::new(left), op, right: Box::new(right) };
            Ok(Arc::new(move |row, params| {
                eval::eval(
                    &op_expr,
                    &EvalContext { schema: &schema, row, params, aggregates: None },
                )
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::Statement;
    use crate::sql::parse_sql;

    fn compile_where(sql: &str, schema: &RowSchema) -> PredicateFn {
        let Statement::Select(select) = parse_sql(sql).into_single().unwrap() else {
            panic!("expected SELECT");
        };
        compile_predicate(select.where_clause.as_ref().unwrap(), schema).unwrap()
    }

    fn schema_ab() -> RowSchema {
        let mut schema = RowSchema::new();
        schema.push(Some("t"), "a");
        schema.push(Some("t"), "b");
        schema
    }

    #[test]
    fn test_compiled_comparison() {
        let schema = schema_ab();
        let pred = compile_where("SELECT * FROM t WHERE a > 5", &schema);
        let params = Params::none();
        assert!(pred(&[Value::Integer(6), Value::Null], &params).unwrap());
        assert!(!pred(&[Value::Integer(5), Value::Null], &params).unwrap());
        // NULL comparison filters the row out.
        assert!(!pred(&[Value::Null, Value::Null], &params).unwrap());
    }

    #[test]
    fn test_constant_folding() {
        let schema = schema_ab();
        // `1 + 1 = 2` folds to TRUE regardless of the row.
        let pred = compile_where("SELECT * FROM t WHERE 1 + 1 = 2", &schema);
        let params = Params::none();
        assert!(pred(&[Value::Null, Value::Null], &params).unwrap());
    }

    #[test]
    fn test_parameters_late_bound() {
        let schema = schema_ab();
        let pred = compile_where("SELECT * FROM t WHERE a = ?", &schema);
        let row = [Value::Integer(7), Value::Null];
        assert!(pred(&row, &Params::positional(vec![Value::Integer(7)])).unwrap());
        assert!(!pred(&row, &Params::positional(vec![Value::Integer(8)])).unwrap());
    }

    #[test]
    fn test_unknown_column_fails_at_compile_time() {
        let schema = schema_ab();
        let Statement::Select(select) =
            parse_sql("SELECT * FROM t WHERE missing = 1").into_single().unwrap()
        else {
            panic!("expected SELECT");
        };
        assert!(compile_predicate(select.where_clause.as_ref().unwrap(), &schema).is_err());
    }

    #[test]
    fn test_and_or_semantics() {
        let schema = schema_ab();
        let pred = compile_where("SELECT * FROM t WHERE a > 1 AND b < 5 OR a = 0", &schema);
        let params = Params::none();
        assert!(pred(&[Value::Integer(2), Value::Integer(3)], &params).unwrap());
        assert!(pred(&[Value::Integer(0), Value::Integer(9)], &params).unwrap());
        assert!(!pred(&[Value::Integer(2), Value::Integer(9)], &params).unwrap());
    }

    #[test]
    fn test_like_and_in() {
        let mut schema = RowSchema::new();
        schema.push(Some("t"), "name");
        let params = Params::none();
        let pred = compile_where("SELECT * FROM t WHERE name LIKE 'Jo%'", &schema);
        assert!(pred(&[Value::Text("John".into())], &params).unwrap());
        assert!(!pred(&[Value::Text("Bob".into())], &params).unwrap());

        let pred = compile_where("SELECT * FROM t WHERE name IN ('a', 'b')", &schema);
        assert!(pred(&[Value::Text("a".into())], &params).unwrap());
        assert!(!pred(&[Value::Text("c".into())], &params).unwrap());
    }
}
