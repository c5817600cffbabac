//! Aggregate execution: GROUP BY/HAVING, the accumulator set, and the
//! columnar fast path.
//!
//! A pure aggregate over one base table (no grouping, numeric columns,
//! full or index-backed scan) dispatches to the columnar kernels; every
//! other shape runs the row-at-a-time accumulators. Both paths agree
//! bit-for-bit on integers and share float summation order.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::columnar::ColumnStore;
use crate::error::{Result, VaultError};
use crate::exec::compile;
use crate::exec::select::{default_label, order_compare, Source};
use crate::exec::Row;
use crate::sql::ast::*;
use crate::sql::eval::{self, aggregate_fingerprint, EvalContext, Params};
use crate::types::{DataType, Value};

pub(crate) fn execute(
    select: &Select,
    source: &Source,
    params: &Params,
) -> Result<(Arc<Vec<String>>, Vec<Row>)> {
    let mut labels = Vec::with_capacity(select.columns.len());
    let mut exprs = Vec::with_capacity(select.columns.len());
    for column in &select.columns {
        match column {
            SelectColumn::Star => {
                return Err(VaultError::Execution(
                    "SELECT * cannot be combined with aggregates".to_string(),
                ));
            }
            SelectColumn::Expr { expr, alias } => {
                labels.push(alias.clone().unwrap_or_else(|| default_label(expr, params)));
                exprs.push(expr);
            }
        }
    }
    let columns = Arc::new(labels);

    // Every aggregate node that needs computing, deduplicated.
    let mut aggregate_exprs: Vec<Expr> = Vec::new();
    for expr in &exprs {
        collect_aggregates(expr, &mut aggregate_exprs);
    }
    if let Some(having) = &select.having {
        collect_aggregates(having, &mut aggregate_exprs);
    }
    for item in &select.order_by {
        collect_aggregates(&item.expr, &mut aggregate_exprs);
    }

    if select.group_by.is_empty() {
        if let Some(rows) = columnar_fast_path(select, source, &exprs, &columns)? {
            return Ok((columns, rows));
        }
    }

    // Group rows.
    let groups: Vec<Vec<&Vec<Value>>> = if select.group_by.is_empty() {
        vec![source.rows.iter().collect()]
    } else {
        let key_fns: Vec<compile::ValueFn> = select
            .group_by
            .iter()
            .map(|expr| compile::compile_expr(expr, &source.schema))
            .collect::<Result<_>>()?;
        let mut order: Vec<Vec<&Vec<Value>>> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for row in &source.rows {
            let mut key = String::new();
            for f in &key_fns {
                key.push_str(&format!("{:?};", f(row, params)?));
            }
            match by_key.get(&key) {
                Some(&slot) => order[slot].push(row),
                None => {
                    by_key.insert(key, order.len());
                    order.push(vec![row]);
                }
            }
        }
        order
    };

    let empty_row: Vec<Value> = vec![Value::Null; source.schema.len()];
    let mut output: Vec<(HashMap<String, Value>, Vec<Value>, Vec<Value>)> = Vec::new();
    for group in &groups {
        let mut computed: HashMap<String, Value> = HashMap::new();
        for aggregate_expr in &aggregate_exprs {
            let Expr::Aggregate { func, arg, distinct } = aggregate_expr else {
                continue;
            };
            let value =
                compute_aggregate(*func, arg.as_deref(), *distinct, group, source, params)?;
            computed.insert(aggregate_fingerprint(aggregate_expr), value);
        }
        let representative = group.first().map(|r| (*r).clone()).unwrap_or_else(|| empty_row.clone());

        if let Some(having) = &select.having {
            let ctx = EvalContext {
                schema: &source.schema,
                row: &representative,
                params,
                aggregates: Some(&computed),
            };
            if !eval::is_truthy(&eval::eval(having, &ctx)?) {
                continue;
            }
        }

        let mut out_values = Vec::with_capacity(exprs.len());
        for expr in &exprs {
            let ctx = EvalContext {
                schema: &source.schema,
                row: &representative,
                params,
                aggregates: Some(&computed),
            };
            out_values.push(eval::eval(expr, &ctx)?);
        }
        output.push((computed, representative, out_values));
    }

    if !select.order_by.is_empty() {
        sort_groups(&mut output, select, source, &columns, params)?;
    }

    let rows = output
        .into_iter()
        .map(|(_, _, values)| Row::new(columns.clone(), values))
        .collect();
    Ok((columns, rows))
}

/// Dispatch to the columnar kernels when the query shape allows it:
/// single base table, ungrouped, plain aggregates over numeric columns,
/// and a scan that was either unfiltered or index-backed.
fn columnar_fast_path(
    select: &Select,
    source: &Source,
    exprs: &[&Expr],
    columns: &Arc<Vec<String>>,
) -> Result<Option<Vec<Row>>> {
    let Some(def) = &source.table else {
        return Ok(None);
    };
    if select.having.is_some() || select.distinct || !select.order_by.is_empty() {
        return Ok(None);
    }
    if select.where_clause.is_some() && !source.index_backed {
        return Ok(None);
    }
    // Every projected expression must be exactly one supported aggregate.
    for expr in exprs {
        let Expr::Aggregate { func, arg, distinct } = expr else {
            return Ok(None);
        };
        if *distinct || *func == AggFunc::GroupConcat {
            return Ok(None);
        }
        match arg.as_deref() {
            None => {} // COUNT(*)
            Some(Expr::Column { name, .. }) => {
                let Some(column) = def.column(name) else {
                    return Ok(None);
                };
                if !column.data_type.is_numeric() {
                    return Ok(None);
                }
            }
            Some(_) => return Ok(None),
        }
    }

    let schema: Vec<(String, DataType)> = def
        .columns
        .iter()
        .map(|c| (c.name.clone(), c.data_type))
        .collect();
    let store = ColumnStore::from_rows(&schema, &source.rows);

    let mut values = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let Expr::Aggregate { func, arg, .. } = expr else { unreachable!("checked above") };
        let value = match (func, arg.as_deref()) {
            (AggFunc::Count, None) => Value::Integer(store.row_count() as i64),
            (AggFunc::Count, Some(Expr::Column { name, .. })) => {
                Value::Integer(store.count(name)? as i64)
            }
            (AggFunc::Sum, Some(Expr::Column { name, .. })) => store.sum(name)?,
            (AggFunc::Avg, Some(Expr::Column { name, .. })) => store.average(name)?,
            (AggFunc::Min, Some(Expr::Column { name, .. })) => store.min(name)?,
            (AggFunc::Max, Some(Expr::Column { name, .. })) => store.max(name)?,
            _ => return Ok(None),
        };
        values.push(value);
    }
    Ok(Some(vec![Row::new(columns.clone(), values)]))
}

fn collect_aggregates(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Aggregate { .. } => {
            let fingerprint = aggregate_fingerprint(expr);
            if !out.iter().any(|e| aggregate_fingerprint(e) == fingerprint) {
                out.push(expr.clone());
            }
        }
        Expr::Binary { left, right, .. } => {
            collect_aggregates(left, out);
            collect_aggregates(right, out);
        }
        Expr::Unary { operand, .. } => collect_aggregates(operand, out),
        Expr::Like { expr, pattern, .. } => {
            collect_aggregates(expr, out);
            collect_aggregates(pattern, out);
        }
        Expr::InList { expr, items, .. } => {
            collect_aggregates(expr, out);
            for item in items {
                collect_aggregates(item, out);
            }
        }
        Expr::Between { expr, low, high, .. } => {
            collect_aggregates(expr, out);
            collect_aggregates(low, out);
            collect_aggregates(high, out);
        }
        Expr::IsNull { expr, .. } => collect_aggregates(expr, out),
        Expr::Function { args, .. } => {
            for arg in args {
                collect_aggregates(arg, out);
            }
        }
        _ => {}
    }
}

enum SumAcc {
    Int(i64),
    Real(f64),
    Decimal(Decimal),
}

impl SumAcc {
    fn add(self, value: &Value) -> Result<SumAcc> {
        let overflow = || VaultError::Execution("integer overflow in SUM".to_string());
        Ok(match (self, value) {
            (SumAcc::Int(acc), Value::Integer(v)) => {
                SumAcc::Int(acc.checked_add(*v).ok_or_else(overflow)?)
            }
            (SumAcc::Int(acc), Value::Real(v)) => SumAcc::Real(acc as f64 + v),
            (SumAcc::Int(acc), Value::Decimal(d)) => SumAcc::Decimal(Decimal::from(acc) + d),
            (SumAcc::Real(acc), v) => SumAcc::Real(
                acc + v
                    .as_f64()
                    .ok_or_else(|| VaultError::Type(format!("SUM of {}", v.type_name())))?,
            ),
            (SumAcc::Decimal(acc), Value::Integer(v)) => SumAcc::Decimal(acc + Decimal::from(*v)),
            (SumAcc::Decimal(acc), Value::Decimal(d)) => SumAcc::Decimal(acc + d),
            (SumAcc::Decimal(acc), Value::Real(v)) => {
                use rust_decimal::prelude::ToPrimitive;
                SumAcc::Real(acc.to_f64().unwrap_or(0.0) + v)
            }
            (_, other) => {
                return Err(VaultError::Type(format!("SUM of {}", other.type_name())));
            }
        })
    }

    fn into_value(self) -> Value {
        match self {
            SumAcc::Int(v) => Value::Integer(v),
            SumAcc::Real(v) => Value::Real(v),
            SumAcc::Decimal(v) => Value::Decimal(v),
        }
    }
}

fn compute_aggregate(
    func: AggFunc,
    arg: Option<&Expr>,
    distinct: bool,
    rows: &[&Vec<Value>],
    source: &Source,
    params: &Params,
) -> Result<Value> {
    if func == AggFunc::Count && arg.is_none() {
        return Ok(Value::Integer(rows.len() as i64));
    }
    let arg = arg.ok_or_else(|| {
        VaultError::Execution(format!("{} requires an argument", func.name()))
    })?;
    let arg_fn = compile::compile_expr(arg, &source.schema)?;

    let mut seen = std::collections::HashSet::new();
    let mut values: Vec<Value> = Vec::new();
    for row in rows {
        let value = arg_fn(row, params)?;
        if value.is_null() {
            continue;
        }
        if distinct && !seen.insert(format!("{value:?}")) {
            continue;
        }
        values.push(value);
    }

    Ok(match func {
        AggFunc::Count => Value::Integer(values.len() as i64),
        AggFunc::GroupConcat => {
            if values.is_empty() {
                Value::Null
            } else {
                Value::Text(
                    values
                        .iter()
                        .map(Value::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                )
            }
        }
        AggFunc::Sum => {
            if values.is_empty() {
                Value::Null
            } else {
                let mut acc = SumAcc::Int(0);
                for value in &values {
                    acc = acc.add(value)?;
                }
                acc.into_value()
            }
        }
        AggFunc::Avg => {
            if values.is_empty() {
                Value::Null
            } else {
                let count = values.len();
                let mut acc = SumAcc::Int(0);
                for value in &values {
                    acc = acc.add(value)?;
                }
                match acc {
                    SumAcc::Decimal(total) => Value::Decimal(total / Decimal::from(count as i64)),
                    SumAcc::Int(total) => Value::Real(total as f64 / count as f64),
                    SumAcc::Real(total) => Value::Real(total / count as f64),
                }
            }
        }
        AggFunc::Min => values
            .into_iter()
            .min_by(|a, b| order_compare(a, b))
            .unwrap_or(Value::Null),
        AggFunc::Max => values
            .into_iter()
            .max_by(|a, b| order_compare(a, b))
            .unwrap_or(Value::Null),
    })
}

type GroupOutput = (HashMap<String, Value>, Vec<Value>, Vec<Value>);

fn sort_groups(
    output: &mut [GroupOutput],
    select: &Select,
    source: &Source,
    columns: &Arc<Vec<String>>,
    params: &Params,
) -> Result<()> {
    let mut decorated: Vec<(Vec<Value>, GroupOutput)> = Vec::with_capacity(output.len());
    for (computed, representative, values) in output.iter() {
        let mut keys = Vec::with_capacity(select.order_by.len());
        for item in &select.order_by {
            let key = match &item.expr {
                Expr::Literal(Literal::Integer(position)) if *position >= 1 => values
                    .get((*position - 1) as usize)
                    .cloned()
                    .unwrap_or(Value::Null),
                Expr::Column { table: None, name }
                    if columns.iter().any(|c| c.eq_ignore_ascii_case(name))
                        && source.schema.resolve(None, name).is_err() =>
                {
                    let position = columns
                        .iter()
                        .position(|c| c.eq_ignore_ascii_case(name))
                        .expect("checked above");
                    values.get(position).cloned().unwrap_or(Value::Null)
                }
                expr => {
                    let ctx = EvalContext {
                        schema: &source.schema,
                        row: representative,
                        params,
                        aggregates: Some(computed),
                    };
                    eval::eval(expr, &ctx)?
                }
            };
            keys.push(key);
        }
        decorated.push((keys, (computed.clone(), representative.clone(), values.clone())));
    }
    decorated.sort_by(|a, b| {
        for (position, item) in select.order_by.iter().enumerate() {
            let ordering = order_compare(&a.0[position], &b.0[position]);
            let ordering = if item.descending { ordering.reverse() } else { ordering };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
    for (slot, (_, group)) in output.iter_mut().zip(decorated) {
        *slot = group;
    }
    Ok(())
}
