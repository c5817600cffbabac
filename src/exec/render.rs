//! Render statements back to SQL text for the WAL.
//!
//! WAL entries are logical statements replayed verbatim on recovery, so
//! parameters are inlined as literals and generated AUTO values are made
//! explicit. DATETIME renders as its tick count (exact), ULID/GUID as
//! text, BLOB as a hex literal.

use std::fmt::Write;

use crate::error::{Result, VaultError};
use crate::sql::ast::*;
use crate::sql::eval::{literal_value, Params};
use crate::types::Value;

pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) => {
            if v.fract() == 0.0 && v.is_finite() {
                format!("{v:.1}")
            } else {
                format!("{v}")
            }
        }
        Value::Decimal(d) => d.to_string(),
        Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::DateTime(ticks) => ticks.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Ulid(u) => format!("'{u}'"),
        Value::Guid(g) => format!("'{g}'"),
        Value::Blob(bytes) => {
            let mut out = String::with_capacity(3 + bytes.len() * 2);
            out.push_str("X'");
            for byte in bytes {
                let _ = write!(out, "{byte:02x}");
            }
            out.push('\'');
            out
        }
    }
}

/// Render an INSERT with every column explicit and every value a
/// literal. `values` are the final coerced rows (AUTO columns filled).
pub fn render_insert(table: &str, columns: &[String], rows: &[Vec<Value>]) -> String {
    let mut out = format!("INSERT INTO {table} ({}) VALUES ", columns.join(", "));
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('(');
        for (j, value) in row.iter().enumerate() {
            if j > 0 {
                out.push_str(", ");
            }
            out.push_str(&sql_literal(value));
        }
        out.push(')');
    }
    out
}

pub fn render_update(update: &Update, params: &Params) -> Result<String> {
    let mut out = format!("UPDATE {} SET ", update.table_name);
    for (i, (column, expr)) in update.assignments.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{column} = {}", render_expr(expr, params)?);
    }
    if let Some(where_clause) = &update.where_clause {
        let _ = write!(out, " WHERE {}", render_expr(where_clause, params)?);
    }
    Ok(out)
}

pub fn render_delete(delete: &Delete, params: &Params) -> Result<String> {
    let mut out = format!("DELETE FROM {}", delete.table_name);
    if let Some(where_clause) = &delete.where_clause {
        let _ = write!(out, " WHERE {}", render_expr(where_clause, params)?);
    }
    Ok(out)
}

pub fn render_create_table(create: &CreateTable) -> String {
    let mut out = format!("CREATE TABLE {} (", create.table_name);
    for (i, column) in create.columns.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&column.name);
        out.push(' ');
        out.push_str(column.data_type.name());
        if column.is_primary_key {
            out.push_str(" PRIMARY KEY");
        }
        if column.auto {
            out.push_str(" AUTO");
        }
        if column.is_unique {
            out.push_str(" UNIQUE");
        }
        if column.not_null && !column.is_primary_key {
            out.push_str(" NOT NULL");
        }
    }
    out.push(')');
    if let Some(engine) = create.storage {
        let _ = write!(out, " STORAGE = {}", engine.as_str());
    }
    out
}

pub fn render_create_index(create: &CreateIndex) -> String {
    format!(
        "CREATE {}INDEX {} ON {}({})",
        if create.is_unique { "UNIQUE " } else { "" },
        create.index_name,
        create.table_name,
        create.column_name
    )
}

fn binary_op_text(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Eq => "=",
        BinaryOp::Ne => "<>",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
    }
}

/// Render an expression with parameters inlined as literals.
pub fn render_expr(expr: &Expr, params: &Params) -> Result<String> {
    Ok(match expr {
        Expr::Literal(literal) => sql_literal(&literal_value(literal)),
        Expr::Resolved(value) => sql_literal(value),
        Expr::Param(param) => sql_literal(&params.get(param)?),
        Expr::Column { table: Some(table), name } => format!("{table}.{name}"),
        Expr::Column { table: None, name } => name.clone(),
        Expr::Binary { left, op, right } => format!(
            "({} {} {})",
            render_expr(left, params)?,
            binary_op_text(*op),
            render_expr(right, params)?
        ),
        Expr::Unary { op, operand } => {
            let symbol = match op {
                UnaryOp::Not => "NOT ",
                UnaryOp::Neg => "-",
            };
            format!("({symbol}{})", render_expr(operand, params)?)
        }
        Expr::Like { expr, pattern, negated } => format!(
            "({} {}LIKE {})",
            render_expr(expr, params)?,
            if *negated { "NOT " } else { "" },
            render_expr(pattern, params)?
        ),
        Expr::InList { expr, items, negated } => {
            let rendered: Result<Vec<String>> =
                items.iter().map(|item| render_expr(item, params)).collect();
            format!(
                "({} {}IN ({}))",
                render_expr(expr, params)?,
                if *negated { "NOT " } else { "" },
                rendered?.join(", ")
            )
        }
        Expr::Between { expr, low, high, negated } => format!(
            "({} {}BETWEEN {} AND {})",
            render_expr(expr, params)?,
            if *negated { "NOT " } else { "" },
            render_expr(low, params)?,
            render_expr(high, params)?
        ),
        Expr::IsNull { expr, negated } => format!(
            "({} IS {}NULL)",
            render_expr(expr, params)?,
            if *negated { "NOT " } else { "" }
        ),
        Expr::Function { name, args } => {
            let rendered: Result<Vec<String>> =
                args.iter().map(|arg| render_expr(arg, params)).collect();
            format!("{name}({})", rendered?.join(", "))
        }
        Expr::Aggregate { .. } | Expr::Subquery(_) | Expr::InSubquery { .. } => {
            return Err(VaultError::Internal(
                "aggregate or subquery in a WAL-logged mutation".to_string(),
            ));
        }
    })
}
