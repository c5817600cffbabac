//! SELECT execution: sources, joins, filtering, projection, ordering.
//!
//! Pipeline: materialize subqueries -> build the row source (index
//! probe, range scan or full scan; joins are nested loops) -> compiled
//! WHERE filter -> aggregate or project -> DISTINCT -> ORDER BY ->
//! LIMIT/OFFSET. Index access paths over-approximate, so the WHERE
//! predicate is always re-applied to candidate rows.

use std::sync::Arc;

use crate::error::{Result, VaultError};
use crate::exec::aggregate;
use crate::exec::compile;
use crate::exec::plan::{self, AccessPath};
use crate::exec::{table_schema, DbCore, ExecResult, Row, SessionTx};
use crate::row::deserialize_row;
use crate::schema::TableDef;
use crate::sql::ast::*;
use crate::sql::eval::{self, EvalContext, Params, RowSchema};
use crate::types::Value;

/// Source rows plus what we know about where they came from.
pub(crate) struct Source {
    pub schema: RowSchema,
    pub rows: Vec<Vec<Value>>,
    /// Set when the source is exactly one base table (no joins).
    pub table: Option<TableDef>,
    /// Whether an index satisfied the WHERE pruning.
    pub index_backed: bool,
}

impl DbCore {
    pub(crate) fn execute_select_statement(
        &mut self,
        select: &Select,
        params: &Params,
        sql_text: Option<&str>,
    ) -> Result<ExecResult> {
        // Advisor observations happen before the cache: a cache hit is
        // still a query against the column.
        self.record_query_observations(select);

        let cacheable =
            self.config.query_cache_enabled && self.session.is_none() && sql_text.is_some();
        if cacheable {
            let sql = sql_text.expect("checked above");
            let fingerprint = params.fingerprint();
            let tables = &self.tables;
            if let Some(hit) = self.result_cache.get(sql, &fingerprint, |table| {
                tables.get(table).map(|t| t.write_epoch)
            }) {
                return Ok(ExecResult::Rows(hit.rows));
            }
        }

        let (_columns, rows) = self.run_select(select, params)?;

        if cacheable {
            let sql = sql_text.expect("checked above");
            let mut referenced = Vec::new();
            collect_tables(select, &mut referenced);
            let epochs: Vec<(String, u64)> = referenced
                .iter()
                .filter_map(|name| {
                    self.tables
                        .get(&name.to_lowercase())
                        .map(|t| (name.to_lowercase(), t.write_epoch))
                })
                .collect();
            self.result_cache
                .put(sql, &params.fingerprint(), rows.clone(), epochs);
        }
        Ok(ExecResult::Rows(rows))
    }

    pub(crate) fn run_select(
        &mut self,
        select: &Select,
        params: &Params,
    ) -> Result<(Arc<Vec<String>>, Vec<Row>)> {
        // Reads inside an open transaction must see its staged writes;
        // the session is threaded through explicitly so engine access
        // does not fight the borrow of `self.session`.
        let session = self.session.take();
        let result = self.run_select_with(select, params, session.as_ref());
        self.session = session;
        result
    }

    /// Run a SELECT against an explicit (snapshot) transaction.
    pub(crate) fn run_select_at(
        &mut self,
        select: &Select,
        params: &Params,
        session: &SessionTx,
    ) -> Result<(Arc<Vec<String>>, Vec<Row>)> {
        self.run_select_with(select, params, Some(session))
    }

    /// Feed the auto-index advisor's per-`(table, column)` frequency
    /// counters from a WHERE clause. Best-effort by construction.
    fn record_query_observations(&mut self, select: &Select) {
        let Some(TableRef::Table { name, .. }) = &select.from else {
            return;
        };
        if !select.joins.is_empty() {
            return;
        }
        let Some(where_clause) = &select.where_clause else {
            return;
        };
        let mut columns = Vec::new();
        plan::predicate_columns(where_clause, &mut columns);
        let observed: Vec<(String, String)> = match self.catalog.get(name) {
            Ok(def) => columns
                .into_iter()
                .filter(|column| def.column(column).is_some())
                .map(|column| (def.name.clone(), column))
                .collect(),
            Err(_) => return,
        };
        for (table, column) in observed {
            self.advisor.record_query(&table, &column);
        }
    }

    fn run_select_with(
        &mut self,
        select: &Select,
        params: &Params,
        session: Option<&SessionTx>,
    ) -> Result<(Arc<Vec<String>>, Vec<Row>)> {
        let select = self.materialize_select(select.clone(), params, session)?;
        let mut source = self.build_source(&select, params, session)?;

        if let Some(where_clause) = &select.where_clause {
            let predicate = compile::compile_predicate(where_clause, &source.schema)?;
            let mut kept = Vec::with_capacity(source.rows.len());
            for row in source.rows {
                if predicate(&row, params)? {
                    kept.push(row);
                }
            }
            source.rows = kept;
        }

        let (columns, mut rows) = if has_aggregates(&select) {
            aggregate::execute(&select, &source, params)?
        } else {
            self.project(&select, &source, params)?
        };

        apply_limit_offset(&select, params, &mut rows)?;
        Ok((columns, rows))
    }

    /// Replace scalar and IN subqueries with their materialized results.
    pub(crate) fn materialize_subqueries(
        &mut self,
        expr: Option<Expr>,
        params: &Params,
    ) -> Result<Option<Expr>> {
        let session = self.session.take();
        let result = match expr {
            Some(expr) => self.rewrite_expr(expr, params, session.as_ref()).map(Some),
            None => Ok(None),
        };
        self.session = session;
        result
    }

    fn materialize_select(
        &mut self,
        mut select: Select,
        params: &Params,
        session: Option<&SessionTx>,
    ) -> Result<Select> {
        select.columns = select
            .columns
            .into_iter()
            .map(|column| match column {
                SelectColumn::Star => Ok(SelectColumn::Star),
                SelectColumn::Expr { expr, alias } => Ok(SelectColumn::Expr {
                    expr: self.rewrite_expr(expr, params, session)?,
                    alias,
                }),
            })
            .collect::<Result<_>>()?;
        if let Some(where_clause) = select.where_clause.take() {
            select.where_clause = Some(self.rewrite_expr(where_clause, params, session)?);
        }
        if let Some(having) = select.having.take() {
            select.having = Some(self.rewrite_expr(having, params, session)?);
        }
        for join in &mut select.joins {
            if let Some(on) = join.on.take() {
                join.on = Some(self.rewrite_expr(on, params, session)?);
            }
        }
        Ok(select)
    }

    fn rewrite_expr(
        &mut self,
        expr: Expr,
        params: &Params,
        session: Option<&SessionTx>,
    ) -> Result<Expr> {
        Ok(match expr {
            Expr::Subquery(sub) => {
                let (_, rows) = self.run_select_with(&sub, params, session)?;
                if rows.len() > 1 {
                    return Err(VaultError::Execution(
                        "scalar subquery returned more than one row".to_string(),
                    ));
                }
                let value = rows
                    .into_iter()
                    .next()
                    .and_then(|row| row.into_values().into_iter().next())
                    .unwrap_or(Value::Null);
                Expr::Resolved(value)
            }
            Expr::InSubquery { expr, select, negated } => {
                let (_, rows) = self.run_select_with(&select, params, session)?;
                let items = rows
                    .into_iter()
                    .filter_map(|row| row.into_values().into_iter().next())
                    .map(Expr::Resolved)
                    .collect();
                Expr::InList {
                    expr: Box::new(self.rewrite_expr(*expr, params, session)?),
                    items,
                    negated,
                }
            }
            Expr::Binary { left, op, right } => Expr::Binary {
                left: Box::new(self.rewrite_expr(*left, params, session)?),
                op,
                right: Box::new(self.rewrite_expr(*right, params, session)?),
            },
            Expr::Unary { op, operand } => Expr::Unary {
                op,
                operand: Box::new(self.rewrite_expr(*operand, params, session)?),
            },
            Expr::Like { expr, pattern, negated } => Expr::Like {
                expr: Box::new(self.rewrite_expr(*expr, params, session)?),
                pattern: Box::new(self.rewrite_expr(*pattern, params, session)?),
                negated,
            },
            Expr::InList { expr, items, negated } => Expr::InList {
                expr: Box::new(self.rewrite_expr(*expr, params, session)?),
                items: items
                    .into_iter()
                    .map(|item| self.rewrite_expr(item, params, session))
                    .collect::<Result<_>>()?,
                negated,
            },
            Expr::Between { expr, low, high, negated } => Expr::Between {
                expr: Box::new(self.rewrite_expr(*expr, params, session)?),
                low: Box::new(self.rewrite_expr(*low, params, session)?),
                high: Box::new(self.rewrite_expr(*high, params, session)?),
                negated,
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(self.rewrite_expr(*expr, params, session)?),
                negated,
            },
            Expr::Function { name, args } => Expr::Function {
                name,
                args: args
                    .into_iter()
                    .map(|arg| self.rewrite_expr(arg, params, session))
                    .collect::<Result<_>>()?,
            },
            Expr::Aggregate { func, arg, distinct } => Expr::Aggregate {
                func,
                arg: match arg {
                    Some(arg) => Some(Box::new(self.rewrite_expr(*arg, params, session)?)),
                    None => None,
                },
                distinct,
            },
            leaf => leaf,
        })
    }

    fn build_source(
        &mut self,
        select: &Select,
        params: &Params,
        session: Option<&SessionTx>,
    ) -> Result<Source> {
        let Some(from) = &select.from else {
            let mut source = Source {
                schema: RowSchema::new(),
                rows: vec![Vec::new()],
                table: None,
                index_backed: false,
            };
            // Table-less aggregate (`SELECT COUNT(*)`) over zero rows.
            if has_aggregates(select) {
                source.rows.clear();
            }
            return Ok(source);
        };

        let single = select.joins.is_empty();
        let mut source = self.load_table_ref(from, select, params, session, single)?;

        for join in &select.joins {
            let right = self.load_table_ref(&join.table, select, params, session, false)?;
            source = join_sources(source, right, join, params)?;
        }
        Ok(source)
    }

    fn load_table_ref(
        &mut self,
        table_ref: &TableRef,
        select: &Select,
        params: &Params,
        session: Option<&SessionTx>,
        allow_index: bool,
    ) -> Result<Source> {
        match table_ref {
            TableRef::Subquery { select: sub, alias } => {
                let (columns, rows) = self.run_select_with(sub, params, session)?;
                let mut schema = RowSchema::new();
                for column in columns.iter() {
                    schema.push(Some(alias), column);
                }
                Ok(Source {
                    schema,
                    rows: rows.into_iter().map(Row::into_values).collect(),
                    table: None,
                    index_backed: false,
                })
            }
            TableRef::Table { name, alias } => {
                let def = self.catalog.get(name)?.clone();
                let binding = alias.as_deref().unwrap_or(&def.name);
                let schema = table_schema(&def, binding);

                // Index access only applies when this session has not
                // staged writes to the table (the index reflects only
                // committed state).
                let has_staged = session
                    .map(|s| s.ops.iter().any(|op| op.table() == def.name.to_lowercase()))
                    .unwrap_or(false);
                let path = if allow_index && !has_staged {
                    let runtime = self
                        .tables
                        .get(&def.name.to_lowercase())
                        .ok_or_else(|| VaultError::Internal(format!("no runtime for {name}")))?;
                    plan::choose_access_path(select.where_clause.as_ref(), &runtime.indexes)
                } else {
                    AccessPath::FullScan
                };

                let index_backed = path.is_index_backed();
                let rows = match path {
                    AccessPath::FullScan => self.full_scan(&def, session),
                    AccessPath::IndexProbe { index, key } => {
                        self.index_probe(&def, index, &key, params, session)?
                    }
                    AccessPath::IndexRange { index, lo, hi } => {
                        self.index_range(&def, index, lo.as_ref(), hi.as_ref(), params, session)?
                    }
                };
                Ok(Source { schema, rows, table: Some(def), index_backed })
            }
        }
    }

    fn full_scan(&self, def: &TableDef, session: Option<&SessionTx>) -> Vec<Vec<Value>> {
        let table_id = def.table_id;
        let scan = |tx: &crate::exec::Tx| {
            self.mvcc
                .scan_where(tx, |k| k.0 == table_id)
                .into_iter()
                .map(|(_, values)| (*values).clone())
                .collect()
        };
        match session {
            Some(session) => scan(&session.tx),
            None => {
                let tx = self.mvcc.begin_transaction(true);
                scan(&tx)
            }
        }
    }

    /// Probe value coerced to the indexed column's type so encoded keys
    /// match what was stored.
    fn probe_value(
        &self,
        def: &TableDef,
        column: &str,
        expr: &Expr,
        params: &Params,
    ) -> Result<Value> {
        let schema = RowSchema::new();
        let ctx = EvalContext::rowless(&schema, params);
        let value = eval::eval(expr, &ctx)?;
        let column_def = def
            .column(column)
            .ok_or_else(|| VaultError::Catalog(format!("no such column: {column}")))?;
        value.coerce(column_def.data_type)
    }

    fn index_probe(
        &mut self,
        def: &TableDef,
        index: usize,
        key: &Expr,
        params: &Params,
        session: Option<&SessionTx>,
    ) -> Result<Vec<Vec<Value>>> {
        let runtime = self
            .tables
            .get(&def.name.to_lowercase())
            .ok_or_else(|| VaultError::Internal(format!("no runtime for {}", def.name)))?;
        let column = runtime.indexes[index].column.clone();
        let value = self.probe_value(def, &column, key, params)?;
        let refs = runtime.indexes[index].find(&value)?;
        self.rows_for_refs(def, refs, session)
    }

    fn index_range(
        &mut self,
        def: &TableDef,
        index: usize,
        lo: Option<&Expr>,
        hi: Option<&Expr>,
        params: &Params,
        session: Option<&SessionTx>,
    ) -> Result<Vec<Vec<Value>>> {
        let runtime = self
            .tables
            .get(&def.name.to_lowercase())
            .ok_or_else(|| VaultError::Internal(format!("no runtime for {}", def.name)))?;
        let column = runtime.indexes[index].column.clone();
        let lo_value = match lo {
            Some(expr) => Some(self.probe_value(def, &column, expr, params)?),
            None => None,
        };
        let hi_value = match hi {
            Some(expr) => Some(self.probe_value(def, &column, expr, params)?),
            None => None,
        };
        let refs = runtime.indexes[index].find_range(lo_value.as_ref(), hi_value.as_ref())?;
        self.rows_for_refs(def, refs, session)
    }

    /// Resolve index hits to visible rows: engine read, then the MVCC
    /// visibility check through the reader's snapshot.
    fn rows_for_refs(
        &mut self,
        def: &TableDef,
        refs: Vec<crate::storage::RowRef>,
        session: Option<&SessionTx>,
    ) -> Result<Vec<Vec<Value>>> {
        let pk_position = def.columns.iter().position(|c| c.is_primary_key);
        let temp_tx;
        let tx = match session {
            Some(session) => &session.tx,
            None => {
                temp_tx = self.mvcc.begin_transaction(true);
                &temp_tx
            }
        };
        let runtime = self
            .tables
            .get_mut(&def.name.to_lowercase())
            .ok_or_else(|| VaultError::Internal(format!("no runtime for {}", def.name)))?;

        let mut rows = Vec::with_capacity(refs.len());
        for row_ref in refs {
            let Some(bytes) = runtime.engine.read(row_ref)? else {
                continue;
            };
            let values = deserialize_row(&bytes, def.columns.len())?;
            match pk_position {
                Some(position) => {
                    let pk = crate::index::key_encoding::encode_primary_key(&values[position])?;
                    if let Some(visible) = self.mvcc.get(&(def.table_id, pk), tx) {
                        rows.push((*visible).clone());
                    }
                }
                // Without a primary key there is no version chain to
                // consult; the engine row is the committed truth.
                None => rows.push(values),
            }
        }
        Ok(rows)
    }

    /// Non-aggregate projection.
    fn project(
        &mut self,
        select: &Select,
        source: &Source,
        params: &Params,
    ) -> Result<(Arc<Vec<String>>, Vec<Row>)> {
        let mut labels: Vec<String> = Vec::new();
        enum Output {
            Position(usize),
            Compiled(compile::ValueFn),
        }
        let mut outputs: Vec<Output> = Vec::new();

        for column in &select.columns {
            match column {
                SelectColumn::Star => {
                    for (position, label) in source.schema.labels().iter().enumerate() {
                        labels.push(label.clone());
                        outputs.push(Output::Position(position));
                    }
                }
                SelectColumn::Expr { expr: Expr::Column { table: Some(table), name }, .. }
                    if name == "*" =>
                {
                    let positions = source.schema.binding_positions(table);
                    if positions.is_empty() {
                        return Err(VaultError::Catalog(format!("unknown table alias: {table}")));
                    }
                    for position in positions {
                        labels.push(source.schema.labels()[position].clone());
                        outputs.push(Output::Position(position));
                    }
                }
                SelectColumn::Expr { expr, alias } => {
                    let label = match alias {
                        Some(alias) => alias.clone(),
                        None => default_label(expr, params),
                    };
                    labels.push(label);
                    outputs.push(Output::Compiled(compile::compile_expr(expr, &source.schema)?));
                }
            }
        }

        let columns = Arc::new(labels);
        let mut pairs: Vec<(Vec<Value>, Vec<Value>)> = Vec::with_capacity(source.rows.len());
        for row in &source.rows {
            let mut out = Vec::with_capacity(outputs.len());
            for output in &outputs {
                out.push(match output {
                    Output::Position(position) => {
                        row.get(*position).cloned().unwrap_or(Value::Null)
                    }
                    Output::Compiled(f) => f(row, params)?,
                });
            }
            pairs.push((row.clone(), out));
        }

        if select.distinct {
            let mut seen = std::collections::HashSet::new();
            pairs.retain(|(_, out)| seen.insert(format!("{out:?}")));
        }

        if !select.order_by.is_empty() {
            sort_pairs(&mut pairs, select, source, &columns, params)?;
        }

        let rows = pairs
            .into_iter()
            .map(|(_, out)| Row::new(columns.clone(), out))
            .collect();
        Ok((columns, rows))
    }
}

pub(crate) fn has_aggregates(select: &Select) -> bool {
    if !select.group_by.is_empty() || select.having.is_some() {
        return true;
    }
    select.columns.iter().any(|column| match column {
        SelectColumn::Star => false,
        SelectColumn::Expr { expr, .. } => contains_aggregate(expr),
    })
}

pub(crate) fn contains_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Aggregate { .. } => true,
        Expr::Binary { left, right, .. } => contains_aggregate(left) || contains_aggregate(right),
        Expr::Unary { operand, .. } => contains_aggregate(operand),
        Expr::Like { expr, pattern, .. } => contains_aggregate(expr) || contains_aggregate(pattern),
        Expr::InList { expr, items, .. } => {
            contains_aggregate(expr) || items.iter().any(contains_aggregate)
        }
        Expr::Between { expr, low, high, .. } => {
            contains_aggregate(expr) || contains_aggregate(low) || contains_aggregate(high)
        }
        Expr::IsNull { expr, .. } => contains_aggregate(expr),
        Expr::Function { args, .. } => args.iter().any(contains_aggregate),
        _ => false,
    }
}

pub(crate) fn default_label(expr: &Expr, params: &Params) -> String {
    match expr {
        Expr::Column { name, .. } => name.clone(),
        Expr::Aggregate { func, arg, distinct } => {
            let inner = match arg {
                None => "*".to_string(),
                Some(arg) => default_label(arg, params),
            };
            format!(
                "{}({}{})",
                func.name(),
                if *distinct { "DISTINCT " } else { "" },
                inner
            )
        }
        other => crate::exec::render::render_expr(other, params)
            .unwrap_or_else(|_| "expr".to_string()),
    }
}

fn collect_tables(select: &Select, out: &mut Vec<String>) {
    if let Some(TableRef::Table { name, .. }) = &select.from {
        out.push(name.clone());
    }
    if let Some(TableRef::Subquery { select: sub, .. }) = &select.from {
        collect_tables(sub, out);
    }
    for join in &select.joins {
        match &join.table {
            TableRef::Table { name, .. } => out.push(name.clone()),
            TableRef::Subquery { select: sub, .. } => collect_tables(sub, out),
        }
        collect_expr_tables(join.on.as_ref(), out);
    }
    // Subqueries anywhere in the statement were materialized against
    // their own tables; conservatively include every clause so cache
    // entries invalidate. The projection matters as much as WHERE:
    // `SELECT (SELECT COUNT(*) FROM t2) FROM t1` depends on t2.
    for column in &select.columns {
        if let SelectColumn::Expr { expr, .. } = column {
            collect_expr_tables(Some(expr), out);
        }
    }
    collect_expr_tables(select.where_clause.as_ref(), out);
    collect_expr_tables(select.having.as_ref(), out);
    for expr in &select.group_by {
        collect_expr_tables(Some(expr), out);
    }
    for item in &select.order_by {
        collect_expr_tables(Some(&item.expr), out);
    }
}

fn collect_expr_tables(expr: Option<&Expr>, out: &mut Vec<String>) {
    let Some(expr) = expr else { return };
    match expr {
        Expr::Subquery(sub) => collect_tables(sub, out),
        Expr::InSubquery { select, expr, .. } => {
            collect_tables(select, out);
            collect_expr_tables(Some(expr), out);
        }
        Expr::Binary { left, right, .. } => {
            collect_expr_tables(Some(left), out);
            collect_expr_tables(Some(right), out);
        }
        Expr::Unary { operand, .. } => collect_expr_tables(Some(operand), out),
        Expr::Like { expr, pattern, .. } => {
            collect_expr_tables(Some(expr), out);
            collect_expr_tables(Some(pattern), out);
        }
        Expr::Between { expr, low, high, .. } => {
            collect_expr_tables(Some(expr), out);
            collect_expr_tables(Some(low), out);
            collect_expr_tables(Some(high), out);
        }
        Expr::InList { expr, items, .. } => {
            collect_expr_tables(Some(expr), out);
            for item in items {
                collect_expr_tables(Some(item), out);
            }
        }
        Expr::IsNull { expr, .. } => collect_expr_tables(Some(expr), out),
        Expr::Function { args, .. } => {
            for arg in args {
                collect_expr_tables(Some(arg), out);
            }
        }
        Expr::Aggregate { arg: Some(arg), .. } => collect_expr_tables(Some(arg), out),
        _ => {}
    }
}

/// Nested-loop join. RIGHT iterates the right side outer so unmatched
/// right rows pad with NULL; FULL is LEFT plus unmatched right rows.
fn join_sources(left: Source, right: Source, join: &Join, params: &Params) -> Result<Source> {
    let mut schema = left.schema.clone();
    for (position, label) in right.schema.labels().iter().enumerate() {
        schema.push(right.schema.column_binding(position), label);
    }

    let on = match &join.on {
        Some(expr) => Some(compile::compile_predicate(expr, &schema)?),
        None => None,
    };
    let left_width = left.schema.len();
    let right_width = right.schema.len();

    let matches = |l: &Vec<Value>, r: &Vec<Value>| -> Result<Option<Vec<Value>>> {
        let mut combined = Vec::with_capacity(left_width + right_width);
        combined.extend(l.iter().cloned());
        combined.extend(r.iter().cloned());
        match &on {
            None => Ok(Some(combined)),
            Some(predicate) => {
                if predicate(&combined, params)? {
                    Ok(Some(combined))
                } else {
                    Ok(None)
                }
            }
        }
    };

    let mut rows = Vec::new();
    match join.kind {
        JoinKind::Inner | JoinKind::Cross => {
            for l in &left.rows {
                for r in &right.rows {
                    if let Some(combined) = matches(l, r)? {
                        rows.push(combined);
                    }
                }
            }
        }
        JoinKind::Left => {
            for l in &left.rows {
                let before = rows.len();
                for r in &right.rows {
                    if let Some(combined) = matches(l, r)? {
                        rows.push(combined);
                    }
                }
                if rows.len() == before {
                    let mut combined = l.clone();
                    combined.extend(std::iter::repeat(Value::Null).take(right_width));
                    rows.push(combined);
                }
            }
        }
        JoinKind::Right => {
            for r in &right.rows {
                let before = rows.len();
                for l in &left.rows {
                    if let Some(combined) = matches(l, r)? {
                        rows.push(combined);
                    }
                }
                if rows.len() == before {
                    let mut combined: Vec<Value> =
                        std::iter::repeat(Value::Null).take(left_width).collect();
                    combined.extend(r.iter().cloned());
                    rows.push(combined);
                }
            }
        }
        JoinKind::Full => {
            let mut right_matched = vec![false; right.rows.len()];
            for l in &left.rows {
                let before = rows.len();
                for (position, r) in right.rows.iter().enumerate() {
                    if let Some(combined) = matches(l, r)? {
                        right_matched[position] = true;
                        rows.push(combined);
                    }
                }
                if rows.len() == before {
                    let mut combined = l.clone();
                    combined.extend(std::iter::repeat(Value::Null).take(right_width));
                    rows.push(combined);
                }
            }
            for (position, r) in right.rows.iter().enumerate() {
                if !right_matched[position] {
                    let mut combined: Vec<Value> =
                        std::iter::repeat(Value::Null).take(left_width).collect();
                    combined.extend(r.iter().cloned());
                    rows.push(combined);
                }
            }
        }
    }

    Ok(Source { schema, rows, table: None, index_backed: left.index_backed })
}

/// NULLs sort first; incomparable values rank equal.
pub(crate) fn order_compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

fn sort_pairs(
    pairs: &mut [(Vec<Value>, Vec<Value>)],
    select: &Select,
    source: &Source,
    output_columns: &Arc<Vec<String>>,
    params: &Params,
) -> Result<()> {
    enum SortKey {
        Source(compile::ValueFn),
        Output(usize),
    }
    let mut keys: Vec<(SortKey, bool)> = Vec::with_capacity(select.order_by.len());
    for item in &select.order_by {
        let key = match &item.expr {
            // ORDER BY 2 = second output column.
            Expr::Literal(Literal::Integer(position)) if *position >= 1 => {
                let index = (*position - 1) as usize;
                if index >= output_columns.len() {
                    return Err(VaultError::Execution(format!(
                        "ORDER BY position {position} out of range"
                    )));
                }
                SortKey::Output(index)
            }
            expr => match compile::compile_expr(expr, &source.schema) {
                Ok(compiled) => SortKey::Source(compiled),
                // Not a source column: try an output alias.
                Err(original) => match &item.expr {
                    Expr::Column { table: None, name } => {
                        let position = output_columns
                            .iter()
                            .position(|c| c.eq_ignore_ascii_case(name))
                            .ok_or(original)?;
                        SortKey::Output(position)
                    }
                    _ => return Err(original),
                },
            },
        };
        keys.push((key, item.descending));
    }

    // Decorate with evaluated keys, sort once, undecorate.
    let mut decorated: Vec<(Vec<Value>, (Vec<Value>, Vec<Value>))> = Vec::with_capacity(pairs.len());
    for (source_row, output_row) in pairs.iter().cloned() {
        let mut row_keys = Vec::with_capacity(keys.len());
        for (key, _) in &keys {
            row_keys.push(match key {
                SortKey::Source(f) => f(&source_row, params)?,
                SortKey::Output(position) => {
                    output_row.get(*position).cloned().unwrap_or(Value::Null)
                }
            });
        }
        decorated.push((row_keys, (source_row, output_row)));
    }
    decorated.sort_by(|a, b| {
        for (position, (_, descending)) in keys.iter().enumerate() {
            let ordering = order_compare(&a.0[position], &b.0[position]);
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
    for (slot, (_, pair)) in pairs.iter_mut().zip(decorated) {
        *slot = pair;
    }
    Ok(())
}

pub(crate) fn apply_limit_offset(
    select: &Select,
    params: &Params,
    rows: &mut Vec<Row>,
) -> Result<()> {
    let eval_count = |expr: &Option<Expr>| -> Result<Option<usize>> {
        match expr {
            None => Ok(None),
            Some(expr) => {
                let schema = RowSchema::new();
                let ctx = EvalContext::rowless(&schema, params);
                let value = eval::eval(expr, &ctx)?;
                let count = value.as_i64().ok_or_else(|| {
                    VaultError::Execution("LIMIT/OFFSET must be an integer".to_string())
                })?;
                Ok(Some(count.max(0) as usize))
            }
        }
    };
    let offset = eval_count(&select.offset)?.unwrap_or(0);
    let limit = eval_count(&select.limit)?;

    if offset > 0 {
        if offset >= rows.len() {
            rows.clear();
        } else {
            rows.drain(..offset);
        }
    }
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    Ok(())
}
