use crate::storage::EngineKind;
use crate::types::{DataType, Value};

#[derive(Debug, Clone)]
pub enum Statement {
    CreateTable(CreateTable),
    DropTable(DropTable),
    AlterTableRename(AlterTableRename),
    CreateIndex(CreateIndex),
    DropIndex(DropIndex),
    Insert(Insert),
    Select(Box<Select>),
    Update(Update),
    Delete(Delete),
    Vacuum(Option<String>),
    Pragma(Pragma),
    Begin,
    Commit,
    Rollback,
    /// Sentinel emitted where parsing failed; see `ParseOutcome::errors`.
    Error,
}

#[derive(Debug, Clone)]
pub struct CreateTable {
    pub table_name: String,
    pub columns: Vec<ColumnSpec>,
    pub storage: Option<EngineKind>,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: DataType,
    pub is_primary_key: bool,
    /// AUTO column: populated on insert when omitted.
    pub auto: bool,
    pub is_unique: bool,
    pub not_null: bool,
}

#[derive(Debug, Clone)]
pub struct DropTable {
    pub table_name: String,
    pub if_exists: bool,
}

#[derive(Debug, Clone)]
pub struct AlterTableRename {
    pub table_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone)]
pub struct CreateIndex {
    pub index_name: String,
    pub table_name: String,
    pub column_name: String,
    pub is_unique: bool,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone)]
pub struct DropIndex {
    pub index_name: String,
    pub if_exists: bool,
}

#[derive(Debug, Clone)]
pub struct Pragma {
    pub name: String,
    pub arg: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Insert {
    pub table_name: String,
    pub columns: Option<Vec<String>>,
    pub rows: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone)]
pub struct Select {
    pub distinct: bool,
    pub columns: Vec<SelectColumn>,
    /// None for table-less selects (`SELECT 1 + 1`).
    pub from: Option<TableRef>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

#[derive(Debug, Clone)]
pub enum SelectColumn {
    Star,
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone)]
pub enum TableRef {
    Table { name: String, alias: Option<String> },
    Subquery { select: Box<Select>, alias: String },
}

impl TableRef {
    /// The name this source binds in the row namespace.
    pub fn binding(&self) -> &str {
        match self {
            TableRef::Table { name, alias } => alias.as_deref().unwrap_or(name),
            TableRef::Subquery { alias, .. } => alias,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    /// None only for CROSS JOIN.
    pub on: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct OrderByItem {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub struct Update {
    pub table_name: String,
    pub assignments: Vec<(String, Expr)>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct Delete {
    pub table_name: String,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRef {
    /// `?`, numbered left to right from zero.
    Positional(usize),
    /// `@name`.
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    GroupConcat,
}

impl AggFunc {
    pub const fn name(self) -> &'static str {
        match self {
            AggFunc::Count => "COUNT",
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
            AggFunc::GroupConcat => "GROUP_CONCAT",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    Column {
        table: Option<String>,
        name: String,
    },
    Param(ParamRef),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        items: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        select: Box<Select>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Function {
        name: String,
        args: Vec<Expr>,
    },
    Aggregate {
        func: AggFunc,
        /// None for COUNT(*).
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
    /// Scalar subquery.
    Subquery(Box<Select>),
    /// Materialized value; produced by the executor when it replaces a
    /// subquery with its result, never by the parser.
    Resolved(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl Expr {
    /// Collect parameter references in evaluation order.
    pub fn collect_params(&self, out: &mut Vec<ParamRef>) {
        match self {
            Expr::Param(p) => {
                if !out.contains(p) {
                    out.push(p.clone());
                }
            }
            Expr::Binary { left, right, .. } => {
                left.collect_params(out);
                right.collect_params(out);
            }
            Expr::Unary { operand, .. } => operand.collect_params(out),
            Expr::Like { expr, pattern, .. } => {
                expr.collect_params(out);
                pattern.collect_params(out);
            }
            Expr::InList { expr, items, .. } => {
                expr.collect_params(out);
                for item in items {
                    item.collect_params(out);
                }
            }
            Expr::InSubquery { expr, select, .. } => {
                expr.collect_params(out);
                select.collect_params(out);
            }
            Expr::Between { expr, low, high, .. } => {
                expr.collect_params(out);
                low.collect_params(out);
                high.collect_params(out);
            }
            Expr::IsNull { expr, .. } => expr.collect_params(out),
            Expr::Function { args, .. } => {
                for arg in args {
                    arg.collect_params(out);
                }
            }
            Expr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.collect_params(out);
                }
            }
            Expr::Subquery(select) => select.collect_params(out),
            Expr::Literal(_) | Expr::Column { .. } | Expr::Resolved(_) => {}
        }
    }
}

impl Select {
    pub fn collect_params(&self, out: &mut Vec<ParamRef>) {
        for column in &self.columns {
            if let SelectColumn::Expr { expr, .. } = column {
                expr.collect_params(out);
            }
        }
        if let Some(TableRef::Subquery { select, .. }) = &self.from {
            select.collect_params(out);
        }
        for join in &self.joins {
            if let TableRef::Subquery { select, .. } = &join.table {
                select.collect_params(out);
            }
            if let Some(on) = &join.on {
                on.collect_params(out);
            }
        }
        if let Some(w) = &self.where_clause {
            w.collect_params(out);
        }
        for g in &self.group_by {
            g.collect_params(out);
        }
        if let Some(h) = &self.having {
            h.collect_params(out);
        }
        for o in &self.order_by {
            o.expr.collect_params(out);
        }
        if let Some(l) = &self.limit {
            l.collect_params(out);
        }
        if let Some(o) = &self.offset {
            o.collect_params(out);
        }
    }
}

impl Statement {
    pub fn collect_params(&self) -> Vec<ParamRef> {
        let mut out = Vec::new();
        match self {
            Statement::Insert(insert) => {
                for row in &insert.rows {
                    for expr in row {
                        expr.collect_params(&mut out);
                    }
                }
            }
            Statement::Select(select) => select.collect_params(&mut out),
            Statement::Update(update) => {
                for (_, expr) in &update.assignments {
                    expr.collect_params(&mut out);
                }
                if let Some(w) = &update.where_clause {
                    w.collect_params(&mut out);
                }
            }
            Statement::Delete(delete) => {
                if let Some(w) = &delete.where_clause {
                    w.collect_params(&mut out);
                }
            }
            _ => {}
        }
        out
    }

    /// Statements that mutate data or schema.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Statement::CreateTable(_)
                | Statement::DropTable(_)
                | Statement::AlterTableRename(_)
                | Statement::CreateIndex(_)
                | Statement::DropIndex(_)
                | Statement::Insert(_)
                | Statement::Update(_)
                | Statement::Delete(_)
                | Statement::Vacuum(_)
        )
    }
}
