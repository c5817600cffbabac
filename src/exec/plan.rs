//! Rule-based access-path selection for single-table SELECTs.
//!
//! Plan types:
//!   IndexProbe(index, key)        - equality probe (hash or B-tree)
//!   IndexRange(index, lo, hi)     - B-tree range scan
//!   FullScan                      - everything else

use crate::index::{IndexKind, SecondaryIndex};
use crate::sql::ast::{BinaryOp, Expr};

#[derive(Debug)]
pub enum AccessPath {
    IndexProbe {
        /// Position in the table's index list.
        index: usize,
        key: Expr,
    },
    IndexRange {
        index: usize,
        lo: Option<Expr>,
        hi: Option<Expr>,
    },
    FullScan,
}

impl AccessPath {
    pub fn is_index_backed(&self) -> bool {
        !matches!(self, AccessPath::FullScan)
    }
}

/// A value expression usable as a probe key: no row dependence.
fn is_probe_value(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(_) | Expr::Param(_) | Expr::Resolved(_) => true,
        Expr::Unary { operand, .. } => is_probe_value(operand),
        _ => false,
    }
}

/// `column op value` (either side), normalized so the column is on the
/// left.
fn column_comparison<'e>(expr: &'e Expr) -> Option<(&'e str, BinaryOp, &'e Expr)> {
    let Expr::Binary { left, op, right } = expr else {
        return None;
    };
    let flipped = |op: BinaryOp| match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::Le => BinaryOp::Ge,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::Ge => BinaryOp::Le,
        other => other,
    };
    match (left.as_ref(), right.as_ref()) {
        (Expr::Column { name, .. }, value) if is_probe_value(value) => Some((name, *op, value)),
        (value, Expr::Column { name, .. }) if is_probe_value(value) => {
            Some((name, flipped(*op), value))
        }
        _ => None,
    }
}

/// Choose the access path for `where_clause` given the table's indexes.
/// Only the top level and the left spine of ANDs are inspected; the full
/// predicate is always re-applied to candidate rows, so this is purely a
/// pruning decision.
pub fn choose_access_path(
    where_clause: Option<&Expr>,
    indexes: &[SecondaryIndex],
) -> AccessPath {
    let Some(expr) = where_clause else {
        return AccessPath::FullScan;
    };
    find_path(expr, indexes)
}

fn find_path(expr: &Expr, indexes: &[SecondaryIndex]) -> AccessPath {
    if let Some((column, op, value)) = column_comparison(expr) {
        match op {
            BinaryOp::Eq => {
                if let Some(position) = index_on(indexes, column, None) {
                    return AccessPath::IndexProbe { index: position, key: value.clone() };
                }
            }
            BinaryOp::Lt | BinaryOp::Le => {
                if let Some(position) = index_on(indexes, column, Some(IndexKind::BTree)) {
                    return AccessPath::IndexRange {
                        index: position,
                        lo: None,
                        hi: Some(value.clone()),
                    };
                }
            }
            BinaryOp::Gt | BinaryOp::Ge => {
                if let Some(position) = index_on(indexes, column, Some(IndexKind::BTree)) {
                    return AccessPath::IndexRange {
                        index: position,
                        lo: Some(value.clone()),
                        hi: None,
                    };
                }
            }
            _ => {}
        }
    }

    if let Expr::Between { expr: operand, low, high, negated: false } = expr {
        if let Expr::Column { name, .. } = operand.as_ref() {
            if is_probe_value(low) && is_probe_value(high) {
                if let Some(position) = index_on(indexes, name, Some(IndexKind::BTree)) {
                    return AccessPath::IndexRange {
                        index: position,
                        lo: Some((**low).clone()),
                        hi: Some((**high).clone()),
                    };
                }
            }
        }
    }

    // Walk the AND spine: any conjunct can prune.
    if let Expr::Binary { left, op: BinaryOp::And, right } = expr {
        let path = find_path(left, indexes);
        if path.is_index_backed() {
            return path;
        }
        return find_path(right, indexes);
    }

    AccessPath::FullScan
}

fn index_on(indexes: &[SecondaryIndex], column: &str, kind: Option<IndexKind>) -> Option<usize> {
    indexes.iter().position(|index| {
        index.column.eq_ignore_ascii_case(column) && kind.map(|k| index.kind() == k).unwrap_or(true)
    })
}

/// Columns referenced by simple comparisons, for the advisor's query
/// frequency counters.
pub fn predicate_columns(expr: &Expr, out: &mut Vec<String>) {
    if let Some((column, _, _)) = column_comparison(expr) {
        if !out.iter().any(|c| c.eq_ignore_ascii_case(column)) {
            out.push(column.to_string());
        }
        return;
    }
    match expr {
        Expr::Binary { left, right, .. } => {
            predicate_columns(left, out);
            predicate_columns(right, out);
        }
        Expr::Between { expr, .. } | Expr::IsNull { expr, .. } | Expr::Like { expr, .. } => {
            if let Expr::Column { name, .. } = expr.as_ref() {
                if !out.iter().any(|c| c.eq_ignore_ascii_case(name)) {
                    out.push(name.clone());
                }
            }
        }
        Expr::InList { expr, .. } | Expr::InSubquery { expr, .. } => {
            if let Expr::Column { name, .. } = expr.as_ref() {
                if !out.iter().any(|c| c.eq_ignore_ascii_case(name)) {
                    out.push(name.clone());
                }
            }
        }
        Expr::Unary { operand, .. } => predicate_columns(operand, out),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::Statement;
    use crate::sql::parse_sql;

    fn where_of(sql: &str) -> Expr {
        let Statement::Select(select) = parse_sql(sql).into_single().unwrap() else {
            panic!("expected SELECT");
        };
        select.where_clause.unwrap()
    }

    fn indexes() -> Vec<SecondaryIndex> {
        vec![
            SecondaryIndex::new("h_id".into(), "id".into(), IndexKind::Hash, false),
            SecondaryIndex::new("b_age".into(), "age".into(), IndexKind::BTree, false),
        ]
    }

    #[test]
    fn test_equality_uses_probe() {
        let expr = where_of("SELECT * FROM t WHERE id = 5");
        assert!(matches!(
            choose_access_path(Some(&expr), &indexes()),
            AccessPath::IndexProbe { index: 0, .. }
        ));
    }

    #[test]
    fn test_flipped_equality() {
        let expr = where_of("SELECT * FROM t WHERE 5 = id");
        assert!(matches!(
            choose_access_path(Some(&expr), &indexes()),
            AccessPath::IndexProbe { index: 0, .. }
        ));
    }

    #[test]
    fn test_range_uses_btree() {
        let expr = where_of("SELECT * FROM t WHERE age > 30");
        assert!(matches!(
            choose_access_path(Some(&expr), &indexes()),
            AccessPath::IndexRange { index: 1, lo: Some(_), hi: None }
        ));
        let expr = where_of("SELECT * FROM t WHERE age BETWEEN 20 AND 30");
        assert!(matches!(
            choose_access_path(Some(&expr), &indexes()),
            AccessPath::IndexRange { index: 1, lo: Some(_), hi: Some(_) }
        ));
    }

    #[test]
    fn test_range_on_hash_only_column_scans() {
        let expr = where_of("SELECT * FROM t WHERE id > 3");
        assert!(matches!(
            choose_access_path(Some(&expr), &indexes()),
            AccessPath::FullScan
        ));
    }

    #[test]
    fn test_and_spine_finds_indexed_conjunct() {
        let expr = where_of("SELECT * FROM t WHERE name = 'x' AND id = 7");
        assert!(matches!(
            choose_access_path(Some(&expr), &indexes()),
            AccessPath::IndexProbe { index: 0, .. }
        ));
    }

    #[test]
    fn test_column_to_column_is_scan() {
        let expr = where_of("SELECT * FROM t WHERE id = other_id");
        assert!(matches!(
            choose_access_path(Some(&expr), &indexes()),
            AccessPath::FullScan
        ));
    }

    #[test]
    fn test_predicate_columns_collected() {
        let expr = where_of("SELECT * FROM t WHERE a = 1 AND b > 2 OR c LIKE 'x%'");
        let mut cols = Vec::new();
        predicate_columns(&expr, &mut cols);
        assert_eq!(cols, vec!["a", "b", "c"]);
    }
}
