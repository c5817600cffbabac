use super::*;
use crate::sql::ast::*;
use crate::storage::EngineKind;
use crate::types::DataType;

fn parse_one(sql: &str) -> Statement {
    parse_sql(sql).into_single().unwrap()
}

#[test]
fn test_create_table_with_storage() {
    let stmt = parse_one(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, tag ULID AUTO) STORAGE = PAGE_BASED",
    );
    let Statement::CreateTable(create) = stmt else {
        panic!("expected CREATE TABLE");
    };
    assert_eq!(create.table_name, "users");
    assert_eq!(create.columns.len(), 3);
    assert!(create.columns[0].is_primary_key);
    assert_eq!(create.columns[1].data_type, DataType::Text);
    assert!(create.columns[1].not_null);
    assert!(create.columns[2].auto);
    assert_eq!(create.storage, Some(EngineKind::PageBased));
    assert!(!create.if_not_exists);
}

#[test]
fn test_create_table_if_not_exists() {
    let Statement::CreateTable(create) =
        parse_one("CREATE TABLE IF NOT EXISTS t (id INTEGER)")
    else {
        panic!("expected CREATE TABLE");
    };
    assert!(create.if_not_exists);
}

#[test]
fn test_drop_table_if_exists() {
    let Statement::DropTable(drop) = parse_one("DROP TABLE IF EXISTS old_data") else {
        panic!("expected DROP TABLE");
    };
    assert!(drop.if_exists);
    assert_eq!(drop.table_name, "old_data");
}

#[test]
fn test_alter_rename() {
    let Statement::AlterTableRename(alter) = parse_one("ALTER TABLE a RENAME TO b") else {
        panic!("expected ALTER TABLE");
    };
    assert_eq!((alter.table_name.as_str(), alter.new_name.as_str()), ("a", "b"));
}

#[test]
fn test_create_unique_index() {
    let Statement::CreateIndex(index) =
        parse_one("CREATE UNIQUE INDEX idx_email ON users(email)")
    else {
        panic!("expected CREATE INDEX");
    };
    assert!(index.is_unique);
    assert_eq!(index.index_name, "idx_email");
    assert_eq!(index.column_name, "email");
}

#[test]
fn test_insert_with_params() {
    let Statement::Insert(insert) =
        parse_one("INSERT INTO t (a, b, c) VALUES (?, @name, 3)")
    else {
        panic!("expected INSERT");
    };
    assert_eq!(insert.columns.as_deref().unwrap().len(), 3);
    assert_eq!(insert.rows.len(), 1);
    assert!(matches!(
        insert.rows[0][0],
        Expr::Param(ParamRef::Positional(0))
    ));
    assert!(matches!(
        &insert.rows[0][1],
        Expr::Param(ParamRef::Named(n)) if n == "name"
    ));
}

#[test]
fn test_insert_multi_row() {
    let Statement::Insert(insert) = parse_one("INSERT INTO t VALUES (1, 'a'), (2, 'b')") else {
        panic!("expected INSERT");
    };
    assert_eq!(insert.rows.len(), 2);
    assert!(insert.columns.is_none());
}

#[test]
fn test_select_full_clause_set() {
    let Statement::Select(select) = parse_one(
        "SELECT d.name, COUNT(*) AS n FROM emp e INNER JOIN dept d ON e.dept_id = d.id \
         WHERE e.salary > 1000 GROUP BY d.name HAVING COUNT(*) > 2 \
         ORDER BY n DESC LIMIT 10 OFFSET 5",
    ) else {
        panic!("expected SELECT");
    };
    assert_eq!(select.columns.len(), 2);
    assert_eq!(select.joins.len(), 1);
    assert_eq!(select.joins[0].kind, JoinKind::Inner);
    assert!(select.where_clause.is_some());
    assert_eq!(select.group_by.len(), 1);
    assert!(select.having.is_some());
    assert_eq!(select.order_by.len(), 1);
    assert!(select.order_by[0].descending);
    assert!(matches!(select.limit, Some(Expr::Literal(Literal::Integer(10)))));
    assert!(matches!(select.offset, Some(Expr::Literal(Literal::Integer(5)))));
}

#[test]
fn test_join_kinds() {
    for (sql, kind) in [
        ("SELECT * FROM a JOIN b ON a.x = b.x", JoinKind::Inner),
        ("SELECT * FROM a LEFT JOIN b ON a.x = b.x", JoinKind::Left),
        ("SELECT * FROM a LEFT OUTER JOIN b ON a.x = b.x", JoinKind::Left),
        ("SELECT * FROM a RIGHT JOIN b ON a.x = b.x", JoinKind::Right),
        ("SELECT * FROM a FULL OUTER JOIN b ON a.x = b.x", JoinKind::Full),
    ] {
        let Statement::Select(select) = parse_one(sql) else {
            panic!("expected SELECT for {sql}");
        };
        assert_eq!(select.joins[0].kind, kind, "{sql}");
    }
}

#[test]
fn test_subquery_in_from_and_where() {
    let Statement::Select(select) = parse_one(
        "SELECT * FROM (SELECT id FROM t WHERE x > 1) sub WHERE id IN (SELECT id FROM u)",
    ) else {
        panic!("expected SELECT");
    };
    assert!(matches!(select.from, Some(TableRef::Subquery { .. })));
    assert!(matches!(select.where_clause, Some(Expr::InSubquery { .. })));
}

#[test]
fn test_between_and_like() {
    let Statement::Select(select) =
        parse_one("SELECT * FROM t WHERE a BETWEEN 1 AND 10 AND name LIKE 'A%'")
    else {
        panic!("expected SELECT");
    };
    let Some(Expr::Binary { left, op: BinaryOp::And, right }) = select.where_clause else {
        panic!("expected AND");
    };
    assert!(matches!(*left, Expr::Between { negated: false, .. }));
    assert!(matches!(*right, Expr::Like { negated: false, .. }));
}

#[test]
fn test_not_in_list() {
    let Statement::Select(select) = parse_one("SELECT * FROM t WHERE a NOT IN (1, 2, 3)") else {
        panic!("expected SELECT");
    };
    assert!(matches!(
        select.where_clause,
        Some(Expr::InList { negated: true, .. })
    ));
}

#[test]
fn test_aggregates() {
    let Statement::Select(select) = parse_one(
        "SELECT COUNT(*), COUNT(DISTINCT city), SUM(x), AVG(x), MIN(x), MAX(x), GROUP_CONCAT(name) FROM t",
    ) else {
        panic!("expected SELECT");
    };
    assert_eq!(select.columns.len(), 7);
    let SelectColumn::Expr { expr: Expr::Aggregate { func, arg, .. }, .. } = &select.columns[0]
    else {
        panic!("expected aggregate");
    };
    assert_eq!(*func, AggFunc::Count);
    assert!(arg.is_none());
    let SelectColumn::Expr { expr: Expr::Aggregate { distinct, .. }, .. } = &select.columns[1]
    else {
        panic!("expected aggregate");
    };
    assert!(distinct);
}

#[test]
fn test_vacuum_and_pragma() {
    assert!(matches!(parse_one("VACUUM"), Statement::Vacuum(None)));
    assert!(matches!(
        parse_one("VACUUM users"),
        Statement::Vacuum(Some(t)) if t == "users"
    ));
    let Statement::Pragma(pragma) = parse_one("PRAGMA index_list(users)") else {
        panic!("expected PRAGMA");
    };
    assert_eq!(pragma.name, "index_list");
    assert_eq!(pragma.arg.as_deref(), Some("users"));
}

#[test]
fn test_transaction_statements() {
    assert!(matches!(parse_one("BEGIN"), Statement::Begin));
    assert!(matches!(parse_one("COMMIT"), Statement::Commit));
    assert!(matches!(parse_one("ROLLBACK"), Statement::Rollback));
}

#[test]
fn test_multiple_statements() {
    let outcome = parse_sql("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1); SELECT * FROM t;");
    assert!(outcome.is_clean());
    assert_eq!(outcome.statements.len(), 3);
}

#[test]
fn test_malformed_statement_recovers() {
    let outcome = parse_sql("INSERT INTO VALUES oops; SELECT * FROM t");
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.statements.len(), 2);
    assert!(matches!(outcome.statements[0], Statement::Error));
    assert!(matches!(outcome.statements[1], Statement::Select(_)));
}

#[test]
fn test_select_clause_recovery() {
    // Bad WHERE clause: error recorded, ORDER BY still parsed.
    let outcome = parse_sql("SELECT * FROM t WHERE + ORDER BY id DESC");
    assert!(!outcome.errors.is_empty());
    assert_eq!(outcome.statements.len(), 1);
    let Statement::Select(select) = &outcome.statements[0] else {
        panic!("expected recovered SELECT");
    };
    assert!(select.where_clause.is_none());
    assert_eq!(select.order_by.len(), 1);
}

#[test]
fn test_never_panics_on_garbage() {
    for sql in [
        "((((",
        "SELECT",
        "CREATE TABLE",
        "12345",
        "WHERE x = 1",
        "INSERT INSERT INSERT",
        "SELECT * FROM t WHERE",
        "'unterminated",
        "DROP",
    ] {
        let outcome = parse_sql(sql);
        assert!(!outcome.statements.is_empty(), "no AST for {sql:?}");
        assert!(!outcome.errors.is_empty(), "no errors for {sql:?}");
    }
}

#[test]
fn test_error_carries_position() {
    let outcome = parse_sql("SELECT * FROM t WHERE x ==");
    assert!(!outcome.errors.is_empty());
    assert!(outcome.errors[0].position > 0);
}

#[test]
fn test_table_less_select() {
    let Statement::Select(select) = parse_one("SELECT 1 + 2") else {
        panic!("expected SELECT");
    };
    assert!(select.from.is_none());
}

#[test]
fn test_positional_params_numbered_in_order() {
    let Statement::Select(select) = parse_one("SELECT * FROM t WHERE a = ? AND b = ?") else {
        panic!("expected SELECT");
    };
    let params = Statement::Select(select).collect_params();
    assert_eq!(
        params,
        vec![ParamRef::Positional(0), ParamRef::Positional(1)]
    );
}
