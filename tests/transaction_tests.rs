use tempfile::TempDir;
use vaultdb::{Database, DatabaseConfig, MasterKey, Value};

fn open_db(dir: &TempDir) -> Database {
    Database::create(
        &dir.path().join("db"),
        &MasterKey::new([0x42u8; 32]),
        DatabaseConfig::default(),
    )
    .unwrap()
}

#[test]
fn test_commit_makes_writes_visible() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();

    db.execute("BEGIN").unwrap();
    db.execute("INSERT INTO t VALUES (1, 'one')").unwrap();
    db.execute("INSERT INTO t VALUES (2, 'two')").unwrap();
    // Uncommitted writes are visible inside the transaction.
    assert_eq!(db.query("SELECT * FROM t").unwrap().len(), 2);
    db.execute("COMMIT").unwrap();

    assert_eq!(db.query("SELECT * FROM t").unwrap().len(), 2);
}

#[test]
fn test_rollback_discards_writes() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
    db.execute("INSERT INTO t VALUES (1, 'keep')").unwrap();

    db.execute("BEGIN").unwrap();
    db.execute("INSERT INTO t VALUES (2, 'discard')").unwrap();
    db.execute("UPDATE t SET v = 'changed' WHERE id = 1").unwrap();
    db.execute("ROLLBACK").unwrap();

    let rows = db.query("SELECT * FROM t").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("v"), Some(&Value::Text("keep".to_string())));
}

#[test]
fn test_transaction_sees_own_updates() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)").unwrap();
    db.execute("INSERT INTO t VALUES (1, 10)").unwrap();

    db.begin().unwrap();
    db.execute("UPDATE t SET v = 20 WHERE id = 1").unwrap();
    let rows = db.query("SELECT v FROM t WHERE id = 1").unwrap();
    assert_eq!(rows[0].get("v"), Some(&Value::Integer(20)));
    db.commit().unwrap();
}

#[test]
fn test_nested_begin_rejected() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    db.execute("BEGIN").unwrap();
    assert!(db.execute("BEGIN").is_err());
    db.rollback();
}

#[test]
fn test_batch_is_atomic() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();

    // Empty batch is a no-op.
    assert_eq!(db.execute_batch(&[]).unwrap(), 0);

    let affected = db
        .execute_batch(&[
            "INSERT INTO t VALUES (1, 'a')",
            "INSERT INTO t VALUES (2, 'b')",
            "UPDATE t SET v = 'B' WHERE id = 2",
        ])
        .unwrap();
    assert_eq!(affected, 3);
    assert_eq!(db.query("SELECT * FROM t").unwrap().len(), 2);
}

#[test]
fn test_batch_failure_reports_index_and_rolls_back() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();

    let err = db
        .execute_batch(&[
            "INSERT INTO t VALUES (1, 'a')",
            "INSERT INTO t VALUES (1, 'duplicate pk')",
            "INSERT INTO t VALUES (3, 'never reached')",
        ])
        .unwrap_err();
    assert!(err.to_string().contains("statement 1"), "{err}");
    // The whole batch rolled back.
    assert_eq!(db.query("SELECT * FROM t").unwrap().len(), 0);
}

#[test]
fn test_snapshot_isolation_across_commit() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
    db.execute("INSERT INTO t VALUES (1, 'Alice')").unwrap();

    // Open a read-only snapshot, then update and commit concurrently.
    let snapshot = db.begin_snapshot();
    db.execute("UPDATE t SET name = 'Alice2' WHERE id = 1").unwrap();

    let old = db.query_snapshot(&snapshot, "SELECT name FROM t WHERE id = 1").unwrap();
    assert_eq!(old[0].get("name"), Some(&Value::Text("Alice".to_string())));

    // A fresh read sees the committed update.
    let new = db.query("SELECT name FROM t WHERE id = 1").unwrap();
    assert_eq!(new[0].get("name"), Some(&Value::Text("Alice2".to_string())));

    // The snapshot keeps its view until dropped.
    let still_old = db.query_snapshot(&snapshot, "SELECT name FROM t WHERE id = 1").unwrap();
    assert_eq!(still_old[0].get("name"), Some(&Value::Text("Alice".to_string())));
}

#[test]
fn test_snapshot_pins_versions_against_vacuum() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
    db.execute("INSERT INTO t VALUES (1, 'v1')").unwrap();

    let snapshot = db.begin_snapshot();
    db.execute("UPDATE t SET v = 'v2' WHERE id = 1").unwrap();
    db.execute("VACUUM").unwrap();

    // The pinned version survived the vacuum.
    let rows = db.query_snapshot(&snapshot, "SELECT v FROM t").unwrap();
    assert_eq!(rows[0].get("v"), Some(&Value::Text("v1".to_string())));

    drop(snapshot);
    db.execute("VACUUM").unwrap();
    let rows = db.query("SELECT v FROM t").unwrap();
    assert_eq!(rows[0].get("v"), Some(&Value::Text("v2".to_string())));
}

#[test]
fn test_vacuum_rejected_inside_transaction() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    db.execute("BEGIN").unwrap();
    assert!(db.execute("VACUUM").is_err());
    db.rollback();
}
