//! Crash-recovery scenarios: the database object is dropped without a
//! clean close, then reopened so WAL replay reconstructs the state.

use std::fs;
use tempfile::TempDir;
use vaultdb::{Database, DatabaseConfig, MasterKey, Value};

fn test_key() -> MasterKey {
    MasterKey::new([0x42u8; 32])
}

/// HYBRID tables keep committed mutations in the WAL until a
/// materialization point, which is what makes the crash window
/// observable.
#[test]
fn test_wal_survives_crash_and_replays_in_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let n = 20;
    {
        let mut db = Database::create(&path, &test_key(), DatabaseConfig::default()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT) STORAGE = HYBRID").unwrap();
        for i in 0..n {
            db.execute(&format!("INSERT INTO t VALUES ({i}, 'row {i}')")).unwrap();
        }
        // Simulate a crash: drop without close().
        std::mem::forget(db);
    }

    // Every committed insert is durable in the WAL, one line each, in
    // original order.
    let wal = fs::read_to_string(path.join("wal.log")).unwrap();
    let inserts: Vec<&str> = wal.lines().filter(|l| l.starts_with("INSERT")).collect();
    assert_eq!(inserts.len(), n);
    for (i, line) in inserts.iter().enumerate() {
        assert!(line.contains(&format!("({i}, ")), "line {i} out of order: {line}");
    }

    let mut db = Database::open(&path, &test_key(), DatabaseConfig::default()).unwrap();
    let rows = db.query("SELECT * FROM t ORDER BY id").unwrap();
    assert_eq!(rows.len(), n);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.get("v"), Some(&Value::Text(format!("row {i}"))));
    }

    // Recovery truncated the WAL after a successful replay.
    assert_eq!(fs::metadata(path.join("wal.log")).unwrap().len(), 0);
}

#[test]
fn test_recovery_discards_torn_tail() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let mut db = Database::create(&path, &test_key(), DatabaseConfig::default()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT) STORAGE = HYBRID").unwrap();
        db.execute("INSERT INTO t VALUES (1, 'complete')").unwrap();
        std::mem::forget(db);
    }
    // Corrupt the journal: append a partial line with no newline.
    let wal_path = path.join("wal.log");
    let mut wal = fs::read(&wal_path).unwrap();
    wal.extend_from_slice(b"INSERT INTO t VALUES (2, 'torn");
    fs::write(&wal_path, wal).unwrap();

    let mut db = Database::open(&path, &test_key(), DatabaseConfig::default()).unwrap();
    let rows = db.query("SELECT * FROM t").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("v"), Some(&Value::Text("complete".to_string())));
}

#[test]
fn test_recovery_is_idempotent_for_ddl() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let mut db = Database::create(&path, &test_key(), DatabaseConfig::default()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY) STORAGE = HYBRID").unwrap();
        db.execute("INSERT INTO t VALUES (1)").unwrap();
        std::mem::forget(db);
    }
    // Inject a duplicate of already-applied DDL, as a crash between
    // catalog save and WAL truncate would leave behind.
    let wal_path = path.join("wal.log");
    let mut wal = String::from("CREATE TABLE t (id INTEGER PRIMARY KEY) STORAGE = HYBRID\n");
    wal.push_str(&fs::read_to_string(&wal_path).unwrap());
    fs::write(&wal_path, wal).unwrap();

    let mut db = Database::open(&path, &test_key(), DatabaseConfig::default()).unwrap();
    assert_eq!(db.query("SELECT * FROM t").unwrap().len(), 1);
}

#[test]
fn test_comments_in_wal_are_skipped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let mut db = Database::create(&path, &test_key(), DatabaseConfig::default()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY) STORAGE = HYBRID").unwrap();
        std::mem::forget(db);
    }
    let wal_path = path.join("wal.log");
    let mut wal = String::from("# journal comment\n");
    wal.push_str(&fs::read_to_string(&wal_path).unwrap());
    wal.push_str("INSERT INTO t VALUES (5)\n");
    fs::write(&wal_path, wal).unwrap();

    let mut db = Database::open(&path, &test_key(), DatabaseConfig::default()).unwrap();
    let rows = db.query("SELECT * FROM t").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&Value::Integer(5)));
}

#[test]
fn test_clean_close_leaves_empty_wal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let mut db = Database::create(&path, &test_key(), DatabaseConfig::default()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY) STORAGE = HYBRID").unwrap();
        db.execute("INSERT INTO t VALUES (1)").unwrap();
        db.close().unwrap();
    }
    assert_eq!(fs::metadata(path.join("wal.log")).unwrap().len(), 0);
    let mut db = Database::open(&path, &test_key(), DatabaseConfig::default()).unwrap();
    assert_eq!(db.query("SELECT * FROM t").unwrap().len(), 1);
}
