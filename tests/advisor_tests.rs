//! Auto-index advisor behavior through the database surface.

use tempfile::TempDir;
use vaultdb::{Database, DatabaseConfig, MasterKey};

fn open_db(dir: &TempDir) -> Database {
    Database::create(
        &dir.path().join("db"),
        &MasterKey::new([0x42u8; 32]),
        DatabaseConfig::default(),
    )
    .unwrap()
}

fn seed(db: &mut Database) {
    db.execute(
        "CREATE TABLE users (id INTEGER, active BOOLEAN, rarely_queried INTEGER)",
    )
    .unwrap();
    let mut batch = Vec::new();
    for i in 0..1000 {
        batch.push(format!("({i}, {}, {})", if i % 2 == 0 { "TRUE" } else { "FALSE" }, i % 3));
    }
    for chunk in batch.chunks(250) {
        db.execute(&format!("INSERT INTO users VALUES {}", chunk.join(", "))).unwrap();
    }
}

#[test]
fn test_unique_column_gets_hash_index_boolean_does_not() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    seed(&mut db);

    let created = db.analyze_and_create_indexes("users").unwrap();
    assert_eq!(created.len(), 1, "{created:?}");
    assert!(created[0].contains("HASH"));
    assert!(created[0].contains("users.id"));

    let listing = db.pragma_index_list("users").unwrap();
    assert!(listing.contains("idx_auto_users_id"));
    assert!(!listing.contains("active"));
}

#[test]
fn test_query_frequency_triggers_index() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    seed(&mut db);

    // Low selectivity alone recommends nothing for rarely_queried.
    let created = db.analyze_and_create_indexes("users").unwrap();
    assert!(created.iter().all(|c| !c.contains("rarely_queried")));

    for i in 0..15 {
        db.query(&format!("SELECT * FROM users WHERE rarely_queried = {}", i % 3)).unwrap();
    }
    let created = db.analyze_and_create_indexes("users").unwrap();
    assert_eq!(created.len(), 1, "{created:?}");
    assert!(created[0].contains("rarely_queried"));
    assert!(created[0].contains("BTREE"));
}

#[test]
fn test_advisor_never_duplicates_indexes() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    seed(&mut db);

    db.analyze_and_create_indexes("users").unwrap();
    // A second pass has nothing new to create.
    let again = db.analyze_and_create_indexes("users").unwrap();
    assert!(again.is_empty(), "{again:?}");
}

#[test]
fn test_pragma_analyze_statement() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    seed(&mut db);

    let result = db.execute("PRAGMA analyze(users)").unwrap();
    let vaultdb::ExecResult::Message(message) = result else {
        panic!("expected a message");
    };
    assert!(message.contains("idx_auto_users_id"), "{message}");
}

#[test]
fn test_pragma_listings() {
    let dir = TempDir::new().unwrap();
    let mut db = open_db(&dir);
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY AUTO, email TEXT UNIQUE, age INTEGER)")
        .unwrap();
    db.execute("CREATE INDEX idx_age ON t(age)").unwrap();
    db.execute("INSERT INTO t (email, age) VALUES ('a@x', 30), ('b@x', 40)").unwrap();

    let info = db.pragma_table_info("t").unwrap();
    assert!(info.contains("0 id INTEGER PRIMARY KEY AUTO"));
    assert!(info.contains("2 age INTEGER"));

    let listing = db.pragma_index_list("t").unwrap();
    assert!(listing.contains("idx_age BTREE column=age"));
    assert!(listing.contains("selectivity=1.000"));
}

#[test]
fn test_advisor_survives_in_session_only() {
    // Frequency counters are runtime state, not persisted: after reopen
    // the counts start fresh.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let mut db =
            Database::create(&path, &MasterKey::new([0x42u8; 32]), DatabaseConfig::default())
                .unwrap();
        db.execute("CREATE TABLE t (a INTEGER)").unwrap();
        db.execute("INSERT INTO t VALUES (1), (1), (2)").unwrap();
        for _ in 0..20 {
            db.query("SELECT * FROM t WHERE a = 1").unwrap();
        }
        db.close().unwrap();
    }
    let mut db =
        Database::open(&path, &MasterKey::new([0x42u8; 32]), DatabaseConfig::default()).unwrap();
    let created = db.analyze_and_create_indexes("t").unwrap();
    assert!(created.is_empty());
}
