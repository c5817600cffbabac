use std::sync::Arc;

use rand::RngCore;
use tempfile::TempDir;
use vaultdb::crypto::RecordCrypto;
use vaultdb::{Database, DatabaseConfig, MasterKey, Value};

fn test_key() -> MasterKey {
    MasterKey::new([0x42u8; 32])
}

#[test]
fn test_concurrent_encryption_roundtrip_distinct_ciphertexts() {
    let crypto = Arc::new(RecordCrypto::new(&test_key()));
    let handles: Vec<_> = (0..100)
        .map(|_| {
            let crypto = crypto.clone();
            std::thread::spawn(move || {
                let mut plain = vec![0u8; 1024];
                rand::thread_rng().fill_bytes(&mut plain);
                let encrypted = crypto.encrypt(&plain).unwrap();
                assert_eq!(crypto.decrypt(&encrypted).unwrap(), plain);
                encrypted
            })
        })
        .collect();

    let blobs: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for i in 0..blobs.len() {
        for j in i + 1..blobs.len() {
            assert_ne!(blobs[i], blobs[j], "ciphertexts {i} and {j} collided");
        }
    }
}

#[test]
fn test_wrong_password_cannot_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let mut db =
            Database::create_with_password(&path, "correct horse", DatabaseConfig::default())
                .unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        db.close().unwrap();
    }
    assert!(Database::open_with_password(&path, "battery staple", DatabaseConfig::default())
        .is_err());
    let mut db =
        Database::open_with_password(&path, "correct horse", DatabaseConfig::default()).unwrap();
    assert!(db.query("SELECT * FROM t").unwrap().is_empty());
}

#[test]
fn test_plaintext_never_touches_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let secret = "extremely-secret-payload-string";
    {
        let mut db = Database::create(&path, &test_key(), DatabaseConfig::default()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        db.execute(&format!("INSERT INTO t VALUES (1, '{secret}')")).unwrap();
        db.close().unwrap();
    }
    for entry in std::fs::read_dir(&path).unwrap() {
        let entry = entry.unwrap();
        if entry.path().is_dir() {
            continue;
        }
        let bytes = std::fs::read(entry.path()).unwrap();
        let haystack = String::from_utf8_lossy(&bytes);
        assert!(
            !haystack.contains(secret),
            "plaintext found in {:?}",
            entry.path()
        );
    }
}

#[test]
fn test_no_encrypt_mode_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let config = DatabaseConfig::default().no_encrypt(true);
    {
        let mut db = Database::create(&path, &test_key(), config.clone()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        db.execute("INSERT INTO t VALUES (1, 'plain')").unwrap();
        db.close().unwrap();
    }
    let mut db = Database::open(&path, &test_key(), config).unwrap();
    let rows = db.query("SELECT v FROM t").unwrap();
    assert_eq!(rows[0].get("v"), Some(&Value::Text("plain".to_string())));
}

#[test]
fn test_encryption_flag_mismatch_refused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let mut db = Database::create(&path, &test_key(), DatabaseConfig::default()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        db.close().unwrap();
    }
    // An encrypted database refuses to load with no_encrypt_mode set.
    let result = Database::open(&path, &test_key(), DatabaseConfig::default().no_encrypt(true));
    assert!(result.is_err());
}

#[test]
fn test_tampered_data_file_detected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let mut db = Database::create(&path, &test_key(), DatabaseConfig::default()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        db.execute("INSERT INTO t VALUES (1, 'integrity')").unwrap();
        db.close().unwrap();
    }
    // Flip one byte in the middle of the record log.
    let data_path = path.join("t.dat");
    let mut bytes = std::fs::read(&data_path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x40;
    std::fs::write(&data_path, bytes).unwrap();

    // The corrupted record fails authentication on open; the engine
    // truncates at the bad record rather than serving tampered data.
    match Database::open(&path, &test_key(), DatabaseConfig::default()) {
        Ok(mut db) => {
            let rows = db.query("SELECT * FROM t").unwrap();
            assert!(rows.is_empty());
        }
        Err(_) => {}
    }
}

#[test]
fn test_bulk_insert_through_buffered_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let config = DatabaseConfig::default().optimized_insert_path(true);
    let mut db = Database::create(&path, &test_key(), config).unwrap();
    db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();

    let rows: Vec<Vec<Value>> = (0..500)
        .map(|i| vec![Value::Integer(i), Value::Text(format!("bulk {i}"))])
        .collect();
    assert_eq!(db.bulk_insert("t", rows).unwrap(), 500);
    assert_eq!(db.query("SELECT * FROM t").unwrap().len(), 500);
    // The staging blob only outlives the import on a crash.
    assert!(!path.join("t.bulk").exists());

    db.close().unwrap();
    let mut db = Database::open(&path, &test_key(), DatabaseConfig::default().optimized_insert_path(true)).unwrap();
    assert_eq!(db.query("SELECT * FROM t").unwrap().len(), 500);
}

/// A batch blob that survived a crash (written and fsynced, but the rows
/// never materialized) is decrypted as one unit and replayed on open.
#[test]
fn test_bulk_import_blob_replayed_after_crash() {
    use vaultdb::crypto::BufferedEncryptor;
    use vaultdb::row::serialize_row;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let mut db = Database::create(
            &path,
            &test_key(),
            DatabaseConfig::default().optimized_insert_path(true),
        )
        .unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        db.close().unwrap();
    }

    // Reconstruct the crash state: the sealed batch is on disk, the
    // engine never saw the rows.
    let mut encryptor = BufferedEncryptor::new(&test_key());
    for i in 0..20i64 {
        encryptor.push(&serialize_row(&[
            Value::Integer(i),
            Value::Text(format!("batch {i}")),
        ]));
    }
    let sealed = encryptor.flush().unwrap().unwrap();
    std::fs::write(path.join("t.bulk"), &sealed).unwrap();

    let mut db = Database::open(&path, &test_key(), DatabaseConfig::default()).unwrap();
    let rows = db.query("SELECT * FROM t ORDER BY id").unwrap();
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[7].get("v"), Some(&Value::Text("batch 7".to_string())));
    assert!(!path.join("t.bulk").exists());
}

/// A torn or tampered batch blob fails authentication as a whole; the
/// entire batch is discarded rather than partially applied.
#[test]
fn test_torn_bulk_import_blob_discarded() {
    use vaultdb::crypto::BufferedEncryptor;
    use vaultdb::row::serialize_row;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let mut db = Database::create(
            &path,
            &test_key(),
            DatabaseConfig::default().optimized_insert_path(true),
        )
        .unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        db.close().unwrap();
    }

    let mut encryptor = BufferedEncryptor::new(&test_key());
    for i in 0..20i64 {
        encryptor.push(&serialize_row(&[
            Value::Integer(i),
            Value::Text(format!("batch {i}")),
        ]));
    }
    let mut sealed = encryptor.flush().unwrap().unwrap();
    sealed.truncate(sealed.len() - 7);
    std::fs::write(path.join("t.bulk"), &sealed).unwrap();

    let mut db = Database::open(&path, &test_key(), DatabaseConfig::default()).unwrap();
    assert!(db.query("SELECT * FROM t").unwrap().is_empty());
    assert!(!path.join("t.bulk").exists());
}
