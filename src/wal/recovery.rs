//! WAL recovery: read the journal back in order and hand the surviving
//! statements to the replay layer, then truncate durably.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Default)]
pub struct RecoveredWal {
    /// Replayable statements, in original append order.
    pub entries: Vec<String>,
    /// Whether a partial final line was discarded.
    pub had_torn_tail: bool,
}

/// Read the WAL file. A final line without `\n` is a torn write from a
/// crash mid-append and is discarded; comment (`#`) and blank lines are
/// skipped.
pub fn read_wal(path: &Path) -> Result<RecoveredWal> {
    let mut recovered = RecoveredWal::default();
    if !path.exists() {
        return Ok(recovered);
    }

    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;
    if raw.is_empty() {
        return Ok(recovered);
    }

    let valid_len = match raw.iter().rposition(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };
    if valid_len < raw.len() {
        warn!(
            dropped = raw.len() - valid_len,
            "WAL has a torn tail, discarding partial final line"
        );
        recovered.had_torn_tail = true;
    }

    let text = String::from_utf8_lossy(&raw[..valid_len]);
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        recovered.entries.push(trimmed.to_string());
    }
    debug!(entries = recovered.entries.len(), "WAL read for recovery");
    Ok(recovered)
}

/// Truncate and fsync the WAL so replayed effects become durable, with a
/// best-effort parent directory fsync for the metadata update.
pub fn truncate_wal_durably(path: &Path) -> Result<()> {
    let wal_file = File::create(path)?;
    wal_file.sync_all()?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_read_missing_wal_is_empty() {
        let dir = TempDir::new().unwrap();
        let recovered = read_wal(&dir.path().join("wal.log")).unwrap();
        assert!(recovered.entries.is_empty());
        assert!(!recovered.had_torn_tail);
    }

    #[test]
    fn test_read_preserves_order_and_skips_comments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        std::fs::write(
            &path,
            "# header comment\nCREATE TABLE t (id INTEGER)\n\nINSERT INTO t VALUES (1)\nINSERT INTO t VALUES (2)\n",
        )
        .unwrap();
        let recovered = read_wal(&path).unwrap();
        assert_eq!(
            recovered.entries,
            vec![
                "CREATE TABLE t (id INTEGER)",
                "INSERT INTO t VALUES (1)",
                "INSERT INTO t VALUES (2)",
            ]
        );
    }

    #[test]
    fn test_torn_tail_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"INSERT INTO t VALUES (1)\nINSERT INTO t VAL").unwrap();
        drop(file);

        let recovered = read_wal(&path).unwrap();
        assert_eq!(recovered.entries, vec!["INSERT INTO t VALUES (1)"]);
        assert!(recovered.had_torn_tail);
    }

    #[test]
    fn test_truncate_durably() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        std::fs::write(&path, "INSERT INTO t VALUES (1)\n").unwrap();
        truncate_wal_durably(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
