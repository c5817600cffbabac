//! Write-ahead log of logical SQL statements.
//!
//! One UTF-8 line per statement; lines starting with `#` are comments.
//! Appends only touch an in-memory buffer behind a mutex. Durability
//! comes from `flush`, which swaps the buffer out and performs the file
//! write and fsync outside the lock — committers arriving while a flush
//! is in flight wait on the same completion, which is what turns N
//! concurrent commits into one durability barrier (group commit).
//!
//! A failed write or fsync poisons the WAL: every subsequent operation
//! fails with `WalIo` until the database is reopened, and the database
//! layer degrades to read-only.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, VaultError};

struct WalState {
    buf: Vec<u8>,
    /// Entries appended so far.
    seq: u64,
    /// Entries known durable on disk.
    flushed_seq: u64,
    flushing: bool,
    poisoned: Option<String>,
}

pub struct Wal {
    state: Mutex<WalState>,
    cond: Condvar,
    file: Mutex<File>,
    path: PathBuf,
    /// Buffer size that triggers a non-durable drain to the OS.
    max_buffer: usize,
}

impl Wal {
    pub fn open(path: &Path, group_commit_size: usize, batch_multiplier: usize) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Wal {
            state: Mutex::new(WalState {
                buf: Vec::new(),
                seq: 0,
                flushed_seq: 0,
                flushing: false,
                poisoned: None,
            }),
            cond: Condvar::new(),
            file: Mutex::new(file),
            path: path.to_path_buf(),
            max_buffer: group_commit_size.max(512) * batch_multiplier.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check(state: &WalState) -> Result<()> {
        if let Some(ref msg) = state.poisoned {
            return Err(VaultError::WalIo(msg.clone()));
        }
        Ok(())
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned.is_some()
    }

    /// Log one statement. Buffer-only; call `flush` for durability.
    pub fn log(&self, op: &str) -> Result<()> {
        self.append_entry(op)
    }

    pub fn append_entry(&self, entry: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state)?;

        // One statement per line; embedded newlines are whitespace to SQL.
        state.seq += 1;
        for byte in entry.bytes() {
            state.buf.push(if byte == b'\n' { b' ' } else { byte });
        }
        state.buf.push(b'\n');

        if state.buf.len() >= self.max_buffer && !state.flushing {
            // Oversized buffer: push bytes to the OS without a barrier.
            // The next durable flush's fsync covers them.
            let data = std::mem::take(&mut state.buf);
            state.flushing = true;
            drop(state);
            let outcome = self.write_out(&data, false);
            let mut state = self.state.lock();
            state.flushing = false;
            self.cond.notify_all();
            if let Err(e) = outcome {
                let msg = e.to_string();
                state.poisoned = Some(msg.clone());
                return Err(VaultError::WalIo(msg));
            }
        }
        Ok(())
    }

    /// Buffered entry count that is not yet durable.
    pub fn unflushed_entries(&self) -> u64 {
        let state = self.state.lock();
        state.seq - state.flushed_seq
    }

    /// Write the buffer to the OS and issue the durability barrier.
    /// Entries logged before this call are guaranteed on disk afterwards.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        let my_target = state.seq;
        loop {
            Self::check(&state)?;
            if state.flushed_seq >= my_target {
                // Another committer's barrier already covered us.
                return Ok(());
            }
            if !state.flushing {
                break;
            }
            self.cond.wait(&mut state);
        }

        // Become the flusher: swap the buffer out, drain outside the lock.
        let target = state.seq;
        let data = std::mem::take(&mut state.buf);
        state.flushing = true;
        drop(state);

        let outcome = self.write_out(&data, true);

        let mut state = self.state.lock();
        state.flushing = false;
        match outcome {
            Ok(()) => {
                state.flushed_seq = state.flushed_seq.max(target);
                self.cond.notify_all();
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                state.poisoned = Some(msg.clone());
                self.cond.notify_all();
                Err(VaultError::WalIo(msg))
            }
        }
    }

    /// Flush, then truncate: committed work no longer needs replay.
    pub fn commit(&self) -> Result<()> {
        self.flush()?;
        let mut state = self.state.lock();
        Self::check(&state)?;
        if state.flushing {
            // A racing flusher holds bytes we are about to discard; let
            // it finish first.
            while state.flushing {
                self.cond.wait(&mut state);
            }
            Self::check(&state)?;
        }
        let file = self.file.lock();
        let outcome = file.set_len(0).and_then(|_| file.sync_all());
        drop(file);
        match outcome {
            Ok(()) => {
                state.seq = 0;
                state.flushed_seq = 0;
                state.buf.clear();
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                state.poisoned = Some(msg.clone());
                Err(VaultError::WalIo(msg))
            }
        }
    }

    fn write_out(&self, data: &[u8], durable: bool) -> std::io::Result<()> {
        let mut file = self.file.lock();
        if !data.is_empty() {
            file.write_all(data)?;
        }
        if durable {
            file.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn read_lines(path: &Path) -> Vec<String> {
        let content = std::fs::read_to_string(path).unwrap();
        content.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_log_and_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let wal = Wal::open(&path, 4096, 4).unwrap();

        wal.log("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        wal.log("INSERT INTO t VALUES (1)").unwrap();
        assert_eq!(wal.unflushed_entries(), 2);

        // Buffer-only until flush.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        wal.flush().unwrap();
        assert_eq!(wal.unflushed_entries(), 0);
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "INSERT INTO t VALUES (1)");
    }

    #[test]
    fn test_commit_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let wal = Wal::open(&path, 4096, 4).unwrap();
        wal.log("INSERT INTO t VALUES (1)").unwrap();
        wal.commit().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(wal.unflushed_entries(), 0);
    }

    #[test]
    fn test_embedded_newline_stays_one_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let wal = Wal::open(&path, 4096, 4).unwrap();
        wal.log("INSERT INTO t\nVALUES (1)").unwrap();
        wal.flush().unwrap();
        assert_eq!(read_lines(&path).len(), 1);
    }

    #[test]
    fn test_oversized_buffer_drains_without_barrier() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        // Tiny buffer so a single entry triggers the drain.
        let wal = Wal::open(&path, 512, 1).unwrap();
        let big = format!("INSERT INTO t VALUES ('{}')", "x".repeat(1024));
        wal.log(&big).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        wal.flush().unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn test_concurrent_group_commit_keeps_every_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let wal = Arc::new(Wal::open(&path, 64 * 1024, 4).unwrap());

        let threads = 8;
        let per_thread = 50;
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let wal = wal.clone();
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        wal.log(&format!("INSERT INTO t VALUES ({t}, {i})")).unwrap();
                        if i % 10 == 9 {
                            wal.flush().unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        wal.flush().unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), threads * per_thread);
        // Every thread's entries appear in its own submission order.
        for t in 0..threads {
            let mine: Vec<_> = lines
                .iter()
                .filter(|l| l.starts_with(&format!("INSERT INTO t VALUES ({t},")))
                .collect();
            for (i, line) in mine.iter().enumerate() {
                assert_eq!(**line, format!("INSERT INTO t VALUES ({t}, {i})"));
            }
        }
    }
}
