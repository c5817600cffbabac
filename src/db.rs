//! Database handle: directory lifecycle, key derivation, process-level
//! locking, and the public statement API over the query core.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::fs_std::FileExt;
use parking_lot::RwLock;

use crate::cancel::CancelToken;
use crate::config::DatabaseConfig;
use crate::crypto::{kdf, MasterKey};
use crate::error::{Result, VaultError};
use crate::exec::prepare::PreparedStatement;
use crate::exec::{DbCore, ExecResult, Row, Snapshot};
use crate::sql::eval::Params;
use crate::storage::EngineMetrics;
use crate::types::Value;

/// Single-process embedded database over a directory:
/// `header` (catalog), one data file per table, and the shared `wal.log`.
pub struct Database {
    core: DbCore,
    lock_manager: LockManager,
    dir: PathBuf,
}

impl Database {
    /// Create a new database directory with an explicit master key.
    pub fn create(dir: &Path, master_key: &MasterKey, config: DatabaseConfig) -> Result<Self> {
        let salt = kdf::generate_salt();
        let core = DbCore::create(dir, master_key.clone(), salt, config)?;
        let lock_manager = LockManager::new(dir)?;
        Ok(Database { core, lock_manager, dir: dir.to_path_buf() })
    }

    /// Create a new database with a password (Argon2id-derived key).
    pub fn create_with_password(dir: &Path, password: &str, config: DatabaseConfig) -> Result<Self> {
        let salt = kdf::generate_salt();
        let master_key = kdf::derive_key(password.as_bytes(), &salt)?;
        let core = DbCore::create(dir, master_key, salt, config)?;
        let lock_manager = LockManager::new(dir)?;
        Ok(Database { core, lock_manager, dir: dir.to_path_buf() })
    }

    /// Open an existing database; WAL recovery runs before any statement.
    pub fn open(dir: &Path, master_key: &MasterKey, config: DatabaseConfig) -> Result<Self> {
        let core = DbCore::open(dir, master_key.clone(), config)?;
        let lock_manager = LockManager::new(dir)?;
        Ok(Database { core, lock_manager, dir: dir.to_path_buf() })
    }

    pub fn open_with_password(dir: &Path, password: &str, config: DatabaseConfig) -> Result<Self> {
        let salt = crate::schema::Catalog::read_salt(&dir.join("header"))?;
        let master_key = kdf::derive_key(password.as_bytes(), &salt)?;
        Self::open(dir, &master_key, config)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Execute a SQL string (one or more statements); returns the last
    /// statement's result.
    pub fn execute(&mut self, sql: &str) -> Result<ExecResult> {
        let _guard = self.lock_manager.write_lock()?;
        self.core.execute_sql(sql, &Params::none())
    }

    pub fn execute_with(&mut self, sql: &str, params: Params) -> Result<ExecResult> {
        let _guard = self.lock_manager.write_lock()?;
        self.core.execute_sql(sql, &params)
    }

    /// Execute with a cancellation token; cancellation is honored up to
    /// the durability point, after which the call reports completion.
    pub fn execute_cancellable(
        &mut self,
        sql: &str,
        params: Params,
        cancel: &CancelToken,
    ) -> Result<ExecResult> {
        let _guard = self.lock_manager.write_lock()?;
        self.core.execute_sql_cancellable(sql, &params, cancel)
    }

    /// Query rows (read lock only).
    pub fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        let _guard = self.lock_manager.read_lock()?;
        Ok(self.core.execute_sql(sql, &Params::none())?.rows())
    }

    pub fn query_with(&mut self, sql: &str, params: Params) -> Result<Vec<Row>> {
        let _guard = self.lock_manager.read_lock()?;
        Ok(self.core.execute_sql(sql, &params)?.rows())
    }

    /// Prepare a statement (or fetch it from the plan cache).
    pub fn prepare(&mut self, sql: &str) -> Result<Arc<PreparedStatement>> {
        self.core.prepare(sql)
    }

    pub fn execute_prepared(
        &mut self,
        prepared: &PreparedStatement,
        params: Params,
    ) -> Result<ExecResult> {
        let _guard = self.lock_manager.write_lock()?;
        self.core.execute_prepared(prepared, &params)
    }

    /// Run statements under one transaction; an empty batch is a no-op.
    pub fn execute_batch(&mut self, statements: &[&str]) -> Result<usize> {
        let _guard = self.lock_manager.write_lock()?;
        self.core.execute_batch(statements)
    }

    pub fn begin(&mut self) -> Result<()> {
        self.core.begin_session()
    }

    pub fn commit(&mut self) -> Result<()> {
        let _guard = self.lock_manager.write_lock()?;
        self.core.commit_active_session()
    }

    pub fn rollback(&mut self) {
        self.core.rollback_session();
    }

    pub fn in_transaction(&self) -> bool {
        self.core.in_transaction()
    }

    /// True once a WAL failure forced read-only mode; reopen to clear.
    pub fn is_read_only(&self) -> bool {
        self.core.is_read_only()
    }

    /// Pin a read-only snapshot: it keeps seeing the database as of now,
    /// across later commits, until dropped.
    pub fn begin_snapshot(&mut self) -> Snapshot {
        self.core.begin_snapshot()
    }

    pub fn query_snapshot(&mut self, snapshot: &Snapshot, sql: &str) -> Result<Vec<Row>> {
        let _guard = self.lock_manager.read_lock()?;
        self.core.query_snapshot(snapshot, sql, &Params::none())
    }

    /// Bulk insert through the table's configured encryption path.
    pub fn bulk_insert(&mut self, table: &str, rows: Vec<Vec<Value>>) -> Result<usize> {
        let _guard = self.lock_manager.write_lock()?;
        self.core.bulk_insert(table, rows)
    }

    /// Run the auto-index advisor over a table and create what it
    /// recommends; returns a description per index created.
    pub fn analyze_and_create_indexes(&mut self, table: &str) -> Result<Vec<String>> {
        let _guard = self.lock_manager.write_lock()?;
        self.core.analyze_and_create_indexes(table)
    }

    pub fn pragma_index_list(&self, table: &str) -> Result<String> {
        self.core.pragma_index_list(table)
    }

    pub fn pragma_table_info(&self, table: &str) -> Result<String> {
        self.core.pragma_table_info(table)
    }

    pub fn engine_metrics(&self, table: &str) -> Result<EngineMetrics> {
        self.core.engine_metrics(table)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.core.table_names()
    }

    /// Flush everything and release the directory lock.
    pub fn close(self) -> Result<()> {
        self.core.close()
    }
}

/// Concurrency control: thread RwLock + process file lock.
/// Multiple readers, single writer.
struct LockManager {
    rw_lock: RwLock<()>,
    lock_file: File,
}

impl LockManager {
    fn new(dir: &Path) -> Result<Self> {
        let lock_path = dir.join(".lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        Ok(LockManager { rw_lock: RwLock::new(()), lock_file })
    }

    fn read_lock(&self) -> Result<ReadGuard<'_>> {
        let thread_guard = self.rw_lock.read();
        self.lock_file
            .lock_shared()
            .map_err(|e| VaultError::Lock(format!("failed to acquire shared file lock: {e}")))?;
        Ok(ReadGuard { _thread_guard: thread_guard, lock_file: &self.lock_file })
    }

    fn write_lock(&self) -> Result<WriteGuard<'_>> {
        let thread_guard = self.rw_lock.write();
        self.lock_file
            .lock_exclusive()
            .map_err(|e| VaultError::Lock(format!("failed to acquire exclusive file lock: {e}")))?;
        Ok(WriteGuard { _thread_guard: thread_guard, lock_file: &self.lock_file })
    }
}

struct ReadGuard<'a> {
    _thread_guard: parking_lot::RwLockReadGuard<'a, ()>,
    lock_file: &'a File,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.lock_file);
    }
}

struct WriteGuard<'a> {
    _thread_guard: parking_lot::RwLockWriteGuard<'a, ()>,
    lock_file: &'a File,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.lock_file);
    }
}
