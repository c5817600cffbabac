//! Query engine core: statement dispatch, transactional DML, DDL, WAL
//! integration and vacuum.
//!
//! Write control flow: parse -> validate against the catalog -> stage
//! into the session transaction -> on commit: WAL append + durable
//! flush, engine mutation, index maintenance, MVCC install, then WAL
//! truncate once every engine has materialized. Statements executed
//! outside BEGIN/COMMIT run the same path in an implicit transaction.

pub mod compile;
pub mod plan;
pub mod prepare;
pub mod render;
pub mod result_cache;
mod aggregate;
mod select;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::DatabaseConfig;
use crate::crypto::{BufferedEncryptor, Cipher, MasterKey};
use crate::error::{Result, VaultError};
use crate::index::key_encoding::encode_primary_key;
use crate::index::{IndexAdvisor, IndexKind, SecondaryIndex};
use crate::mvcc::{MvccManager, Transaction};
use crate::row::{deserialize_row, serialize_row};
use crate::schema::{Catalog, ColumnDef, IndexDef, TableDef};
use crate::sql::ast::*;
use crate::sql::eval::{self, EvalContext, Params, RowSchema};
use crate::sql::parse_sql;
use crate::storage::append_engine::AppendOnlyEngine;
use crate::storage::hybrid::HybridEngine;
use crate::storage::page_engine::PageEngine;
use crate::storage::{EngineKind, EngineMetrics, RowRef, StorageEngine};
use crate::types::{now_ticks, DataType, Ulid, Value};
use crate::wal::{read_wal, truncate_wal_durably, Wal};

use prepare::{PlanCache, PreparedStatement};
use result_cache::ResultCache;

/// MVCC keys are `(table_id, primary key bytes)` so one manager covers
/// the whole database with a single commit timeline.
pub(crate) type MvccKey = (u32, Vec<u8>);
pub(crate) type RowPayload = Arc<Vec<Value>>;
pub(crate) type Tx = Transaction<MvccKey, RowPayload>;

/// Marker prefix for synthetic row ids of tables without a PRIMARY KEY.
const SYNTHETIC_PK_TAG: u8 = 0xF0;

/// One result row. Column lookup is case-insensitive.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Row { columns, values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[derive(Debug)]
pub enum ExecResult {
    Rows(Vec<Row>),
    Affected(usize),
    Message(String),
    None,
}

impl ExecResult {
    pub fn rows(self) -> Vec<Row> {
        match self {
            ExecResult::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn affected(&self) -> usize {
        match self {
            ExecResult::Affected(n) => *n,
            _ => 0,
        }
    }
}

pub(crate) struct TableRuntime {
    pub table_id: u32,
    pub engine: Box<dyn StorageEngine>,
    pub indexes: Vec<SecondaryIndex>,
    /// Committed primary key -> engine row reference.
    pub ref_of: HashMap<Vec<u8>, RowRef>,
    /// Bumped on every committed write; drives result-cache invalidation.
    pub write_epoch: u64,
    /// Synthetic row-id counter for tables without a PRIMARY KEY.
    pub next_rowid: u64,
}

pub(crate) enum PendingOp {
    Insert { table: String, pk: Vec<u8>, values: RowPayload },
    Update { table: String, pk: Vec<u8>, old: RowPayload, new: RowPayload },
    Delete { table: String, pk: Vec<u8>, old: RowPayload },
}

impl PendingOp {
    fn table(&self) -> &str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. } => table,
        }
    }
}

pub(crate) struct SessionTx {
    pub tx: Tx,
    pub ops: Vec<PendingOp>,
    /// WAL lines for this transaction, appended at commit so a rollback
    /// leaves no trace in the journal.
    pub wal_lines: Vec<String>,
}

/// A pinned read-only view of the database.
pub struct Snapshot {
    pub(crate) session: SessionTx,
}

pub struct DbCore {
    dir: PathBuf,
    config: DatabaseConfig,
    cipher: Arc<Cipher>,
    master_key: MasterKey,
    salt: [u8; 16],
    catalog: Catalog,
    wal: Wal,
    mvcc: MvccManager<MvccKey, RowPayload>,
    /// Lowercased table name -> runtime state.
    tables: HashMap<String, TableRuntime>,
    advisor: IndexAdvisor,
    plan_cache: PlanCache,
    result_cache: ResultCache,
    read_only: bool,
    session: Option<SessionTx>,
    in_recovery: bool,
}

impl DbCore {
    pub fn create(
        dir: &Path,
        master_key: MasterKey,
        salt: [u8; 16],
        config: DatabaseConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let header = dir.join("header");
        if header.exists() {
            return Err(VaultError::Catalog(format!(
                "database already exists at {}",
                dir.display()
            )));
        }
        let cipher = Arc::new(Cipher::new(&master_key, config.no_encrypt_mode));
        let catalog = Catalog::new();
        catalog.save(&header, &cipher, &salt)?;
        let wal = Wal::open(
            &dir.join("wal.log"),
            config.group_commit_size,
            config.wal_batch_multiplier,
        )?;
        Ok(DbCore {
            dir: dir.to_path_buf(),
            plan_cache: PlanCache::new(config.plan_cache_capacity),
            result_cache: ResultCache::new(config.result_cache_capacity),
            config,
            cipher,
            master_key,
            salt,
            catalog,
            wal,
            mvcc: MvccManager::new(),
            tables: HashMap::new(),
            advisor: IndexAdvisor::new(),
            read_only: false,
            session: None,
            in_recovery: false,
        })
    }

    pub fn open(dir: &Path, master_key: MasterKey, config: DatabaseConfig) -> Result<Self> {
        let header = dir.join("header");
        let cipher = Arc::new(Cipher::new(&master_key, config.no_encrypt_mode));
        let catalog = Catalog::load(&header, &cipher)?;
        let salt = Catalog::read_salt(&header)?;
        let wal_path = dir.join("wal.log");
        let wal = Wal::open(&wal_path, config.group_commit_size, config.wal_batch_multiplier)?;

        let mut core = DbCore {
            dir: dir.to_path_buf(),
            plan_cache: PlanCache::new(config.plan_cache_capacity),
            result_cache: ResultCache::new(config.result_cache_capacity),
            config,
            cipher,
            master_key,
            salt,
            catalog,
            wal,
            mvcc: MvccManager::new(),
            tables: HashMap::new(),
            advisor: IndexAdvisor::new(),
            read_only: false,
            session: None,
            in_recovery: false,
        };

        let table_names = core.catalog.table_names();
        for name in table_names {
            core.open_table_runtime(&name)?;
        }
        core.recover_wal(&wal_path)?;
        core.recover_bulk_imports()?;
        Ok(core)
    }

    /// Replay surviving WAL entries, then truncate durably. Entries that
    /// fail to apply (already-applied DDL after a crash between catalog
    /// save and truncate) are skipped with a warning — replay is
    /// idempotent at the statement level.
    fn recover_wal(&mut self, wal_path: &Path) -> Result<()> {
        let recovered = read_wal(wal_path)?;
        if recovered.entries.is_empty() {
            return Ok(());
        }
        debug!(entries = recovered.entries.len(), "replaying WAL");
        self.in_recovery = true;
        for entry in &recovered.entries {
            if let Err(error) = self.execute_sql(entry, &Params::none()) {
                warn!(%error, statement = entry.as_str(), "skipping WAL entry during replay");
            }
        }
        self.in_recovery = false;
        for runtime in self.tables.values_mut() {
            runtime.engine.materialize()?;
        }
        self.save_catalog()?;
        truncate_wal_durably(wal_path)?;
        Ok(())
    }

    fn save_catalog(&self) -> Result<()> {
        self.catalog
            .save(&self.dir.join("header"), &self.cipher, &self.salt)
    }

    fn data_path(&self, def: &TableDef) -> PathBuf {
        self.dir.join(def.data_file_name())
    }

    fn build_engine(&self, def: &TableDef, create: bool) -> Result<Box<dyn StorageEngine>> {
        let path = self.data_path(def);
        let cipher = self.cipher.clone();
        let cache = self.config.cache_pages;
        let batch = self.config.header_flush_batch;
        Ok(match def.engine {
            EngineKind::Columnar | EngineKind::AppendOnly => {
                if create {
                    Box::new(AppendOnlyEngine::create(path, cipher)?)
                } else {
                    Box::new(AppendOnlyEngine::open(path, cipher)?)
                }
            }
            EngineKind::PageBased => {
                if create {
                    Box::new(PageEngine::create(path, cipher, def.table_id, cache, batch)?)
                } else {
                    Box::new(PageEngine::open(path, cipher, def.table_id, cache, batch)?)
                }
            }
            EngineKind::Hybrid => {
                if create {
                    Box::new(HybridEngine::create(path, cipher, def.table_id, cache, batch)?)
                } else {
                    Box::new(HybridEngine::open(path, cipher, def.table_id, cache, batch)?)
                }
            }
        })
    }

    /// Open a table's engine and rebuild its in-memory state: MVCC base
    /// versions, the pk -> ref map, and secondary indexes.
    fn open_table_runtime(&mut self, name: &str) -> Result<()> {
        let def = self.catalog.get(name)?.clone();
        let mut engine = self.build_engine(&def, false)?;
        let pk_position = def
            .columns
            .iter()
            .position(|c| c.is_primary_key);

        let mut runtime = TableRuntime {
            table_id: def.table_id,
            engine: Box::new(NullEngine), // replaced below
            indexes: def
                .indexes
                .iter()
                .map(|i| SecondaryIndex::new(i.name.clone(), i.column.clone(), i.kind, i.unique))
                .collect(),
            ref_of: HashMap::new(),
            write_epoch: 0,
            next_rowid: 0,
        };

        for (row_ref, bytes) in engine.scan()? {
            let values = deserialize_row(&bytes, def.columns.len())?;
            let pk = match pk_position {
                Some(position) => encode_primary_key(&values[position])?,
                None => {
                    let rowid = runtime.next_rowid;
                    runtime.next_rowid += 1;
                    synthetic_pk(rowid)
                }
            };
            for index in &mut runtime.indexes {
                if let Some(position) = def.column_position(&index.column) {
                    index.add(&values[position], row_ref)?;
                }
            }
            self.mvcc
                .load_committed((def.table_id, pk.clone()), Arc::new(values));
            runtime.ref_of.insert(pk, row_ref);
        }
        runtime.engine = engine;
        self.tables.insert(def.name.to_lowercase(), runtime);
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn in_transaction(&self) -> bool {
        self.session.is_some()
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(VaultError::ReadOnly(
                "a WAL failure put this database into read-only mode".to_string(),
            ));
        }
        Ok(())
    }

    // --- Entry points ---

    /// Execute one or more statements; returns the last result. Parse
    /// errors surface as `VaultError::Parse` carrying every recorded
    /// error.
    pub fn execute_sql(&mut self, sql: &str, params: &Params) -> Result<ExecResult> {
        let outcome = parse_sql(sql);
        if !outcome.is_clean() {
            let rendered: Vec<String> = outcome.errors.iter().map(|e| e.to_string()).collect();
            return Err(VaultError::Parse(rendered.join("; ")));
        }
        let mut last = ExecResult::None;
        for statement in &outcome.statements {
            last = self.execute_statement(statement, params, Some(sql))?;
        }
        Ok(last)
    }

    pub fn execute_prepared(
        &mut self,
        prepared: &PreparedStatement,
        params: &Params,
    ) -> Result<ExecResult> {
        self.execute_statement(&prepared.statement, params, Some(&prepared.sql))
    }

    pub fn prepare(&mut self, sql: &str) -> Result<Arc<PreparedStatement>> {
        self.plan_cache.get_or_prepare(sql)
    }

    /// Run a batch of statements under one transaction. An empty batch
    /// is a no-op. On failure, nothing is installed and the error names
    /// the offending statement index.
    pub fn execute_batch(&mut self, statements: &[&str]) -> Result<usize> {
        if statements.is_empty() {
            return Ok(0);
        }
        if self.session.is_some() {
            return Err(VaultError::Transaction(
                "cannot run a batch inside an open transaction".to_string(),
            ));
        }
        self.begin_session()?;
        let mut affected = 0usize;
        for (position, sql) in statements.iter().enumerate() {
            match self.execute_sql(sql, &Params::none()) {
                Ok(result) => affected += result.affected(),
                Err(error) => {
                    self.rollback_session();
                    return Err(VaultError::Execution(format!(
                        "batch statement {position} failed: {error}"
                    )));
                }
            }
        }
        self.commit_active_session()?;
        Ok(affected)
    }

    pub fn execute_statement(
        &mut self,
        statement: &Statement,
        params: &Params,
        sql_text: Option<&str>,
    ) -> Result<ExecResult> {
        match statement {
            Statement::Error => Err(VaultError::Parse("statement had parse errors".to_string())),
            Statement::Begin => {
                self.begin_session()?;
                Ok(ExecResult::None)
            }
            Statement::Commit => {
                self.commit_active_session()?;
                Ok(ExecResult::None)
            }
            Statement::Rollback => {
                self.rollback_session();
                Ok(ExecResult::None)
            }
            Statement::Select(select) => self.execute_select_statement(select, params, sql_text),
            Statement::Insert(insert) => self.execute_dml(|core, stx| core.stage_insert(insert, params, stx)),
            Statement::Update(update) => self.execute_dml(|core, stx| core.stage_update(update, params, stx)),
            Statement::Delete(delete) => self.execute_dml(|core, stx| core.stage_delete(delete, params, stx)),
            Statement::CreateTable(create) => self.execute_create_table(create),
            Statement::DropTable(drop) => self.execute_drop_table(drop),
            Statement::AlterTableRename(alter) => self.execute_rename(alter),
            Statement::CreateIndex(create) => self.execute_create_index(create),
            Statement::DropIndex(drop) => self.execute_drop_index(drop),
            Statement::Vacuum(table) => self.execute_vacuum(table.as_deref()),
            Statement::Pragma(pragma) => self.execute_pragma(pragma),
        }
    }

    /// Execute with cancellation checked at the safe points: before the
    /// statement touches the WAL, and again before an implicit commit.
    /// Once the flush begins, cancellation is ignored.
    pub fn execute_sql_cancellable(
        &mut self,
        sql: &str,
        params: &Params,
        cancel: &CancelToken,
    ) -> Result<ExecResult> {
        cancel.check()?;
        let outcome = parse_sql(sql);
        if !outcome.is_clean() {
            let rendered: Vec<String> = outcome.errors.iter().map(|e| e.to_string()).collect();
            return Err(VaultError::Parse(rendered.join("; ")));
        }
        let mut last = ExecResult::None;
        for statement in &outcome.statements {
            cancel.check()?;
            last = self.execute_statement(statement, params, Some(sql))?;
        }
        Ok(last)
    }

    // --- Session transactions ---

    pub fn begin_session(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(VaultError::Transaction("transaction already open".to_string()));
        }
        self.session = Some(SessionTx {
            tx: self.mvcc.begin_transaction(false),
            ops: Vec::new(),
            wal_lines: Vec::new(),
        });
        Ok(())
    }

    pub fn commit_active_session(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Err(VaultError::Transaction("no open transaction".to_string()));
        };
        self.commit_session(session)
    }

    pub fn rollback_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.mvcc.rollback(session.tx);
        }
    }

    /// Stage a DML statement in the open session, or run it in an
    /// implicit single-statement transaction.
    fn execute_dml<F>(&mut self, stage: F) -> Result<ExecResult>
    where
        F: FnOnce(&mut Self, &mut SessionTx) -> Result<usize>,
    {
        self.check_writable()?;
        if self.session.is_some() {
            let mut session = self.session.take().expect("checked above");
            let staged = stage(self, &mut session);
            self.session = Some(session);
            return Ok(ExecResult::Affected(staged?));
        }

        let mut session = SessionTx {
            tx: self.mvcc.begin_transaction(false),
            ops: Vec::new(),
            wal_lines: Vec::new(),
        };
        match stage(self, &mut session) {
            Ok(affected) => {
                self.commit_session(session)?;
                Ok(ExecResult::Affected(affected))
            }
            Err(error) => {
                self.mvcc.rollback(session.tx);
                Err(error)
            }
        }
    }

    /// Commit path: WAL first, then engines and indexes, then MVCC
    /// install, then WAL truncate once everything is materialized.
    fn commit_session(&mut self, session: SessionTx) -> Result<()> {
        let SessionTx { tx, ops, wal_lines } = session;
        if ops.is_empty() {
            self.mvcc.commit_transaction(tx)?;
            return Ok(());
        }

        if !self.in_recovery {
            for line in &wal_lines {
                self.log_wal(line)?;
            }
            self.flush_wal()?;
        }

        let mut touched: BTreeSet<String> = BTreeSet::new();
        for op in &ops {
            self.apply_op(op)?;
            touched.insert(op.table().to_string());
        }

        self.mvcc.commit_transaction(tx)?;

        for table in &touched {
            if let Some(runtime) = self.tables.get_mut(table) {
                runtime.engine.commit()?;
                runtime.write_epoch += 1;
            }
        }
        // AUTO counters advanced during staging live in the catalog.
        self.save_catalog()?;

        if !self.in_recovery {
            let pending = self
                .tables
                .values()
                .any(|t| t.engine.pending_materialization());
            if !pending {
                self.commit_wal()?;
            }
        }
        Ok(())
    }

    fn log_wal(&mut self, line: &str) -> Result<()> {
        match self.wal.log(line) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.read_only = true;
                Err(error)
            }
        }
    }

    fn flush_wal(&mut self) -> Result<()> {
        match self.wal.flush() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.read_only = true;
                Err(error)
            }
        }
    }

    fn commit_wal(&mut self) -> Result<()> {
        match self.wal.commit() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.read_only = true;
                Err(error)
            }
        }
    }

    /// Apply one staged op to its engine and indexes.
    fn apply_op(&mut self, op: &PendingOp) -> Result<()> {
        match op {
            PendingOp::Insert { table, pk, values } => {
                let def = self.catalog.get(table)?;
                let positions: Vec<Option<usize>> = index_positions(def, table, &self.tables);
                let runtime = self
                    .tables
                    .get_mut(&table.to_lowercase())
                    .ok_or_else(|| VaultError::Internal(format!("no runtime for {table}")))?;
                let bytes = serialize_row(values);
                let row_ref = runtime.engine.insert(&bytes)?;
                runtime.ref_of.insert(pk.clone(), row_ref);
                for (index, position) in runtime.indexes.iter_mut().zip(positions) {
                    if let Some(position) = position {
                        index.add(&values[position], row_ref)?;
                    }
                }
            }
            PendingOp::Update { table, pk, old, new } => {
                let def = self.catalog.get(table)?;
                let positions: Vec<Option<usize>> = index_positions(def, table, &self.tables);
                let runtime = self
                    .tables
                    .get_mut(&table.to_lowercase())
                    .ok_or_else(|| VaultError::Internal(format!("no runtime for {table}")))?;
                let old_ref = *runtime.ref_of.get(pk).ok_or_else(|| {
                    VaultError::Internal("update of a row with no reference".to_string())
                })?;
                let bytes = serialize_row(new);
                let new_ref = runtime.engine.update(old_ref, &bytes)?;
                runtime.ref_of.insert(pk.clone(), new_ref);
                for (index, position) in runtime.indexes.iter_mut().zip(positions) {
                    if let Some(position) = position {
                        index.remove(&old[position], old_ref)?;
                        index.add(&new[position], new_ref)?;
                    }
                }
            }
            PendingOp::Delete { table, pk, old } => {
                let def = self.catalog.get(table)?;
                let positions: Vec<Option<usize>> = index_positions(def, table, &self.tables);
                let runtime = self
                    .tables
                    .get_mut(&table.to_lowercase())
                    .ok_or_else(|| VaultError::Internal(format!("no runtime for {table}")))?;
                let row_ref = runtime.ref_of.remove(pk).ok_or_else(|| {
                    VaultError::Internal("delete of a row with no reference".to_string())
                })?;
                runtime.engine.delete(row_ref)?;
                for (index, position) in runtime.indexes.iter_mut().zip(positions) {
                    if let Some(position) = position {
                        index.remove(&old[position], row_ref)?;
                    }
                }
            }
        }
        Ok(())
    }

    // --- DML staging ---

    fn stage_insert(
        &mut self,
        insert: &Insert,
        params: &Params,
        session: &mut SessionTx,
    ) -> Result<usize> {
        let def = self.catalog.get(&insert.table_name)?.clone();
        let target_positions: Vec<usize> = match &insert.columns {
            None => (0..def.columns.len()).collect(),
            Some(names) => names
                .iter()
                .map(|name| {
                    def.column_position(name).ok_or_else(|| {
                        VaultError::Catalog(format!(
                            "unknown column {} in table {}",
                            name, def.name
                        ))
                    })
                })
                .collect::<Result<_>>()?,
        };

        let schema = RowSchema::new();
        let mut inserted_rows: Vec<Vec<Value>> = Vec::with_capacity(insert.rows.len());
        for exprs in &insert.rows {
            if exprs.len() != target_positions.len() {
                return Err(VaultError::Execution(format!(
                    "expected {} values, got {}",
                    target_positions.len(),
                    exprs.len()
                )));
            }
            let mut values = vec![Value::Null; def.columns.len()];
            for (expr, &position) in exprs.iter().zip(&target_positions) {
                let ctx = EvalContext::rowless(&schema, params);
                values[position] = eval::eval(expr, &ctx)?;
            }
            let values = self.finalize_insert_row(&def, values)?;
            self.stage_one_insert(&def, values.clone(), session)?;
            inserted_rows.push(values);
        }

        if !self.in_recovery {
            let column_names: Vec<String> =
                def.columns.iter().map(|c| c.name.clone()).collect();
            session
                .wal_lines
                .push(render::render_insert(&def.name, &column_names, &inserted_rows));
        }
        Ok(inserted_rows.len())
    }

    /// Fill AUTO columns, coerce to column types, enforce NOT NULL.
    fn finalize_insert_row(&mut self, def: &TableDef, mut values: Vec<Value>) -> Result<Vec<Value>> {
        for (position, column) in def.columns.iter().enumerate() {
            if values[position].is_null() && column.auto {
                values[position] = match column.data_type {
                    DataType::Integer => {
                        let catalog_def = self.catalog.get_mut(&def.name)?;
                        let id = catalog_def.next_auto_id;
                        catalog_def.next_auto_id += 1;
                        Value::Integer(id)
                    }
                    DataType::Ulid => Value::Ulid(Ulid::generate()),
                    DataType::Guid => Value::Guid(Uuid::new_v4()),
                    DataType::DateTime => Value::DateTime(now_ticks()),
                    other => {
                        return Err(VaultError::Catalog(format!(
                            "AUTO is not supported for {other} columns"
                        )));
                    }
                };
            }
            values[position] = std::mem::replace(&mut values[position], Value::Null)
                .coerce(column.data_type)?;
            if values[position].is_null() && column.not_null {
                return Err(VaultError::ConstraintViolation(format!(
                    "column {} is NOT NULL",
                    column.name
                )));
            }
            // Explicit values (WAL replay included) keep the counter
            // ahead so later generated ids never collide.
            if column.auto && column.data_type == DataType::Integer {
                if let Value::Integer(v) = values[position] {
                    let catalog_def = self.catalog.get_mut(&def.name)?;
                    if v >= catalog_def.next_auto_id {
                        catalog_def.next_auto_id = v + 1;
                    }
                }
            }
        }
        Ok(values)
    }

    fn stage_one_insert(
        &mut self,
        def: &TableDef,
        values: Vec<Value>,
        session: &mut SessionTx,
    ) -> Result<()> {
        self.check_unique(def, &values, None, session)?;

        let pk = match def.columns.iter().position(|c| c.is_primary_key) {
            Some(position) => encode_primary_key(&values[position]).map_err(|_| {
                VaultError::ConstraintViolation("PRIMARY KEY cannot be NULL".to_string())
            })?,
            None => {
                let runtime = self
                    .tables
                    .get_mut(&def.name.to_lowercase())
                    .ok_or_else(|| VaultError::Internal(format!("no runtime for {}", def.name)))?;
                let rowid = runtime.next_rowid;
                runtime.next_rowid += 1;
                synthetic_pk(rowid)
            }
        };

        let payload: RowPayload = Arc::new(values);
        self.mvcc
            .insert((def.table_id, pk.clone()), payload.clone(), &mut session.tx)
            .map_err(|e| match e {
                VaultError::ConstraintViolation(_) => VaultError::ConstraintViolation(format!(
                    "duplicate primary key in table {}",
                    def.name
                )),
                other => other,
            })?;
        session.ops.push(PendingOp::Insert {
            table: def.name.to_lowercase(),
            pk,
            values: payload,
        });
        Ok(())
    }

    /// UNIQUE enforcement — column-level UNIQUE and unique secondary
    /// indexes — across committed rows (via index when present,
    /// otherwise a scan) and this session's staged rows.
    fn check_unique(
        &mut self,
        def: &TableDef,
        values: &[Value],
        exclude_pk: Option<&[u8]>,
        session: &SessionTx,
    ) -> Result<()> {
        let mut unique_positions: Vec<usize> = def
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_unique)
            .map(|(position, _)| position)
            .collect();
        if let Some(runtime) = self.tables.get(&def.name.to_lowercase()) {
            for index in &runtime.indexes {
                if index.unique {
                    if let Some(position) = def.column_position(&index.column) {
                        if !unique_positions.contains(&position) {
                            unique_positions.push(position);
                        }
                    }
                }
            }
        }

        for position in unique_positions {
            let column = &def.columns[position];
            if values[position].is_null() {
                continue;
            }
            let value = &values[position];

            let committed_hit = {
                let runtime = self
                    .tables
                    .get(&def.name.to_lowercase())
                    .ok_or_else(|| VaultError::Internal(format!("no runtime for {}", def.name)))?;
                match runtime.indexes.iter().find(|i| i.column.eq_ignore_ascii_case(&column.name)) {
                    Some(index) => {
                        // The index may hold f64-image collisions; confirm
                        // against the actual rows.
                        let refs = index.find(value)?;
                        let mut hit = false;
                        for row_ref in refs {
                            if let Some((pk, _)) =
                                runtime.ref_of.iter().find(|(_, r)| **r == row_ref)
                            {
                                if exclude_pk == Some(pk.as_slice()) {
                                    continue;
                                }
                                if let Some(row) =
                                    self.mvcc.get(&(def.table_id, pk.clone()), &session.tx)
                                {
                                    if row[position].compare(value)
                                        == Some(std::cmp::Ordering::Equal)
                                    {
                                        hit = true;
                                        break;
                                    }
                                }
                            }
                        }
                        hit
                    }
                    None => {
                        let table_id = def.table_id;
                        self.mvcc
                            .scan_where(&session.tx, |k| k.0 == table_id)
                            .iter()
                            .any(|((_, pk), row)| {
                                exclude_pk != Some(pk.as_slice())
                                    && row[position].compare(value)
                                        == Some(std::cmp::Ordering::Equal)
                            })
                    }
                }
            };
            // Rows staged in this transaction count too; the index only
            // reflects committed state.
            let staged_hit = session.ops.iter().any(|op| match op {
                PendingOp::Insert { table, pk, values: staged }
                | PendingOp::Update { table, pk, new: staged, .. } => {
                    table == &def.name.to_lowercase()
                        && exclude_pk != Some(pk.as_slice())
                        && staged[position].compare(value) == Some(std::cmp::Ordering::Equal)
                }
                PendingOp::Delete { .. } => false,
            });

            if committed_hit || staged_hit {
                return Err(VaultError::ConstraintViolation(format!(
                    "unique constraint violated on {}.{}",
                    def.name, column.name
                )));
            }
        }
        Ok(())
    }

    fn stage_update(
        &mut self,
        update: &Update,
        params: &Params,
        session: &mut SessionTx,
    ) -> Result<usize> {
        let def = self.catalog.get(&update.table_name)?.clone();
        let assignments: Vec<(usize, &Expr)> = update
            .assignments
            .iter()
            .map(|(name, expr)| {
                def.column_position(name)
                    .map(|position| (position, expr))
                    .ok_or_else(|| {
                        VaultError::Catalog(format!(
                            "unknown column {} in table {}",
                            name, def.name
                        ))
                    })
            })
            .collect::<Result<_>>()?;

        let schema = table_schema(&def, &def.name);
        let where_clause = self.materialize_subqueries(update.where_clause.clone(), params)?;
        let matches = self.matching_rows(&def, &schema, where_clause.as_ref(), params, session)?;

        let pk_position = def.columns.iter().position(|c| c.is_primary_key);
        let mut affected = 0usize;
        for (pk, old_values) in matches {
            let mut new_values = (*old_values).clone();
            for (position, expr) in &assignments {
                let ctx = EvalContext {
                    schema: &schema,
                    row: &old_values,
                    params,
                    aggregates: None,
                };
                let value = eval::eval(expr, &ctx)?;
                new_values[*position] = value.coerce(def.columns[*position].data_type)?;
                if new_values[*position].is_null() && def.columns[*position].not_null {
                    return Err(VaultError::ConstraintViolation(format!(
                        "column {} is NOT NULL",
                        def.columns[*position].name
                    )));
                }
            }
            self.check_unique(&def, &new_values, Some(&pk), session)?;

            let new_pk = match pk_position {
                Some(position) => encode_primary_key(&new_values[position]).map_err(|_| {
                    VaultError::ConstraintViolation("PRIMARY KEY cannot be NULL".to_string())
                })?,
                None => pk.clone(),
            };
            let payload: RowPayload = Arc::new(new_values);
            if new_pk == pk {
                self.mvcc
                    .update((def.table_id, pk.clone()), payload.clone(), &mut session.tx)?;
                session.ops.push(PendingOp::Update {
                    table: def.name.to_lowercase(),
                    pk,
                    old: old_values,
                    new: payload,
                });
            } else {
                // Primary key changed: delete + insert.
                self.mvcc.delete((def.table_id, pk.clone()), &mut session.tx)?;
                self.mvcc
                    .insert((def.table_id, new_pk.clone()), payload.clone(), &mut session.tx)?;
                session.ops.push(PendingOp::Delete {
                    table: def.name.to_lowercase(),
                    pk,
                    old: old_values,
                });
                session.ops.push(PendingOp::Insert {
                    table: def.name.to_lowercase(),
                    pk: new_pk,
                    values: payload,
                });
            }
            affected += 1;
        }

        if !self.in_recovery && affected > 0 {
            session.wal_lines.push(render::render_update(update, params)?);
        }
        Ok(affected)
    }

    fn stage_delete(
        &mut self,
        delete: &Delete,
        params: &Params,
        session: &mut SessionTx,
    ) -> Result<usize> {
        let def = self.catalog.get(&delete.table_name)?.clone();
        let schema = table_schema(&def, &def.name);
        let where_clause = self.materialize_subqueries(delete.where_clause.clone(), params)?;
        let matches = self.matching_rows(&def, &schema, where_clause.as_ref(), params, session)?;

        let mut affected = 0usize;
        for (pk, old_values) in matches {
            self.mvcc.delete((def.table_id, pk.clone()), &mut session.tx)?;
            session.ops.push(PendingOp::Delete {
                table: def.name.to_lowercase(),
                pk,
                old: old_values,
            });
            affected += 1;
        }

        if !self.in_recovery && affected > 0 {
            session.wal_lines.push(render::render_delete(delete, params)?);
        }
        Ok(affected)
    }

    /// Rows of `def` visible to the session that satisfy the predicate.
    fn matching_rows(
        &mut self,
        def: &TableDef,
        schema: &RowSchema,
        where_clause: Option<&Expr>,
        params: &Params,
        session: &SessionTx,
    ) -> Result<Vec<(Vec<u8>, RowPayload)>> {
        let table_id = def.table_id;
        let rows = self.mvcc.scan_where(&session.tx, |k| k.0 == table_id);
        let predicate = match where_clause {
            Some(expr) => Some(compile::compile_predicate(expr, schema)?),
            None => None,
        };
        let mut out = Vec::new();
        for ((_, pk), values) in rows {
            let keep = match &predicate {
                Some(predicate) => predicate(&values, params)?,
                None => true,
            };
            if keep {
                out.push((pk, values));
            }
        }
        Ok(out)
    }

    // --- DDL ---

    /// DDL runs in its own WAL cycle, outside any open session
    /// transaction, and saves the catalog atomically.
    fn execute_ddl(&mut self, wal_line: String, apply: impl FnOnce(&mut Self) -> Result<ExecResult>) -> Result<ExecResult> {
        self.check_writable()?;
        if !self.in_recovery {
            self.log_wal(&wal_line)?;
            self.flush_wal()?;
        }
        let result = apply(self)?;
        self.save_catalog()?;
        self.plan_cache.invalidate();
        self.result_cache.clear();
        if !self.in_recovery && self.session.is_none() {
            let pending = self
                .tables
                .values()
                .any(|t| t.engine.pending_materialization());
            if !pending {
                self.commit_wal()?;
            }
        }
        Ok(result)
    }

    fn execute_create_table(&mut self, create: &CreateTable) -> Result<ExecResult> {
        if self.catalog.contains(&create.table_name) {
            if create.if_not_exists {
                return Ok(ExecResult::None);
            }
            return Err(VaultError::Catalog(format!(
                "table already exists: {}",
                create.table_name
            )));
        }
        let line = render::render_create_table(create);
        let create = create.clone();
        self.execute_ddl(line, move |core| {
            let columns: Vec<ColumnDef> =
                create.columns.iter().map(ColumnDef::from_spec).collect();
            let engine_kind = create.storage.unwrap_or(EngineKind::Columnar);
            let buffered = core.config.use_optimized_insert_path;
            let def = core
                .catalog
                .create_table(&create.table_name, columns, engine_kind, buffered)?
                .clone();
            let engine = core.build_engine(&def, true)?;
            core.tables.insert(
                def.name.to_lowercase(),
                TableRuntime {
                    table_id: def.table_id,
                    engine,
                    indexes: Vec::new(),
                    ref_of: HashMap::new(),
                    write_epoch: 0,
                    next_rowid: 0,
                },
            );
            Ok(ExecResult::None)
        })
    }

    fn execute_drop_table(&mut self, drop: &DropTable) -> Result<ExecResult> {
        if !self.catalog.contains(&drop.table_name) {
            if drop.if_exists {
                return Ok(ExecResult::None);
            }
            return Err(VaultError::Catalog(format!("no such table: {}", drop.table_name)));
        }
        let line = format!("DROP TABLE {}", drop.table_name);
        let name = drop.table_name.clone();
        self.execute_ddl(line, move |core| {
            let def = core.catalog.drop_table(&name)?;
            let key = def.name.to_lowercase();
            core.tables.remove(&key);
            // Committed versions of the dropped table become garbage;
            // vacuum reclaims them once no snapshot pins them.
            let path = core.data_path(&def);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            Ok(ExecResult::None)
        })
    }

    fn execute_rename(&mut self, alter: &AlterTableRename) -> Result<ExecResult> {
        let line = format!("ALTER TABLE {} RENAME TO {}", alter.table_name, alter.new_name);
        let old = alter.table_name.clone();
        let new = alter.new_name.clone();
        self.execute_ddl(line, move |core| {
            let old_def = core.catalog.get(&old)?.clone();
            let old_path = core.data_path(&old_def);
            core.catalog.rename_table(&old, &new)?;
            let new_def = core.catalog.get(&new)?.clone();
            let new_path = core.data_path(&new_def);
            std::fs::rename(&old_path, &new_path)?;
            if let Some(runtime) = core.tables.remove(&old.to_lowercase()) {
                core.tables.insert(new.to_lowercase(), runtime);
            }
            // Reopen the engine against the renamed file.
            let engine =
                core_build_engine_reopen(&core.cipher, &core.config, &new_def, new_path)?;
            let runtime = core
                .tables
                .get_mut(&new.to_lowercase())
                .ok_or_else(|| VaultError::Internal(format!("no runtime for {new}")))?;
            runtime.engine = engine;
            Ok(ExecResult::None)
        })
    }

    fn execute_create_index(&mut self, create: &CreateIndex) -> Result<ExecResult> {
        if self.catalog.find_index(&create.index_name).is_some() {
            if create.if_not_exists {
                return Ok(ExecResult::None);
            }
            return Err(VaultError::Catalog(format!(
                "index already exists: {}",
                create.index_name
            )));
        }
        let line = render::render_create_index(create);
        let create = create.clone();
        self.execute_ddl(line, move |core| {
            core.create_index_now(
                &create.table_name,
                &create.index_name,
                &create.column_name,
                // Unique indexes need exact equality; a B-tree also
                // serves ranges, so plain CREATE INDEX picks B-tree and
                // the advisor upgrades near-unique columns to hash.
                if create.is_unique { IndexKind::Hash } else { IndexKind::BTree },
                create.is_unique,
            )?;
            Ok(ExecResult::None)
        })
    }

    /// Build and backfill an index over the committed rows.
    pub(crate) fn create_index_now(
        &mut self,
        table: &str,
        index_name: &str,
        column: &str,
        kind: IndexKind,
        unique: bool,
    ) -> Result<()> {
        let def = self.catalog.get(table)?.clone();
        let position = def.column_position(column).ok_or_else(|| {
            VaultError::Catalog(format!("no such column: {table}.{column}"))
        })?;

        let mut index =
            SecondaryIndex::new(index_name.to_string(), column.to_string(), kind, unique);
        let tx = self.mvcc.begin_transaction(true);
        let rows = self.mvcc.scan_where(&tx, |k| k.0 == def.table_id);
        drop(tx);

        let runtime = self
            .tables
            .get_mut(&def.name.to_lowercase())
            .ok_or_else(|| VaultError::Internal(format!("no runtime for {table}")))?;
        let mut seen = std::collections::HashSet::new();
        for ((_, pk), values) in &rows {
            let value = &values[position];
            if unique && !value.is_null() {
                let key = encode_primary_key(value)?;
                if !seen.insert(key) {
                    return Err(VaultError::ConstraintViolation(format!(
                        "cannot create unique index {index_name}: duplicate values in {table}.{column}"
                    )));
                }
            }
            if let Some(row_ref) = runtime.ref_of.get(pk) {
                index.add(value, *row_ref)?;
            }
        }
        runtime.indexes.push(index);
        self.catalog.add_index(
            table,
            IndexDef { name: index_name.to_string(), column: column.to_string(), kind, unique },
        )?;
        Ok(())
    }

    fn execute_drop_index(&mut self, drop: &DropIndex) -> Result<ExecResult> {
        if self.catalog.find_index(&drop.index_name).is_none() {
            if drop.if_exists {
                return Ok(ExecResult::None);
            }
            return Err(VaultError::Catalog(format!("no such index: {}", drop.index_name)));
        }
        let line = format!("DROP INDEX {}", drop.index_name);
        let name = drop.index_name.clone();
        self.execute_ddl(line, move |core| {
            let table = core.catalog.drop_index(&name)?;
            if let Some(runtime) = core.tables.get_mut(&table.to_lowercase()) {
                runtime
                    .indexes
                    .retain(|index| !index.name.eq_ignore_ascii_case(&name));
            }
            Ok(ExecResult::None)
        })
    }

    // --- VACUUM ---

    fn execute_vacuum(&mut self, table: Option<&str>) -> Result<ExecResult> {
        self.check_writable()?;
        if self.session.is_some() {
            return Err(VaultError::Transaction(
                "VACUUM cannot run inside a transaction".to_string(),
            ));
        }
        let versions = self.mvcc.vacuum();

        let names: Vec<String> = match table {
            Some(name) => vec![self.catalog.get(name)?.name.to_lowercase()],
            None => self.tables.keys().cloned().collect(),
        };
        let mut reclaimed = 0u64;
        for name in names {
            let def = self.catalog.get(&name)?.clone();
            let runtime = self
                .tables
                .get_mut(&name)
                .ok_or_else(|| VaultError::Internal(format!("no runtime for {name}")))?;
            let (report, remap) = runtime.engine.vacuum()?;
            reclaimed += report.reclaimed_bytes;
            if !remap.is_empty() {
                let remap: HashMap<RowRef, RowRef> = remap.into_iter().collect();
                for row_ref in runtime.ref_of.values_mut() {
                    if let Some(new_ref) = remap.get(row_ref) {
                        *row_ref = *new_ref;
                    }
                }
                self.rebuild_indexes(&def)?;
            }
            if let Some(runtime) = self.tables.get_mut(&name) {
                runtime.write_epoch += 1;
            }
        }
        self.result_cache.clear();
        Ok(ExecResult::Message(format!(
            "vacuum reclaimed {versions} versions, {reclaimed} bytes"
        )))
    }

    fn rebuild_indexes(&mut self, def: &TableDef) -> Result<()> {
        let tx = self.mvcc.begin_transaction(true);
        let rows = self.mvcc.scan_where(&tx, |k| k.0 == def.table_id);
        drop(tx);
        let runtime = self
            .tables
            .get_mut(&def.name.to_lowercase())
            .ok_or_else(|| VaultError::Internal(format!("no runtime for {}", def.name)))?;
        for index in &mut runtime.indexes {
            let Some(position) = def.column_position(&index.column) else { continue };
            let entries: Vec<(&Value, RowRef)> = rows
                .iter()
                .filter_map(|((_, pk), values)| {
                    runtime.ref_of.get(pk).map(|r| (&values[position], *r))
                })
                .collect();
            index.rebuild(entries)?;
        }
        Ok(())
    }

    // --- PRAGMA and diagnostics ---

    fn execute_pragma(&mut self, pragma: &Pragma) -> Result<ExecResult> {
        match pragma.name.to_lowercase().as_str() {
            "index_list" => {
                let table = pragma
                    .arg
                    .as_deref()
                    .ok_or_else(|| VaultError::Execution("PRAGMA index_list needs a table".to_string()))?;
                Ok(ExecResult::Message(self.pragma_index_list(table)?))
            }
            "table_info" => {
                let table = pragma
                    .arg
                    .as_deref()
                    .ok_or_else(|| VaultError::Execution("PRAGMA table_info needs a table".to_string()))?;
                Ok(ExecResult::Message(self.pragma_table_info(table)?))
            }
            "stats" | "database_stats" => Ok(ExecResult::Message(self.pragma_stats())),
            "analyze" => {
                let table = pragma
                    .arg
                    .as_deref()
                    .ok_or_else(|| VaultError::Execution("PRAGMA analyze needs a table".to_string()))?
                    .to_string();
                let created = self.analyze_and_create_indexes(&table)?;
                Ok(ExecResult::Message(if created.is_empty() {
                    format!("no index recommended for {table}")
                } else {
                    created.join("\n")
                }))
            }
            other => Err(VaultError::Execution(format!("unknown PRAGMA: {other}"))),
        }
    }

    /// Newline-delimited index diagnostics for one table.
    pub fn pragma_index_list(&self, table: &str) -> Result<String> {
        let def = self.catalog.get(table)?;
        let runtime = self
            .tables
            .get(&def.name.to_lowercase())
            .ok_or_else(|| VaultError::Internal(format!("no runtime for {table}")))?;
        let mut out = String::new();
        for index in &runtime.indexes {
            let stats = index.stats();
            out.push_str(&format!(
                "{} {} column={} unique={} selectivity={:.3} keys={} entries={} memory={}B\n",
                index.name,
                index.kind().as_str(),
                index.column,
                index.unique,
                stats.selectivity,
                stats.unique_keys,
                stats.total_entries,
                stats.memory_bytes,
            ));
        }
        if out.is_empty() {
            out.push_str("(no indexes)\n");
        }
        Ok(out)
    }

    pub fn pragma_table_info(&self, table: &str) -> Result<String> {
        let def = self.catalog.get(table)?;
        let mut out = format!(
            "table={} engine={} columns={}\n",
            def.name,
            def.engine.as_str(),
            def.columns.len()
        );
        for (position, column) in def.columns.iter().enumerate() {
            out.push_str(&format!(
                "{} {} {}{}{}{}\n",
                position,
                column.name,
                column.data_type.name(),
                if column.is_primary_key { " PRIMARY KEY" } else { "" },
                if column.auto { " AUTO" } else { "" },
                if column.not_null && !column.is_primary_key { " NOT NULL" } else { "" },
            ));
        }
        Ok(out)
    }

    fn pragma_stats(&self) -> String {
        let mut out = String::new();
        let (plan_hits, plan_misses, plan_len) = self.plan_cache.stats();
        out.push_str(&format!(
            "plan_cache hits={plan_hits} misses={plan_misses} entries={plan_len}\n"
        ));
        let (result_hits, result_misses, result_len) = self.result_cache.stats();
        out.push_str(&format!(
            "result_cache hits={result_hits} misses={result_misses} entries={result_len}\n"
        ));
        out.push_str(&format!(
            "mvcc versions={} active_tx={} last_commit_ts={}\n",
            self.mvcc.version_count(),
            self.mvcc.active_transactions(),
            self.mvcc.last_commit_ts()
        ));
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();
        for name in names {
            let metrics = self.tables[name].engine.metrics();
            out.push_str(&format!(
                "table={} live={} inserted={} updated={} deleted={} dead={} bytes={}\n",
                name,
                metrics.live_rows,
                metrics.rows_inserted,
                metrics.rows_updated,
                metrics.rows_deleted,
                metrics.dead_records,
                metrics.file_bytes,
            ));
        }
        out
    }

    pub fn engine_metrics(&self, table: &str) -> Result<EngineMetrics> {
        let def = self.catalog.get(table)?;
        Ok(self
            .tables
            .get(&def.name.to_lowercase())
            .ok_or_else(|| VaultError::Internal(format!("no runtime for {table}")))?
            .engine
            .metrics())
    }

    /// Run the advisor over a table's data and create the recommended
    /// indexes. Returns a description per index created. Best-effort:
    /// advisor failures never propagate to the caller's statement.
    pub fn analyze_and_create_indexes(&mut self, table: &str) -> Result<Vec<String>> {
        let def = self.catalog.get(table)?.clone();
        let tx = self.mvcc.begin_transaction(true);
        let rows = self.mvcc.scan_where(&tx, |k| k.0 == def.table_id);
        drop(tx);

        let mut columns: Vec<(String, Vec<&Value>)> = Vec::new();
        for (position, column) in def.columns.iter().enumerate() {
            let already_indexed = def
                .indexes
                .iter()
                .any(|i| i.column.eq_ignore_ascii_case(&column.name))
                || column.is_primary_key;
            if already_indexed {
                continue;
            }
            let values: Vec<&Value> = rows.iter().map(|(_, row)| &row[position]).collect();
            columns.push((column.name.clone(), values));
        }

        let recommendations = self.advisor.analyze(&def.name, &columns);
        let mut created = Vec::new();
        for rec in recommendations {
            let index_name = format!("idx_auto_{}_{}", def.name.to_lowercase(), rec.column.to_lowercase());
            match self.create_index_now(&def.name, &index_name, &rec.column, rec.kind, false) {
                Ok(()) => {
                    created.push(format!(
                        "created {} {} on {}.{} (selectivity {:.3}, {} queries)",
                        rec.kind.as_str(),
                        index_name,
                        def.name,
                        rec.column,
                        rec.selectivity,
                        rec.query_frequency
                    ));
                }
                Err(error) => {
                    warn!(%error, column = rec.column.as_str(), "auto-index creation skipped");
                }
            }
        }
        if !created.is_empty() {
            self.save_catalog()?;
        }
        Ok(created)
    }

    /// Bulk-import serialized rows through the buffered encryptor. The
    /// whole batch is sealed as one AEAD blob and written to the table's
    /// `.bulk` staging file before anything reaches the engines — that
    /// fsync is the batch's durability boundary. The blob is removed once
    /// the rows are materialized; a crash in between replays it on
    /// recovery as a single all-or-nothing unit, and a torn or tampered
    /// blob discards the entire batch.
    pub fn bulk_insert(&mut self, table: &str, rows: Vec<Vec<Value>>) -> Result<usize> {
        self.check_writable()?;
        if rows.is_empty() {
            return Ok(0);
        }
        let def = self.catalog.get(table)?.clone();
        if !def.buffered_encryption {
            // Per-record path: the two modes are not interchangeable for
            // a table's lifetime.
            let insert = Insert {
                table_name: def.name.clone(),
                columns: None,
                rows: rows
                    .into_iter()
                    .map(|row| row.into_iter().map(Expr::Resolved).collect())
                    .collect(),
            };
            return Ok(self
                .execute_statement(&Statement::Insert(insert), &Params::none(), None)?
                .affected());
        }

        let mut encryptor = BufferedEncryptor::new(&self.master_key);
        let mut session = SessionTx {
            tx: self.mvcc.begin_transaction(false),
            ops: Vec::new(),
            wal_lines: Vec::new(),
        };
        let mut count = 0usize;
        for values in rows {
            if values.len() != def.columns.len() {
                self.mvcc.rollback(session.tx);
                return Err(VaultError::Execution(format!(
                    "expected {} values, got {}",
                    def.columns.len(),
                    values.len()
                )));
            }
            let values = self.finalize_insert_row(&def, values)?;
            encryptor.push(&serialize_row(&values));
            self.stage_one_insert(&def, values, &mut session)?;
            count += 1;
        }

        let Some(sealed) = encryptor.flush()? else {
            self.mvcc.rollback(session.tx);
            return Ok(0);
        };
        // Durability boundary: the sealed blob is the batch's journal
        // record, standing in for per-statement WAL lines.
        let staging = self.bulk_staging_path(&def);
        std::fs::write(&staging, &sealed)?;
        std::fs::File::open(&staging)?.sync_all()?;

        self.commit_session(session)?;
        if let Some(runtime) = self.tables.get_mut(&def.name.to_lowercase()) {
            runtime.engine.materialize()?;
        }
        std::fs::remove_file(&staging)?;
        Ok(count)
    }

    fn bulk_staging_path(&self, def: &TableDef) -> PathBuf {
        self.dir.join(format!("{}.bulk", def.name))
    }

    /// Replay bulk-import batches whose staging blob survived a crash.
    /// Each blob is decrypted as one unit: a failed authentication or a
    /// failed replay discards the entire batch.
    fn recover_bulk_imports(&mut self) -> Result<()> {
        let names = self.catalog.table_names();
        for name in names {
            let def = self.catalog.get(&name)?.clone();
            let staging = self.bulk_staging_path(&def);
            if !staging.exists() {
                continue;
            }
            debug!(table = def.name.as_str(), "replaying bulk import batch");
            let blob = std::fs::read(&staging)?;
            let encryptor = BufferedEncryptor::new(&self.master_key);

            self.in_recovery = true;
            let outcome = match encryptor.decrypt_batch(&blob) {
                Ok(records) => self.replay_bulk_batch(&def, records),
                Err(error) => Err(error),
            };
            self.in_recovery = false;

            match outcome {
                Ok(()) => {
                    if let Some(runtime) = self.tables.get_mut(&def.name.to_lowercase()) {
                        runtime.engine.materialize()?;
                    }
                }
                Err(error) => {
                    warn!(%error, table = def.name.as_str(), "discarding bulk import batch");
                }
            }
            std::fs::remove_file(&staging)?;
        }
        Ok(())
    }

    /// Apply one recovered batch in a single transaction. Rows whose
    /// keys already exist were materialized before the crash and are
    /// skipped; any other failure aborts the whole batch.
    fn replay_bulk_batch(&mut self, def: &TableDef, records: Vec<Vec<u8>>) -> Result<()> {
        let mut session = SessionTx {
            tx: self.mvcc.begin_transaction(false),
            ops: Vec::new(),
            wal_lines: Vec::new(),
        };
        for bytes in records {
            let values = deserialize_row(&bytes, def.columns.len())?;
            match self.stage_one_insert(def, values, &mut session) {
                Ok(()) => {}
                Err(VaultError::ConstraintViolation(_)) => {}
                Err(error) => return Err(error),
            }
        }
        self.commit_session(session)
    }

    /// Open a read-only snapshot. The snapshot pins its MVCC versions
    /// (vacuum will not reclaim them) until it is dropped, and sees the
    /// database as of this call regardless of later commits.
    pub fn begin_snapshot(&mut self) -> Snapshot {
        Snapshot {
            session: SessionTx {
                tx: self.mvcc.begin_transaction(true),
                ops: Vec::new(),
                wal_lines: Vec::new(),
            },
        }
    }

    /// Run a SELECT against a pinned snapshot.
    pub fn query_snapshot(
        &mut self,
        snapshot: &Snapshot,
        sql: &str,
        params: &Params,
    ) -> Result<Vec<Row>> {
        let statement = parse_sql(sql)
            .into_single()
            .map_err(|e| VaultError::Parse(e.to_string()))?;
        let Statement::Select(select) = statement else {
            return Err(VaultError::ReadOnly("snapshots only run SELECT".to_string()));
        };
        let (_, rows) = self.run_select_at(&select, params, &snapshot.session)?;
        Ok(rows)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.catalog.table_names()
    }

    /// Flush every engine and the catalog; used on close.
    pub fn close(mut self) -> Result<()> {
        for runtime in self.tables.values_mut() {
            runtime.engine.materialize()?;
        }
        if !self.read_only {
            self.save_catalog()?;
            if !self.wal.is_poisoned() {
                self.wal.commit()?;
            }
        }
        Ok(())
    }
}

/// Positions of each index's column in the table's row layout.
fn index_positions(
    def: &TableDef,
    table: &str,
    tables: &HashMap<String, TableRuntime>,
) -> Vec<Option<usize>> {
    tables
        .get(&table.to_lowercase())
        .map(|runtime| {
            runtime
                .indexes
                .iter()
                .map(|index| def.column_position(&index.column))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn synthetic_pk(rowid: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(SYNTHETIC_PK_TAG);
    key.extend_from_slice(&rowid.to_be_bytes());
    key
}

/// Row namespace of one table under a binding name.
pub(crate) fn table_schema(def: &TableDef, binding: &str) -> RowSchema {
    let mut schema = RowSchema::new();
    for column in &def.columns {
        schema.push(Some(binding), &column.name);
    }
    schema
}

/// Reopen an engine after a file rename.
fn core_build_engine_reopen(
    cipher: &Arc<Cipher>,
    config: &DatabaseConfig,
    def: &TableDef,
    path: PathBuf,
) -> Result<Box<dyn StorageEngine>> {
    Ok(match def.engine {
        EngineKind::Columnar | EngineKind::AppendOnly => {
            Box::new(AppendOnlyEngine::open(path, cipher.clone())?)
        }
        EngineKind::PageBased => Box::new(PageEngine::open(
            path,
            cipher.clone(),
            def.table_id,
            config.cache_pages,
            config.header_flush_batch,
        )?),
        EngineKind::Hybrid => Box::new(HybridEngine::open(
            path,
            cipher.clone(),
            def.table_id,
            config.cache_pages,
            config.header_flush_batch,
        )?),
    })
}

/// Placeholder engine used only while a runtime is being constructed.
struct NullEngine;

impl StorageEngine for NullEngine {
    fn insert(&mut self, _row: &[u8]) -> Result<RowRef> {
        Err(VaultError::Internal("engine not initialized".to_string()))
    }
    fn update(&mut self, _row_ref: RowRef, _row: &[u8]) -> Result<RowRef> {
        Err(VaultError::Internal("engine not initialized".to_string()))
    }
    fn delete(&mut self, _row_ref: RowRef) -> Result<()> {
        Err(VaultError::Internal("engine not initialized".to_string()))
    }
    fn read(&mut self, _row_ref: RowRef) -> Result<Option<Vec<u8>>> {
        Err(VaultError::Internal("engine not initialized".to_string()))
    }
    fn scan(&mut self) -> Result<Vec<(RowRef, Vec<u8>)>> {
        Err(VaultError::Internal("engine not initialized".to_string()))
    }
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
    fn vacuum(&mut self) -> Result<(crate::storage::VacuumReport, Vec<(RowRef, RowRef)>)> {
        Ok((crate::storage::VacuumReport::default(), Vec::new()))
    }
    fn metrics(&self) -> EngineMetrics {
        EngineMetrics::default()
    }
}
