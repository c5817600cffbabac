//! VaultDB: an embedded, single-process SQL database engine with at-rest
//! authenticated encryption.
//!
//! - AES-256-GCM-SIV encryption of every page and record, Argon2id keys
//! - Three storage engines per table: append-only, page-based, hybrid
//!   (WAL-fronted pages), selected at CREATE TABLE time
//! - Write-ahead log of logical statements with group commit and crash
//!   recovery
//! - MVCC snapshot isolation with version vacuuming
//! - Hash and B-tree secondary indexes plus an auto-index advisor
//! - SQL parser with error recovery; prepared statements, plan and
//!   result caches; columnar aggregate kernels for scan-heavy analytics

pub mod cancel;
pub mod columnar;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod exec;
pub mod index;
pub mod mvcc;
pub mod row;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod types;
pub mod wal;

pub use cancel::CancelToken;
pub use config::DatabaseConfig;
pub use crypto::MasterKey;
pub use db::Database;
pub use error::{Result, VaultError};
pub use exec::prepare::PreparedStatement;
pub use exec::{ExecResult, Row, Snapshot};
pub use sql::eval::Params;
pub use storage::EngineKind;
pub use types::{DataType, Ulid, Value};
