pub mod append_engine;
pub mod append_log;
pub mod engine;
pub mod hybrid;
pub mod page;
pub mod page_engine;
pub mod pager;

pub use engine::{EngineKind, EngineMetrics, RowRef, StorageEngine, VacuumReport};
