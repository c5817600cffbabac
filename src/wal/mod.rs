pub mod recovery;
pub mod writer;

pub use recovery::{read_wal, truncate_wal_durably, RecoveredWal};
pub use writer::Wal;
