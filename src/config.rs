//! Database configuration.
//!
//! Every knob has a code default and an optional `VAULTDB_*` environment
//! override. Malformed environment values fall back to the default with a
//! warning rather than failing open.

use tracing::warn;

const DEFAULT_CACHE_PAGES: usize = 256;
const DEFAULT_WAL_BUFFER_BYTES: usize = 1024 * 1024;
const DEFAULT_GROUP_COMMIT_SIZE: usize = 64 * 1024;
const DEFAULT_WAL_BATCH_MULTIPLIER: usize = 4;
const DEFAULT_PLAN_CACHE_CAPACITY: usize = 256;
const DEFAULT_RESULT_CACHE_CAPACITY: usize = 128;
const DEFAULT_HEADER_FLUSH_BATCH: usize = 1;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Page cache capacity, in pages, per table file.
    pub cache_pages: usize,
    /// In-memory WAL buffer size before appends start blocking.
    pub wal_buffer_bytes: usize,
    /// Target size of one group-commit flush batch.
    pub group_commit_size: usize,
    /// Maximum buffered batches; bounds the WAL buffer at
    /// `group_commit_size * wal_batch_multiplier`.
    pub wal_batch_multiplier: usize,
    /// Route bulk INSERTs through the buffered encryptor.
    pub use_optimized_insert_path: bool,
    /// Disable encryption. The on-disk layout is unchanged (nonce/tag
    /// fields zero-filled); opening with a mismatched flag is refused.
    pub no_encrypt_mode: bool,
    /// Enable the SELECT result cache.
    pub query_cache_enabled: bool,
    /// Result cache capacity, in entries.
    pub result_cache_capacity: usize,
    /// Compiled plan cache capacity, in entries.
    pub plan_cache_capacity: usize,
    /// Defer free-list header-page writes until this many pages changed.
    /// 1 = write-through.
    pub header_flush_batch: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            cache_pages: env_usize("VAULTDB_CACHE_PAGES", DEFAULT_CACHE_PAGES, 1),
            wal_buffer_bytes: env_usize("VAULTDB_WAL_BUFFER_BYTES", DEFAULT_WAL_BUFFER_BYTES, 4096),
            group_commit_size: env_usize("VAULTDB_GROUP_COMMIT_SIZE", DEFAULT_GROUP_COMMIT_SIZE, 512),
            wal_batch_multiplier: env_usize("VAULTDB_WAL_BATCH_MULTIPLIER", DEFAULT_WAL_BATCH_MULTIPLIER, 1),
            use_optimized_insert_path: false,
            no_encrypt_mode: false,
            query_cache_enabled: true,
            result_cache_capacity: DEFAULT_RESULT_CACHE_CAPACITY,
            plan_cache_capacity: DEFAULT_PLAN_CACHE_CAPACITY,
            header_flush_batch: DEFAULT_HEADER_FLUSH_BATCH,
        }
    }
}

impl DatabaseConfig {
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages.max(1);
        self
    }

    pub fn wal_buffer_bytes(mut self, bytes: usize) -> Self {
        self.wal_buffer_bytes = bytes.max(4096);
        self
    }

    pub fn group_commit_size(mut self, bytes: usize) -> Self {
        self.group_commit_size = bytes.max(512);
        self
    }

    pub fn wal_batch_multiplier(mut self, n: usize) -> Self {
        self.wal_batch_multiplier = n.max(1);
        self
    }

    pub fn optimized_insert_path(mut self, enabled: bool) -> Self {
        self.use_optimized_insert_path = enabled;
        self
    }

    pub fn no_encrypt(mut self, enabled: bool) -> Self {
        self.no_encrypt_mode = enabled;
        self
    }

    pub fn query_cache(mut self, enabled: bool) -> Self {
        self.query_cache_enabled = enabled;
        self
    }

    pub fn plan_cache_capacity(mut self, entries: usize) -> Self {
        self.plan_cache_capacity = entries.max(1);
        self
    }

    pub fn header_flush_batch(mut self, pages: usize) -> Self {
        self.header_flush_batch = pages.max(1);
        self
    }
}

fn env_usize(name: &str, default: usize, min: usize) -> usize {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    match raw.parse::<usize>() {
        Ok(v) if v >= min => v,
        Ok(_) => {
            warn!(var = name, min, default, "environment override below minimum, using default");
            default
        }
        Err(_) => {
            warn!(var = name, default, "environment override is not an integer, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = DatabaseConfig::default();
        assert!(cfg.cache_pages >= 1);
        assert!(cfg.wal_buffer_bytes >= 4096);
        assert!(!cfg.no_encrypt_mode);
        assert!(cfg.query_cache_enabled);
    }

    #[test]
    fn test_builder_clamps() {
        let cfg = DatabaseConfig::default()
            .cache_pages(0)
            .group_commit_size(1)
            .wal_batch_multiplier(0);
        assert_eq!(cfg.cache_pages, 1);
        assert_eq!(cfg.group_commit_size, 512);
        assert_eq!(cfg.wal_batch_multiplier, 1);
    }
}
