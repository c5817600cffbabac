//! Prepared statements and the compiled-plan cache.
//!
//! `prepare` parses once, records the parameter shape, and caches the
//! result keyed by SQL text in a bounded LRU. Repeated prepares of hot
//! statements skip the parser entirely.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::error::{Result, VaultError};
use crate::sql::ast::{ParamRef, Statement};
use crate::sql::parse_sql;

#[derive(Debug)]
pub struct PreparedStatement {
    pub sql: String,
    pub statement: Statement,
    /// Parameters in first-appearance order.
    pub params: Vec<ParamRef>,
}

impl PreparedStatement {
    pub fn prepare(sql: &str) -> Result<Self> {
        let statement = parse_sql(sql)
            .into_single()
            .map_err(|e| VaultError::Parse(e.to_string()))?;
        let params = statement.collect_params();
        Ok(PreparedStatement { sql: sql.to_string(), statement, params })
    }

    pub fn positional_param_count(&self) -> usize {
        self.params
            .iter()
            .filter(|p| matches!(p, ParamRef::Positional(_)))
            .count()
    }

    pub fn named_param_names(&self) -> Vec<&str> {
        self.params
            .iter()
            .filter_map(|p| match p {
                ParamRef::Named(name) => Some(name.as_str()),
                ParamRef::Positional(_) => None,
            })
            .collect()
    }
}

pub struct PlanCache {
    entries: LruCache<String, Arc<PreparedStatement>>,
    hits: u64,
    misses: u64,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        PlanCache {
            entries: LruCache::new(NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity")),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get_or_prepare(&mut self, sql: &str) -> Result<Arc<PreparedStatement>> {
        if let Some(prepared) = self.entries.get(sql) {
            self.hits += 1;
            return Ok(prepared.clone());
        }
        self.misses += 1;
        let prepared = Arc::new(PreparedStatement::prepare(sql)?);
        self.entries.put(sql.to_string(), prepared.clone());
        Ok(prepared)
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> (u64, u64, usize) {
        (self.hits, self.misses, self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_collects_params() {
        let prepared =
            PreparedStatement::prepare("SELECT * FROM t WHERE a = ? AND b = @limit AND c = ?")
                .unwrap();
        assert_eq!(prepared.positional_param_count(), 2);
        assert_eq!(prepared.named_param_names(), vec!["limit"]);
    }

    #[test]
    fn test_prepare_rejects_malformed() {
        assert!(matches!(
            PreparedStatement::prepare("SELEC broken"),
            Err(VaultError::Parse(_))
        ));
        assert!(PreparedStatement::prepare("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn test_cache_hits_skip_parsing() {
        let mut cache = PlanCache::new(4);
        let first = cache.get_or_prepare("SELECT * FROM t WHERE id = ?").unwrap();
        let second = cache.get_or_prepare("SELECT * FROM t WHERE id = ?").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let (hits, misses, len) = cache.stats();
        assert_eq!((hits, misses, len), (1, 1, 1));
    }

    #[test]
    fn test_cache_is_bounded() {
        let mut cache = PlanCache::new(2);
        cache.get_or_prepare("SELECT 1").unwrap();
        cache.get_or_prepare("SELECT 2").unwrap();
        cache.get_or_prepare("SELECT 3").unwrap();
        assert_eq!(cache.stats().2, 2);
    }
}
