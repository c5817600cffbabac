//! Auto-indexing advisor.
//!
//! Recommends indexes from two signals: column selectivity measured
//! during bulk analysis (distinct / total) and per-`(table, column)`
//! query frequency observed from WHERE clauses. The advisor is
//! best-effort everywhere — it never fails the statement that consulted
//! it.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::index::key_encoding::encode_primary_key;
use crate::index::IndexKind;
use crate::types::Value;

/// Columns above this selectivity are worth indexing on data shape alone.
const SELECTIVITY_THRESHOLD: f64 = 0.5;
/// Near-unique columns get a hash index; below this, a B-tree.
const HASH_SELECTIVITY: f64 = 0.9;
/// Frequently filtered columns are worth indexing regardless of shape.
const FREQUENCY_THRESHOLD: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecommendation {
    pub table: String,
    pub column: String,
    pub kind: IndexKind,
    pub selectivity: f64,
    pub query_frequency: u64,
}

#[derive(Default)]
pub struct IndexAdvisor {
    query_freq: HashMap<(String, String), u64>,
}

impl IndexAdvisor {
    pub fn new() -> Self {
        IndexAdvisor::default()
    }

    /// Record one observed WHERE-clause reference to `table.column`.
    pub fn record_query(&mut self, table: &str, column: &str) {
        *self
            .query_freq
            .entry((table.to_lowercase(), column.to_lowercase()))
            .or_insert(0) += 1;
    }

    pub fn query_frequency(&self, table: &str, column: &str) -> u64 {
        self.query_freq
            .get(&(table.to_lowercase(), column.to_lowercase()))
            .copied()
            .unwrap_or(0)
    }

    /// Per-column selectivity: distinct non-null values over total rows.
    pub fn column_selectivity(values: &[&Value]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut distinct: HashSet<Vec<u8>> = HashSet::new();
        for value in values {
            if value.is_null() {
                continue;
            }
            if let Ok(key) = encode_primary_key(value) {
                distinct.insert(key);
            }
        }
        distinct.len() as f64 / values.len() as f64
    }

    /// Analyze column data for one table and recommend indexes. Columns
    /// that already carry an index are expected to be filtered by the
    /// caller.
    pub fn analyze(
        &self,
        table: &str,
        columns: &[(String, Vec<&Value>)],
    ) -> Vec<IndexRecommendation> {
        let mut recommendations = Vec::new();
        for (column, values) in columns {
            let selectivity = Self::column_selectivity(values);
            let frequency = self.query_frequency(table, column);
            if selectivity > SELECTIVITY_THRESHOLD || frequency > FREQUENCY_THRESHOLD {
                let kind = if selectivity >= HASH_SELECTIVITY {
                    IndexKind::Hash
                } else {
                    IndexKind::BTree
                };
                debug!(table, column, selectivity, frequency, "index recommended");
                recommendations.push(IndexRecommendation {
                    table: table.to_string(),
                    column: column.clone(),
                    kind,
                    selectivity,
                    query_frequency: frequency,
                });
            }
        }
        recommendations
    }
}
