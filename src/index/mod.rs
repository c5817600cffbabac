//! Secondary indexes: hash for equality, B-tree for ranges, plus the
//! auto-indexing advisor. Indexes are in-memory structures rebuilt from
//! storage on open and maintained transactionally with row writes.

pub mod advisor;
pub mod btree;
pub mod hash;
pub mod key_encoding;

use crate::error::Result;
use crate::index::btree::BTreeIndex;
use crate::index::hash::{HashIndex, IndexStats};
use crate::index::key_encoding::encode_value;
use crate::storage::RowRef;
use crate::types::Value;

pub use advisor::{IndexAdvisor, IndexRecommendation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Hash,
    BTree,
}

impl IndexKind {
    pub const fn tag(self) -> u8 {
        match self {
            IndexKind::Hash => 1,
            IndexKind::BTree => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => IndexKind::Hash,
            2 => IndexKind::BTree,
            _ => return None,
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            IndexKind::Hash => "HASH",
            IndexKind::BTree => "BTREE",
        }
    }
}

enum IndexImpl {
    Hash(HashIndex<Vec<u8>>),
    BTree(BTreeIndex),
}

/// One secondary index over a single column.
pub struct SecondaryIndex {
    pub name: String,
    pub column: String,
    pub unique: bool,
    kind: IndexKind,
    inner: IndexImpl,
}

impl SecondaryIndex {
    pub fn new(name: String, column: String, kind: IndexKind, unique: bool) -> Self {
        let inner = match kind {
            IndexKind::Hash => IndexImpl::Hash(HashIndex::new()),
            IndexKind::BTree => IndexImpl::BTree(BTreeIndex::new()),
        };
        SecondaryIndex { name, column, unique, kind, inner }
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn supports_range(&self) -> bool {
        matches!(self.kind, IndexKind::BTree)
    }

    /// NULL keys are not indexed.
    pub fn add(&mut self, value: &Value, row_ref: RowRef) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        let key = encode_value(value)?;
        match &mut self.inner {
            IndexImpl::Hash(idx) => idx.add(key, row_ref),
            IndexImpl::BTree(idx) => idx.add(key, row_ref),
        }
        Ok(())
    }

    pub fn remove(&mut self, value: &Value, row_ref: RowRef) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        let key = encode_value(value)?;
        match &mut self.inner {
            IndexImpl::Hash(idx) => idx.remove(&key, row_ref),
            IndexImpl::BTree(idx) => idx.remove(&key, row_ref),
        }
        Ok(())
    }

    pub fn find(&self, value: &Value) -> Result<Vec<RowRef>> {
        if value.is_null() {
            return Ok(Vec::new());
        }
        let key = encode_value(value)?;
        Ok(match &self.inner {
            IndexImpl::Hash(idx) => idx.find(&key).collect(),
            IndexImpl::BTree(idx) => idx.find(&key).collect(),
        })
    }

    /// Inclusive range over a B-tree index; over-approximates strict
    /// bounds, so callers re-apply the predicate.
    pub fn find_range(&self, lo: Option<&Value>, hi: Option<&Value>) -> Result<Vec<RowRef>> {
        let IndexImpl::BTree(idx) = &self.inner else {
            return Ok(Vec::new());
        };
        let lo_key = match lo {
            Some(v) if !v.is_null() => Some(encode_value(v)?),
            _ => None,
        };
        let hi_key = match hi {
            Some(v) if !v.is_null() => Some(encode_value(v)?),
            _ => None,
        };
        Ok(idx.find_range(lo_key.as_deref(), hi_key.as_deref()).collect())
    }

    pub fn rebuild<'a, I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a Value, RowRef)>,
    {
        let mut encoded = Vec::new();
        for (value, row_ref) in entries {
            if value.is_null() {
                continue;
            }
            encoded.push((encode_value(value)?, row_ref));
        }
        match &mut self.inner {
            IndexImpl::Hash(idx) => idx.rebuild(encoded),
            IndexImpl::BTree(idx) => idx.rebuild(encoded),
        }
        Ok(())
    }

    pub fn stats(&self) -> IndexStats {
        match &self.inner {
            IndexImpl::Hash(idx) => idx.stats(),
            IndexImpl::BTree(idx) => idx.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_keys_ignored() {
        let mut idx = SecondaryIndex::new("i".into(), "c".into(), IndexKind::Hash, false);
        idx.add(&Value::Null, RowRef::Offset(1)).unwrap();
        idx.add(&Value::Integer(1), RowRef::Offset(2)).unwrap();
        assert_eq!(idx.stats().total_entries, 1);
        assert!(idx.find(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_btree_range_through_wrapper() {
        let mut idx = SecondaryIndex::new("i".into(), "c".into(), IndexKind::BTree, false);
        for v in 0..10 {
            idx.add(&Value::Integer(v), RowRef::Offset(v as u64)).unwrap();
        }
        let hits = idx
            .find_range(Some(&Value::Integer(3)), Some(&Value::Integer(5)))
            .unwrap();
        assert_eq!(hits.len(), 3);
        // Hash indexes do not answer ranges.
        let hash = SecondaryIndex::new("h".into(), "c".into(), IndexKind::Hash, false);
        assert!(hash
            .find_range(Some(&Value::Integer(0)), None)
            .unwrap()
            .is_empty());
    }
}
