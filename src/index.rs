use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::model::DatabaseRecord;
use crate::vector::{self, Generator, LazyVector};

/// Concurrent id -> record map with similarity and predicate queries.
///
/// Each index is owned by exactly one component; other nodes only ever
/// see copies delivered through replication messages.
#[derive(Default)]
pub struct VectorIndex {
    spaces: RwLock<HashMap<String, Generator>>,
    records: RwLock<HashMap<String, DatabaseRecord>>,
}

impl fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorIndex")
        .field("record_count", &self.len())
        .finish()
    }
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reusable generator under `name`. Stored vectors are unaffected.
    pub fn define_vector_space(&self, name: impl Into<String>, generator: Generator) {
        let mut spaces = self.spaces.write().unwrap_or_else(PoisonError::into_inner);
        spaces.insert(name.into(), generator);
    }

    /// Fresh vector drawn from a registered space.
    pub fn vector_in_space(&self, name: &str) -> Option<LazyVector> {
        let spaces = self.spaces.read().unwrap_or_else(PoisonError::into_inner);
        spaces.get(name).cloned().map(LazyVector::from_generator)
    }

    /// Stores `record` under its id, replacing any previous record with
    /// the same id. Vectors without a generator get the fallback one.
    pub fn insert(&self, mut record: DatabaseRecord) -> Result<()> {
        if record.id.is_empty() {
            return Err(Error::InvalidInput("record id is empty".into()));
        }
        if !record.vector.has_generator() {
            record.vector = record.vector.with_default_generator();
        }

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<DatabaseRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every record, ordered by id.
    pub fn records(&self) -> Vec<DatabaseRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Up to `max_results` records whose vector satisfies `predicate`.
    ///
    /// Iteration order is unspecified and may differ between calls. The
    /// predicate may read any dimension, growing that vector's cache.
    pub fn query_by_dimension<P>(&self, predicate: P, max_results: usize) -> Vec<DatabaseRecord>
    where
        P: Fn(&LazyVector) -> bool,
    {
        let mut results = Vec::new();
        if max_results == 0 {
            return results;
        }

        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        for record in records.values() {
            if predicate(&record.vector) {
                results.push(record.clone());
                if results.len() >= max_results {
                    break;
                }
            }
        }
        results
    }

    /// Every record whose similarity to `query` over the first
    /// `max_dimensions` elements is at least `threshold`. Uncapped.
    pub fn advanced_query(
        &self,
        threshold: f64,
        query: &LazyVector,
        max_dimensions: usize,
    ) -> Vec<DatabaseRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
        .values()
        .filter(|record| vector::similarity(query, &record.vector, max_dimensions) >= threshold)
        .cloned()
        .collect()
    }
}
