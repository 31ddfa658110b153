use std::collections::HashSet;

use jobsift_core::{DedupKey, VacancyRecord};
use tracing::debug;

/// Keeps the first record seen for each `DedupKey`.
///
/// A repeated storage key (the same posting returned twice by one source) is
/// dropped as well. Survivors keep their relative input order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossSourceDeduplicator;

impl CrossSourceDeduplicator {
    pub fn new() -> Self {
        Self
    }

    pub fn deduplicate(&self, records: &[VacancyRecord]) -> Vec<VacancyRecord> {
        let mut seen_keys: HashSet<DedupKey> = HashSet::with_capacity(records.len());
        let mut seen_storage: HashSet<String> = HashSet::with_capacity(records.len());
        let mut out = Vec::with_capacity(records.len());

        for record in records {
            let key = record.dedup_key();
            let storage_key = record.storage_key();
            if seen_keys.contains(&key) || seen_storage.contains(&storage_key) {
                continue;
            }
            seen_keys.insert(key);
            seen_storage.insert(storage_key);
            out.push(record.clone());
        }

        debug!(input = records.len(), unique = out.len(), "deduplicated records");
        out
    }
}
