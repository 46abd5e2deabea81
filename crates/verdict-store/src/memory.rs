use crate::{age_of, ScanFilter, StoreError, StoreStats, VerdictRecord, VerdictStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// A process-local store. Useful for tests and for deployments that treat
/// the cache as purely ephemeral.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, VerdictRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerdictStore for MemoryStore {
    async fn get(&self, normalized: &str) -> Result<Option<(VerdictRecord, Duration)>, StoreError> {
        Ok(self
            .records
            .read()
            .get(normalized)
            .map(|record| (record.clone(), age_of(record))))
    }

    async fn put(&self, record: VerdictRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        match records.get(&record.email) {
            // last-writer-wins by verified_at
            Some(existing) if existing.verified_at > record.verified_at => {}
            _ => {
                records.insert(record.email.clone(), record);
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let records = self.records.read();
        let mut stats = StoreStats {
            total: records.len() as u64,
            ..Default::default()
        };
        for record in records.values() {
            *stats
                .by_reachability
                .entry(record.reachability.to_string())
                .or_default() += 1;
            if record.is_catch_all {
                stats.catch_all += 1;
            }
        }
        Ok(stats)
    }

    async fn scan(&self, filter: ScanFilter) -> Result<Vec<VerdictRecord>, StoreError> {
        let records = self.records.read();
        let mut result: Vec<VerdictRecord> = records
            .values()
            .filter(|r| {
                filter
                    .reachability
                    .map(|want| r.reachability == want)
                    .unwrap_or(true)
                    && filter
                        .domain
                        .as_deref()
                        .map(|want| r.domain == want)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| a.email.cmp(&b.email));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }
}
