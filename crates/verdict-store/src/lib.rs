use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

mod buffered;
mod facts;
mod memory;
mod sqlite_store;

pub use buffered::BufferedStore;
pub use facts::{CatchAllState, DomainFactsCache};
pub use memory::MemoryStore;
pub use sqlite_store::SqliteStore;

/// How confident we are that mail sent to the address will land in a
/// real mailbox.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Reachability {
    /// The mailbox accepted RCPT (or an equivalent signal) and nothing
    /// disqualifies it
    Safe,
    /// The mailbox likely exists but has quality issues: catch-all domain,
    /// role account, full inbox, disposable provider
    Risky,
    /// The mailbox or its domain does not accept mail
    Invalid,
    /// No usable signal
    Unknown,
}

/// Which stage of the cascade produced the verdict
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Tier {
    Cache,
    Fast,
    Smtp,
    Pattern,
    Enrichment,
    ReVerify,
}

/// One persisted decision about one normalized address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    /// The normalized address; the verdict key
    pub email: String,
    pub domain: String,
    pub reachability: Reachability,
    pub is_deliverable: Option<bool>,
    pub is_catch_all: bool,
    pub is_disposable: bool,
    pub is_role: bool,
    pub is_free: bool,
    pub mx_host: Option<String>,
    /// 0 when the pipeline never reached a RCPT reply
    pub smtp_code: u16,
    pub smtp_message: String,
    pub provider: String,
    pub verified_at: DateTime<Utc>,
    /// Classified reason code: mailbox_unknown, greylisted, timeout, ...
    pub error: Option<String>,
    pub tier: Tier,
    /// Debug annotation surfaced to callers (e.g. "risky-enriched")
    pub reason: Option<String>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
    #[error("corrupt record for {key}: {why}")]
    Corrupt { key: String, why: String },
}

impl From<sqlite::Error> for StoreError {
    fn from(err: sqlite::Error) -> Self {
        StoreError::Backend(format!("{err}"))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: u64,
    pub by_reachability: BTreeMap<String, u64>,
    pub catch_all: u64,
}

#[derive(Debug, Default, Clone)]
pub struct ScanFilter {
    pub reachability: Option<Reachability>,
    pub domain: Option<String>,
    pub limit: Option<usize>,
}

/// The persistence seam. Backends must be safe under concurrent readers
/// and writers; concurrent `put`s for the same key resolve
/// last-writer-wins by `verified_at`.
#[async_trait]
pub trait VerdictStore: Send + Sync {
    /// Fetch a verdict along with its age. Stale records are returned
    /// as-is; freshness policy belongs to the caller.
    async fn get(&self, normalized: &str) -> Result<Option<(VerdictRecord, Duration)>, StoreError>;

    /// Upsert by normalized address.
    async fn put(&self, record: VerdictRecord) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    async fn scan(&self, filter: ScanFilter) -> Result<Vec<VerdictRecord>, StoreError>;
}

/// Bulk-copy verdicts between stores. This is what the operator migration
/// command drives; it goes through the public interface only.
pub async fn migrate(src: &dyn VerdictStore, dst: &dyn VerdictStore) -> Result<u64, StoreError> {
    let records = src.scan(ScanFilter::default()).await?;
    let mut copied = 0u64;
    for record in records {
        dst.put(record).await?;
        copied += 1;
    }
    Ok(copied)
}

pub(crate) fn age_of(record: &VerdictRecord) -> Duration {
    (Utc::now() - record.verified_at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn record(email: &str, reachability: Reachability) -> VerdictRecord {
        let domain = email.split('@').next_back().unwrap_or("").to_string();
        VerdictRecord {
            email: email.to_string(),
            domain,
            reachability,
            is_deliverable: Some(reachability == Reachability::Safe),
            is_catch_all: false,
            is_disposable: false,
            is_role: false,
            is_free: false,
            mx_host: Some("mx1.example.com".to_string()),
            smtp_code: 250,
            smtp_message: "ok".to_string(),
            provider: "other".to_string(),
            verified_at: Utc::now(),
            error: None,
            tier: Tier::Smtp,
            reason: None,
        }
    }
}
