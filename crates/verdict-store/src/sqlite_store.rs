use crate::{
    age_of, Reachability, ScanFilter, StoreError, StoreStats, Tier, VerdictRecord, VerdictStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlite::{Connection, ConnectionThreadSafe, State, Statement};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS verified_emails (
  email TEXT PRIMARY KEY,
  normalized TEXT NOT NULL,
  reachability TEXT NOT NULL,
  is_deliverable BOOL,
  is_catch_all BOOL,
  is_disposable BOOL NOT NULL,
  is_role BOOL NOT NULL,
  is_free BOOL NOT NULL,
  mx_host TEXT,
  smtp_code INT NOT NULL,
  smtp_message TEXT,
  provider TEXT,
  domain TEXT,
  verified_at TIMESTAMP NOT NULL,
  error TEXT,
  tier TEXT NOT NULL,
  reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_verified_reachability ON verified_emails (reachability);
CREATE INDEX IF NOT EXISTS idx_verified_domain ON verified_emails (domain);
CREATE INDEX IF NOT EXISTS idx_verified_at ON verified_emails (verified_at);
";

/// The embedded durable backend.
/// All statements run on the blocking thread pool; the connection is
/// thread safe and sqlite serializes writers internally, which satisfies
/// the per-key write serialization requirement.
pub struct SqliteStore {
    db: Arc<ConnectionThreadSafe>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Connection::open_thread_safe(path)?;
        db.execute("PRAGMA journal_mode = WAL")?;
        db.execute(SCHEMA)?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn with_db<T, F>(&self, func: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&ConnectionThreadSafe) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || func(&db))
            .await
            .map_err(|err| StoreError::Backend(format!("spawn_blocking: {err}")))?
    }
}

fn read_record(stmt: &Statement) -> Result<VerdictRecord, StoreError> {
    let email: String = stmt.read("email")?;
    let corrupt = |why: String| StoreError::Corrupt {
        key: email.clone(),
        why,
    };

    let reachability: String = stmt.read("reachability")?;
    let reachability: Reachability = reachability
        .parse()
        .map_err(|_| corrupt(format!("bad reachability {reachability:?}")))?;

    let verified_at: String = stmt.read("verified_at")?;
    let verified_at = DateTime::parse_from_rfc3339(&verified_at)
        .map_err(|err| corrupt(format!("bad verified_at: {err}")))?
        .with_timezone(&Utc);

    let is_deliverable: Option<i64> = stmt.read("is_deliverable")?;

    let tier: String = stmt.read("tier")?;
    let tier: Tier = tier
        .parse()
        .map_err(|_| corrupt(format!("bad tier {tier:?}")))?;

    Ok(VerdictRecord {
        email: email.clone(),
        domain: stmt.read::<Option<String>, _>("domain")?.unwrap_or_default(),
        reachability,
        is_deliverable: is_deliverable.map(|v| v != 0),
        is_catch_all: stmt.read::<i64, _>("is_catch_all")? != 0,
        is_disposable: stmt.read::<i64, _>("is_disposable")? != 0,
        is_role: stmt.read::<i64, _>("is_role")? != 0,
        is_free: stmt.read::<i64, _>("is_free")? != 0,
        mx_host: stmt.read("mx_host")?,
        smtp_code: stmt.read::<i64, _>("smtp_code")? as u16,
        smtp_message: stmt
            .read::<Option<String>, _>("smtp_message")?
            .unwrap_or_default(),
        provider: stmt
            .read::<Option<String>, _>("provider")?
            .unwrap_or_default(),
        verified_at,
        error: stmt.read("error")?,
        tier,
        reason: stmt.read("reason")?,
    })
}

#[async_trait]
impl VerdictStore for SqliteStore {
    async fn get(&self, normalized: &str) -> Result<Option<(VerdictRecord, Duration)>, StoreError> {
        let key = normalized.to_string();
        self.with_db(move |db| {
            let mut stmt = db.prepare("SELECT * FROM verified_emails WHERE email = ?")?;
            stmt.bind((1, key.as_str()))?;
            match stmt.next()? {
                State::Row => {
                    let record = read_record(&stmt)?;
                    let age = age_of(&record);
                    Ok(Some((record, age)))
                }
                State::Done => Ok(None),
            }
        })
        .await
    }

    async fn put(&self, record: VerdictRecord) -> Result<(), StoreError> {
        self.with_db(move |db| {
            // The WHERE clause on the upsert makes concurrent writers
            // resolve last-writer-wins by verified_at
            let mut stmt = db.prepare(
                "INSERT INTO verified_emails
                   (email, normalized, reachability, is_deliverable, is_catch_all,
                    is_disposable, is_role, is_free, mx_host, smtp_code,
                    smtp_message, provider, domain, verified_at, error, tier, reason)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(email) DO UPDATE SET
                   reachability = excluded.reachability,
                   is_deliverable = excluded.is_deliverable,
                   is_catch_all = excluded.is_catch_all,
                   is_disposable = excluded.is_disposable,
                   is_role = excluded.is_role,
                   is_free = excluded.is_free,
                   mx_host = excluded.mx_host,
                   smtp_code = excluded.smtp_code,
                   smtp_message = excluded.smtp_message,
                   provider = excluded.provider,
                   domain = excluded.domain,
                   verified_at = excluded.verified_at,
                   error = excluded.error,
                   tier = excluded.tier,
                   reason = excluded.reason
                 WHERE excluded.verified_at >= verified_emails.verified_at",
            )?;
            stmt.bind((1, record.email.as_str()))?;
            stmt.bind((2, record.email.as_str()))?;
            stmt.bind((3, record.reachability.to_string().as_str()))?;
            match record.is_deliverable {
                Some(v) => stmt.bind((4, v as i64))?,
                None => stmt.bind((4, ()))?,
            }
            stmt.bind((5, record.is_catch_all as i64))?;
            stmt.bind((6, record.is_disposable as i64))?;
            stmt.bind((7, record.is_role as i64))?;
            stmt.bind((8, record.is_free as i64))?;
            match &record.mx_host {
                Some(host) => stmt.bind((9, host.as_str()))?,
                None => stmt.bind((9, ()))?,
            }
            stmt.bind((10, record.smtp_code as i64))?;
            stmt.bind((11, record.smtp_message.as_str()))?;
            stmt.bind((12, record.provider.as_str()))?;
            stmt.bind((13, record.domain.as_str()))?;
            stmt.bind((14, record.verified_at.to_rfc3339().as_str()))?;
            match &record.error {
                Some(error) => stmt.bind((15, error.as_str()))?,
                None => stmt.bind((15, ()))?,
            }
            stmt.bind((16, record.tier.to_string().as_str()))?;
            match &record.reason {
                Some(reason) => stmt.bind((17, reason.as_str()))?,
                None => stmt.bind((17, ()))?,
            }
            while stmt.next()? != State::Done {}

            Ok(())
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.with_db(|db| {
            let mut stats = StoreStats::default();

            let mut stmt = db.prepare(
                "SELECT reachability, COUNT(*) FROM verified_emails GROUP BY reachability",
            )?;
            while let State::Row = stmt.next()? {
                let reachability: String = stmt.read(0)?;
                let count: i64 = stmt.read(1)?;
                stats.total += count as u64;
                stats.by_reachability.insert(reachability, count as u64);
            }

            let mut stmt =
                db.prepare("SELECT COUNT(*) FROM verified_emails WHERE is_catch_all = 1")?;
            if let State::Row = stmt.next()? {
                let count: i64 = stmt.read(0)?;
                stats.catch_all = count as u64;
            }

            Ok(stats)
        })
        .await
    }

    async fn scan(&self, filter: ScanFilter) -> Result<Vec<VerdictRecord>, StoreError> {
        self.with_db(move |db| {
            let mut sql = "SELECT * FROM verified_emails WHERE 1=1".to_string();
            if filter.reachability.is_some() {
                sql.push_str(" AND reachability = :reachability");
            }
            if filter.domain.is_some() {
                sql.push_str(" AND domain = :domain");
            }
            sql.push_str(" ORDER BY email");
            if filter.limit.is_some() {
                sql.push_str(" LIMIT :limit");
            }

            let mut stmt = db.prepare(&sql)?;
            if let Some(reachability) = filter.reachability {
                stmt.bind((":reachability", reachability.to_string().as_str()))?;
            }
            if let Some(domain) = &filter.domain {
                stmt.bind((":domain", domain.as_str()))?;
            }
            if let Some(limit) = filter.limit {
                stmt.bind((":limit", limit as i64))?;
            }

            let mut result = vec![];
            while let State::Row = stmt.next()? {
                result.push(read_record(&stmt)?);
            }
            Ok(result)
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::record;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("verdicts.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn round_trip() {
        let (_dir, store) = open_temp();
        let mut r = record("jane.doe@corp.example", Reachability::Safe);
        r.tier = Tier::ReVerify;
        r.reason = Some("risky-enriched".to_string());
        store.put(r.clone()).await.unwrap();

        let (got, age) = store.get("jane.doe@corp.example").await.unwrap().unwrap();
        // rfc3339 carries the full nanosecond value, so the whole record
        // survives the round-trip
        k9::assert_equal!(got, r);
        assert!(age < Duration::from_secs(1));

        assert!(store.get("missing@corp.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_refreshes_and_old_writes_lose() {
        let (_dir, store) = open_temp();
        let mut newer = record("a@x.example", Reachability::Safe);
        store.put(newer.clone()).await.unwrap();

        // A write carrying an older verified_at must not clobber
        let mut older = record("a@x.example", Reachability::Invalid);
        older.verified_at = newer.verified_at - chrono::Duration::hours(1);
        store.put(older).await.unwrap();

        let (got, _) = store.get("a@x.example").await.unwrap().unwrap();
        k9::assert_equal!(got.reachability, Reachability::Safe);

        // And a newer one wins
        newer.reachability = Reachability::Risky;
        newer.verified_at = Utc::now() + chrono::Duration::seconds(1);
        store.put(newer).await.unwrap();
        let (got, _) = store.get("a@x.example").await.unwrap().unwrap();
        k9::assert_equal!(got.reachability, Reachability::Risky);
    }

    #[tokio::test]
    async fn stats_and_filtered_scan() {
        let (_dir, store) = open_temp();
        store
            .put(record("a@one.example", Reachability::Safe))
            .await
            .unwrap();
        store
            .put(record("b@one.example", Reachability::Invalid))
            .await
            .unwrap();
        store
            .put(record("c@two.example", Reachability::Safe))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_reachability.get("safe"), Some(&2));

        let safes = store
            .scan(ScanFilter {
                reachability: Some(Reachability::Safe),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(safes.len(), 2);
        assert_eq!(safes[0].email, "a@one.example");
        assert_eq!(safes[1].email, "c@two.example");

        let limited = store
            .scan(ScanFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
