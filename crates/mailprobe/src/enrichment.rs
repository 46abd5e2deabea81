use async_trait::async_trait;
use email_addr::EmailAddress;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relative cost of a lookup provider; drives the waterfall order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupCost {
    Cheap,
    Expensive,
}

impl Default for LookupCost {
    fn default() -> Self {
        Self::Cheap
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonCandidate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub title: Option<String>,
    pub company: Option<String>,
}

/// The enrichment capability. Providers are black boxes behind this seam;
/// the pipeline only knows their cost tag. Provider failure must never
/// fail a verification, so callers treat `Err` exactly like `None`.
#[async_trait]
pub trait PersonLookup: Send + Sync {
    fn cost(&self) -> LookupCost;
    async fn search(&self, address: &EmailAddress) -> anyhow::Result<Option<PersonCandidate>>;
}

#[derive(Serialize)]
struct LookupRequest<'a> {
    email: &'a str,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    found: bool,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    company: Option<String>,
}

/// Generic HTTP JSON provider: POST `{"email": "..."}`, receive a
/// candidate or `found: false`.
pub struct HttpPersonLookup {
    client: reqwest::Client,
    endpoint: String,
    cost: LookupCost,
}

impl HttpPersonLookup {
    pub fn new(endpoint: String, cost: LookupCost) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            cost,
        })
    }
}

#[async_trait]
impl PersonLookup for HttpPersonLookup {
    fn cost(&self) -> LookupCost {
        self.cost
    }

    async fn search(&self, address: &EmailAddress) -> anyhow::Result<Option<PersonCandidate>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&LookupRequest {
                email: &address.normalized,
            })
            .send()
            .await?
            .error_for_status()?;

        let decoded: LookupResponse = response.json().await?;
        if !decoded.found {
            return Ok(None);
        }
        Ok(Some(PersonCandidate {
            first_name: decoded.first_name,
            last_name: decoded.last_name,
            title: decoded.title,
            company: decoded.company,
        }))
    }
}

/// Scripted provider for tests and for wiring experiments.
#[derive(Default)]
pub struct StaticLookup {
    cost: LookupCost,
    entries: parking_lot::Mutex<std::collections::HashMap<String, PersonCandidate>>,
    fail: std::sync::atomic::AtomicBool,
    calls: std::sync::atomic::AtomicUsize,
}

impl StaticLookup {
    pub fn new(cost: LookupCost) -> Self {
        Self {
            cost,
            ..Default::default()
        }
    }

    pub fn with_candidate(self, normalized: &str, candidate: PersonCandidate) -> Self {
        self.entries
            .lock()
            .insert(normalized.to_string(), candidate);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl PersonLookup for StaticLookup {
    fn cost(&self) -> LookupCost {
        self.cost
    }

    async fn search(&self, address: &EmailAddress) -> anyhow::Result<Option<PersonCandidate>> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("provider outage");
        }
        Ok(self.entries.lock().get(&address.normalized).cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn static_lookup_round_trip() {
        let lookup = StaticLookup::new(LookupCost::Cheap).with_candidate(
            "jdoe@smallco.test",
            PersonCandidate {
                first_name: Some("J".to_string()),
                last_name: Some("Doe".to_string()),
                title: Some("CFO".to_string()),
                company: None,
            },
        );

        let addr = EmailAddress::parse("jdoe@smallco.test").unwrap();
        let hit = lookup.search(&addr).await.unwrap().unwrap();
        assert_eq!(hit.title.as_deref(), Some("CFO"));

        let miss = EmailAddress::parse("other@smallco.test").unwrap();
        assert!(lookup.search(&miss).await.unwrap().is_none());
        assert_eq!(lookup.calls(), 2);

        lookup.set_failing(true);
        assert!(lookup.search(&addr).await.is_err());
    }
}
