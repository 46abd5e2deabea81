use lruttl::LruCacheWithTtl;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Whether a domain accepts arbitrary local parts.
/// Yes/No are only ever recorded after a completed random-local-part probe
/// round-trip; Unreachable means the probe could not get an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchAllState {
    Unknown,
    Yes,
    No,
    Unreachable,
}

/// Ephemeral per-domain state shared across requests. MX records live in
/// the resolver's own cache and the provider classification is derived
/// from them, so the only attribute that needs independent memoization is
/// the catch-all probe result.
pub struct DomainFactsCache {
    catch_all: LruCacheWithTtl<String, CatchAllState>,
    catch_all_ttl: Duration,
    unreachable_ttl: Duration,
}

impl DomainFactsCache {
    pub fn new(catch_all_ttl: Duration) -> Self {
        Self {
            catch_all: LruCacheWithTtl::new_named("domain_facts_catch_all", 64 * 1024),
            catch_all_ttl,
            unreachable_ttl: Duration::from_secs(600),
        }
    }

    pub fn catch_all(&self, domain: &str) -> CatchAllState {
        self.catch_all
            .get(domain)
            .unwrap_or(CatchAllState::Unknown)
    }

    /// Memoize a catch-all probe. Concurrent callers for the same domain
    /// coalesce onto a single probe. A probe that could not complete is
    /// remembered only briefly so the next window retries it; Unknown is
    /// never cached.
    pub async fn probe_catch_all<Fut>(&self, domain: &str, probe: Fut) -> CatchAllState
    where
        Fut: Future<Output = CatchAllState>,
    {
        let catch_all_ttl = self.catch_all_ttl;
        let unreachable_ttl = self.unreachable_ttl;
        let lookup = self
            .catch_all
            .get_or_insert_with(
                &domain.to_string(),
                |state| match state {
                    CatchAllState::Yes | CatchAllState::No => catch_all_ttl,
                    _ => unreachable_ttl,
                },
                async {
                    match probe.await {
                        CatchAllState::Unknown => CatchAllState::Unreachable,
                        state => state,
                    }
                },
            )
            .await;
        lookup.item
    }
}
