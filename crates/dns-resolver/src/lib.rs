use hickory_resolver::Name;
use lruttl::LruCacheWithTtl;
use rand::prelude::SliceRandom;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;

mod resolver;
pub use resolver::{
    fully_qualify, DnsError, HickoryResolver, IpAnswer, MxAnswer, Resolver, TestResolver,
};

static MX_SUCCESS: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "dns_mx_resolve_status_ok",
        "total number of successful MX resolutions"
    )
    .unwrap()
});
static MX_FAIL: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "dns_mx_resolve_status_fail",
        "total number of failed MX resolutions"
    )
    .unwrap()
});
static MX_QUERIES: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "dns_mx_resolve_cache_miss",
        "total number of MX resolutions that resulted in a DNS query"
    )
    .unwrap()
});
static MX_CACHED: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "dns_mx_resolve_cache_hit",
        "total number of MX resolutions satisfied from cache"
    )
    .unwrap()
});

/// The resolved mail-exchanger set for a domain, ordered by preference.
#[derive(Clone, Debug, Serialize)]
pub struct MailExchanger {
    pub domain_name: String,
    /// All hosts in preference order
    pub hosts: Vec<String>,
    pub by_pref: BTreeMap<u16, Vec<String>>,
    /// True when the domain published an MX record set (as opposed to the
    /// implicit A/AAAA fallback)
    pub is_mx: bool,
    /// The domain published a null MX (RFC 7505); it does not accept mail
    pub is_null_mx: bool,
    #[serde(skip)]
    expires: Instant,
}

impl MailExchanger {
    pub fn has_expired(&self) -> bool {
        self.expires <= Instant::now()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub name: String,
    pub addr: IpAddr,
}

#[derive(Debug, Clone)]
pub struct MxResolverParams {
    /// Cap applied to the TTL reported by DNS
    pub ttl_cap: Duration,
    /// How long an NXDOMAIN result is remembered
    pub negative_ttl: Duration,
    /// How long a transient failure is remembered before the next attempt
    pub transient_ttl: Duration,
    pub query_timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for MxResolverParams {
    fn default() -> Self {
        Self {
            ttl_cap: Duration::from_secs(86400),
            negative_ttl: Duration::from_secs(300),
            transient_ttl: Duration::from_secs(30),
            query_timeout: Duration::from_secs(5),
            max_concurrency: 128,
        }
    }
}

/// Caching MX resolution. One instance is shared by the whole pipeline;
/// concurrent lookups for the same domain coalesce onto a single query.
pub struct MxResolver {
    resolver: Arc<dyn Resolver>,
    params: MxResolverParams,
    mx_cache: LruCacheWithTtl<Name, Result<Arc<MailExchanger>, DnsError>>,
    ip_cache: LruCacheWithTtl<Name, (Arc<Vec<IpAddr>>, Instant)>,
    sema: Semaphore,
}

impl MxResolver {
    pub fn new(resolver: Arc<dyn Resolver>, params: MxResolverParams) -> Self {
        let sema = Semaphore::new(params.max_concurrency);
        Self {
            resolver,
            params,
            mx_cache: LruCacheWithTtl::new_named("dns_resolver_mx", 64 * 1024),
            ip_cache: LruCacheWithTtl::new_named("dns_resolver_ip", 1024),
            sema,
        }
    }

    /// Resolve the MX host set for a domain.
    /// NXDOMAIN and null-MX are definitive (`Err(NxDomain)` and
    /// `is_null_mx` respectively); transient failures are negative-cached
    /// briefly and surfaced as `Err(Transient)`.
    pub async fn resolve(&self, domain_name: &str) -> Result<Arc<MailExchanger>, DnsError> {
        let name_fq = fully_qualify(domain_name)?;

        let ttl_cap = self.params.ttl_cap;
        let negative_ttl = self.params.negative_ttl;
        let transient_ttl = self.params.transient_ttl;

        let lookup = self
            .mx_cache
            .get_or_insert_with(
                &name_fq,
                |result| match result {
                    Ok(mx) => mx
                        .expires
                        .checked_duration_since(Instant::now())
                        .unwrap_or_else(|| Duration::from_secs(10)),
                    Err(DnsError::NxDomain) => negative_ttl,
                    Err(_) => transient_ttl,
                },
                self.query_mx(&name_fq, ttl_cap),
            )
            .await;

        if lookup.is_fresh {
            MX_QUERIES.inc();
            match &lookup.item {
                Ok(_) => MX_SUCCESS.inc(),
                Err(_) => MX_FAIL.inc(),
            }
        } else {
            MX_CACHED.inc();
        }

        lookup.item
    }

    async fn query_mx(
        &self,
        name_fq: &Name,
        ttl_cap: Duration,
    ) -> Result<Arc<MailExchanger>, DnsError> {
        let start = Instant::now();
        let answer = {
            let _permit = self.sema.acquire().await;
            match timeout(self.params.query_timeout, self.resolver.resolve_mx(name_fq)).await {
                Ok(answer) => answer?,
                Err(_) => {
                    return Err(DnsError::Transient(format!(
                        "MX lookup for {name_fq} timed out after {:?}",
                        start.elapsed()
                    )))
                }
            }
        };

        if answer.nxdomain {
            tracing::debug!("{name_fq} is NXDOMAIN");
            return Err(DnsError::NxDomain);
        }

        let expires = Instant::now() + cap_ttl(answer.expires, ttl_cap);

        if answer.records.is_empty() {
            // No MX published: fall back to the domain's own A/AAAA records
            let host = strip_dot(&name_fq.to_ascii());
            let mut by_pref = BTreeMap::new();
            by_pref.insert(1, vec![host.clone()]);
            return Ok(Arc::new(MailExchanger {
                domain_name: host.clone(),
                hosts: vec![host],
                by_pref,
                is_mx: false,
                is_null_mx: false,
                expires,
            }));
        }

        let is_null_mx = answer.records.len() == 1 && answer.records[0].1.is_root();

        let mut by_pref: BTreeMap<u16, Vec<String>> = BTreeMap::new();
        for (pref, exchange) in &answer.records {
            let host = strip_dot(&exchange.to_ascii());
            let hosts = by_pref.entry(*pref).or_default();
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        // Deterministic ordering within each preference level; address
        // shuffling happens later, at resolve_addresses time
        for hosts in by_pref.values_mut() {
            hosts.sort();
        }

        let hosts = by_pref.values().flatten().cloned().collect();

        Ok(Arc::new(MailExchanger {
            domain_name: strip_dot(&name_fq.to_ascii()),
            hosts,
            by_pref,
            is_mx: true,
            is_null_mx,
            expires,
        }))
    }

    /// Resolve the candidate connection addresses for an MX set, in the
    /// order they should be tried. Hosts within a preference level are
    /// shuffled to spread load across equal-preference exchangers.
    /// Returns an empty list for a null MX.
    pub async fn resolve_addresses(&self, mx: &MailExchanger) -> Vec<ResolvedAddress> {
        let mut result = vec![];
        if mx.is_null_mx {
            return result;
        }

        for hosts in mx.by_pref.values() {
            let mut level = vec![];
            for mx_host in hosts {
                match self.ip_lookup(mx_host).await {
                    Ok(addrs) => {
                        for addr in addrs.iter() {
                            level.push(ResolvedAddress {
                                name: mx_host.clone(),
                                addr: *addr,
                            });
                        }
                    }
                    Err(err) => {
                        tracing::debug!("failed to resolve {mx_host}: {err:#}");
                        continue;
                    }
                }
            }
            level.shuffle(&mut rand::thread_rng());
            result.append(&mut level);
        }
        result
    }

    pub async fn ip_lookup(&self, host: &str) -> Result<Arc<Vec<IpAddr>>, DnsError> {
        if let Ok(literal) = host.parse::<IpAddr>() {
            return Ok(Arc::new(vec![literal]));
        }

        let host_fq = fully_qualify(host)?;
        let ttl_cap = self.params.ttl_cap;

        let lookup = self
            .ip_cache
            .get_or_try_insert(
                &host_fq,
                |(_, expires)| cap_ttl(*expires, ttl_cap),
                async {
                    let answer =
                        match timeout(self.params.query_timeout, self.resolver.resolve_ip(&host_fq))
                            .await
                        {
                            Ok(answer) => answer?,
                            Err(_) => {
                                return Err(DnsError::Transient(format!(
                                    "A/AAAA lookup for {host_fq} timed out"
                                )))
                            }
                        };
                    Ok((Arc::new(answer.addrs), answer.expires))
                },
            )
            .await?;

        Ok(lookup.item.0)
    }
}

fn cap_ttl(expires: Instant, cap: Duration) -> Duration {
    expires
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::ZERO)
        .min(cap)
}

fn strip_dot(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_string()
}
