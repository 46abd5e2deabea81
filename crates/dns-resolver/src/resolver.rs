use async_trait::async_trait;
use hickory_proto::ProtoErrorKind;
use hickory_resolver::proto::op::response_code::ResponseCode;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::{Name, TokioResolver};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DnsError {
    #[error("invalid DNS name: {0}")]
    InvalidName(String),
    /// The domain definitively does not exist
    #[error("NXDOMAIN")]
    NxDomain,
    /// SERVFAIL, timeout, or any other condition that may succeed later
    #[error("DNS: {0}")]
    Transient(String),
}

/// An MX answer. `records` is the raw (preference, exchange) set; empty
/// records with `nxdomain = false` means the domain exists but has no MX,
/// which callers treat as an implicit A/AAAA fallback.
#[derive(Debug, Clone)]
pub struct MxAnswer {
    pub records: Vec<(u16, Name)>,
    pub nxdomain: bool,
    pub expires: Instant,
}

#[derive(Debug, Clone)]
pub struct IpAnswer {
    pub addrs: Vec<IpAddr>,
    pub expires: Instant,
}

/// The DNS seam. The production implementation wraps hickory; tests script
/// answers per domain.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve_mx(&self, domain: &Name) -> Result<MxAnswer, DnsError>;
    async fn resolve_ip(&self, host: &Name) -> Result<IpAnswer, DnsError>;
}

pub fn fully_qualify(domain_name: &str) -> Result<Name, DnsError> {
    let mut name = Name::from_str_relaxed(domain_name)
        .map_err(|err| DnsError::InvalidName(format!("{domain_name}: {err}")))?
        .to_lowercase();
    name.set_fqdn(true);
    Ok(name)
}

pub struct HickoryResolver {
    inner: TokioResolver,
}

impl HickoryResolver {
    pub fn new() -> Result<Self, hickory_resolver::ResolveError> {
        Ok(Self {
            inner: TokioResolver::builder_tokio()?.build(),
        })
    }

    async fn lookup(
        &self,
        name: &Name,
        rrtype: RecordType,
    ) -> Result<(Vec<hickory_proto::rr::RData>, Instant), DnsError> {
        match self.inner.lookup(name.clone(), rrtype).await {
            Ok(result) => {
                let expires = result.valid_until();
                Ok((result.iter().cloned().collect(), expires))
            }
            Err(err) => match err.proto().map(|err| err.kind()) {
                Some(ProtoErrorKind::NoRecordsFound {
                    negative_ttl,
                    response_code,
                    ..
                }) => {
                    if *response_code == ResponseCode::NXDomain {
                        Err(DnsError::NxDomain)
                    } else {
                        let expires = Instant::now()
                            + Duration::from_secs(negative_ttl.unwrap_or(60) as u64);
                        Ok((vec![], expires))
                    }
                }
                _ => Err(DnsError::Transient(format!(
                    "failed to query DNS for {name}: {err}"
                ))),
            },
        }
    }
}

impl From<TokioResolver> for HickoryResolver {
    fn from(inner: TokioResolver) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve_mx(&self, domain: &Name) -> Result<MxAnswer, DnsError> {
        match self.lookup(domain, RecordType::MX).await {
            Ok((records, expires)) => Ok(MxAnswer {
                records: records
                    .iter()
                    .filter_map(|r| r.as_mx())
                    .map(|mx| (mx.preference(), mx.exchange().to_lowercase()))
                    .collect(),
                nxdomain: false,
                expires,
            }),
            Err(DnsError::NxDomain) => Ok(MxAnswer {
                records: vec![],
                nxdomain: true,
                expires: Instant::now() + Duration::from_secs(60),
            }),
            Err(err) => Err(err),
        }
    }

    async fn resolve_ip(&self, host: &Name) -> Result<IpAnswer, DnsError> {
        let (v4, v6) = tokio::join!(
            self.lookup(host, RecordType::A),
            self.lookup(host, RecordType::AAAA)
        );

        let mut addrs = vec![];
        let mut expires = None;
        let mut errors = vec![];

        for result in [v4, v6] {
            match result {
                Ok((records, exp)) => {
                    let new_expires = match expires.take() {
                        Some(existing) => exp.min(existing),
                        None => exp,
                    };
                    expires.replace(new_expires);
                    for r in &records {
                        if let Some(a) = r.as_a() {
                            addrs.push(IpAddr::V4(a.0));
                        } else if let Some(aaaa) = r.as_aaaa() {
                            addrs.push(IpAddr::V6(aaaa.0));
                        }
                    }
                }
                Err(err) => errors.push(err),
            }
        }

        if addrs.is_empty() {
            if let Some(err) = errors.into_iter().next() {
                return Err(err);
            }
        }

        Ok(IpAnswer {
            addrs,
            expires: expires.unwrap_or_else(|| Instant::now() + Duration::from_secs(60)),
        })
    }
}

#[derive(Debug, Clone)]
enum TestZone {
    Mx(Vec<(u16, String)>),
    NxDomain,
    /// Domain exists, but only as an A record
    AOnly,
    Fail(String),
}

/// A scripted resolver for tests. Counts queries so that single-flight
/// behavior can be asserted.
#[derive(Default)]
pub struct TestResolver {
    zones: Mutex<BTreeMap<String, TestZone>>,
    hosts: Mutex<BTreeMap<String, Vec<IpAddr>>>,
    mx_queries: AtomicUsize,
    ip_queries: AtomicUsize,
}

impl TestResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mx(self, domain: &str, records: &[(u16, &str)]) -> Self {
        self.zones.lock().insert(
            key(domain),
            TestZone::Mx(
                records
                    .iter()
                    .map(|(pref, host)| (*pref, key(host)))
                    .collect(),
            ),
        );
        self
    }

    pub fn with_null_mx(self, domain: &str) -> Self {
        self.zones
            .lock()
            .insert(key(domain), TestZone::Mx(vec![(0, ".".to_string())]));
        self
    }

    pub fn with_nxdomain(self, domain: &str) -> Self {
        self.zones.lock().insert(key(domain), TestZone::NxDomain);
        self
    }

    pub fn with_a_only(self, domain: &str, addrs: &[IpAddr]) -> Self {
        self.zones.lock().insert(key(domain), TestZone::AOnly);
        self.hosts.lock().insert(key(domain), addrs.to_vec());
        self
    }

    pub fn with_transient_failure(self, domain: &str, why: &str) -> Self {
        self.zones
            .lock()
            .insert(key(domain), TestZone::Fail(why.to_string()));
        self
    }

    pub fn with_host(self, host: &str, addrs: &[IpAddr]) -> Self {
        self.hosts.lock().insert(key(host), addrs.to_vec());
        self
    }

    pub fn mx_query_count(&self) -> usize {
        self.mx_queries.load(Ordering::SeqCst)
    }

    pub fn ip_query_count(&self) -> usize {
        self.ip_queries.load(Ordering::SeqCst)
    }
}

fn key(domain: &str) -> String {
    let lower = domain.to_ascii_lowercase();
    lower.strip_suffix('.').unwrap_or(&lower).to_string()
}

#[async_trait]
impl Resolver for TestResolver {
    async fn resolve_mx(&self, domain: &Name) -> Result<MxAnswer, DnsError> {
        self.mx_queries.fetch_add(1, Ordering::SeqCst);
        let expires = Instant::now() + Duration::from_secs(300);
        let zone = self.zones.lock().get(&key(&domain.to_ascii())).cloned();
        match zone {
            Some(TestZone::Mx(records)) => Ok(MxAnswer {
                records: records
                    .iter()
                    .map(|(pref, host)| {
                        let name = if host == "." {
                            Name::root()
                        } else {
                            fully_qualify(host).expect("test host name is valid")
                        };
                        (*pref, name)
                    })
                    .collect(),
                nxdomain: false,
                expires,
            }),
            Some(TestZone::AOnly) => Ok(MxAnswer {
                records: vec![],
                nxdomain: false,
                expires,
            }),
            Some(TestZone::Fail(why)) => Err(DnsError::Transient(why)),
            Some(TestZone::NxDomain) | None => Ok(MxAnswer {
                records: vec![],
                nxdomain: true,
                expires,
            }),
        }
    }

    async fn resolve_ip(&self, host: &Name) -> Result<IpAnswer, DnsError> {
        self.ip_queries.fetch_add(1, Ordering::SeqCst);
        let addrs = self
            .hosts
            .lock()
            .get(&key(&host.to_ascii()))
            .cloned()
            .unwrap_or_default();
        Ok(IpAnswer {
            addrs,
            expires: Instant::now() + Duration::from_secs(300),
        })
    }
}
