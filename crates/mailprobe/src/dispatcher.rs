use crate::catchall::determine_catch_all;
use crate::config::{CacheBackend, ProbeConfig};
use crate::enrichment::{HttpPersonLookup, LookupCost, PersonCandidate, PersonLookup};
use crate::limits::ProbeLimiter;
use crate::pattern::{score_local_part, PersonName, PatternScore};
use crate::provider::{classify_mx, Provider};
use crate::smtp_tier::{RcptOutcome, RcptVerifier, SmtpVerifier};
use chrono::Utc;
use dns_resolver::{DnsError, HickoryResolver, MailExchanger, MxResolver, MxResolverParams, Resolver};
use email_addr::{classify, AddrError, AddressFlags, EmailAddress};
use reply_classify::{PreDefinedReplyClass, ReplyClass, ReplyClassifier};
use serde::Deserialize;
use smtp_probe::ConversationParams;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use verdict_store::{
    BufferedStore, CatchAllState, DomainFactsCache, Reachability, Tier, VerdictRecord,
    VerdictStore,
};

static TIER_VERDICTS: LazyLock<prometheus::IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "verify_tier_verdicts",
        "verdicts emitted, by the tier that produced them",
        &["tier"]
    )
    .unwrap()
});

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRequest {
    pub address: String,
    #[serde(default)]
    pub first: Option<String>,
    #[serde(default)]
    pub last: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

impl VerifyRequest {
    pub fn address(address: &str) -> Self {
        Self {
            address: address.to_string(),
            first: None,
            last: None,
            company: None,
        }
    }

    fn person_name(&self) -> Option<PersonName> {
        match (&self.first, &self.last) {
            (Some(first), Some(last)) => Some(PersonName::new(first, last)),
            _ => None,
        }
    }
}

/// The only error surfaced to callers; everything else is answered with a
/// verdict.
#[derive(Error, Debug)]
pub enum InputError {
    #[error(transparent)]
    Address(#[from] AddrError),
    #[error("batch of {got} entries exceeds the limit of {limit}")]
    BatchTooLarge { got: usize, limit: usize },
}

/// The tiered dispatcher. One instance serves the whole process; all
/// shared state lives in the verdict store, the domain facts cache, and
/// the resolver cache.
pub struct Verifier {
    config: ProbeConfig,
    resolver: Arc<MxResolver>,
    store: Arc<BufferedStore>,
    facts: Arc<DomainFactsCache>,
    rcpt: Arc<dyn RcptVerifier>,
    limiter: Arc<ProbeLimiter>,
    cheap: Option<Arc<dyn PersonLookup>>,
    expensive: Option<Arc<dyn PersonLookup>>,
}

/// What the SMTP tier concluded, and whether later tiers may still act.
enum SmtpDecision {
    /// Conclusive here; later tiers do not run
    Final(VerdictRecord),
    /// 250 on a catch-all domain: risky now, upgradeable to safe only via
    /// enrichment plus re-verification
    CatchAllRisky(VerdictRecord),
    /// No usable signal; the pattern tier may continue
    Unknown(VerdictRecord),
}

impl Verifier {
    /// Production wiring: system DNS, real SMTP, configured store backend.
    pub fn new(config: ProbeConfig) -> anyhow::Result<Arc<Self>> {
        let store: Arc<dyn VerdictStore> = match &config.cache_backend {
            CacheBackend::Embedded { path } => Arc::new(verdict_store::SqliteStore::open(path)?),
            CacheBackend::Memory => Arc::new(verdict_store::MemoryStore::new()),
        };
        let dns = Arc::new(HickoryResolver::new()?);
        Self::with_store_and_dns(config, store, dns)
    }

    pub fn with_store_and_dns(
        config: ProbeConfig,
        store: Arc<dyn VerdictStore>,
        dns: Arc<dyn Resolver>,
    ) -> anyhow::Result<Arc<Self>> {
        let resolver = Arc::new(MxResolver::new(
            dns,
            MxResolverParams {
                ttl_cap: config.dns_ttl_cap,
                ..Default::default()
            },
        ));
        let limiter = Arc::new(ProbeLimiter::new(
            config.concurrency,
            config.per_host_concurrency,
            config.enrichment_concurrency,
            config.queue_depth,
        ));
        let rcpt = Arc::new(SmtpVerifier::new(
            resolver.clone(),
            limiter.clone(),
            ConversationParams {
                helo_domain: config.helo_domain.clone(),
                mail_from: config.from_address.clone(),
                tls: config.tls,
            },
            config.timeouts,
            config.smtp_port,
            config.batch_conversation_cap,
        ));

        let cheap = match &config.enrichment_cheap {
            Some(url) => Some(Arc::new(HttpPersonLookup::new(url.clone(), LookupCost::Cheap)?)
                as Arc<dyn PersonLookup>),
            None => None,
        };
        let expensive = match &config.enrichment_expensive {
            Some(url) => Some(Arc::new(HttpPersonLookup::new(
                url.clone(),
                LookupCost::Expensive,
            )?) as Arc<dyn PersonLookup>),
            None => None,
        };

        Ok(Self::with_parts(config, store, resolver, limiter, rcpt, cheap, expensive))
    }

    /// Full dependency injection; what the test suite drives.
    pub fn with_parts(
        config: ProbeConfig,
        store: Arc<dyn VerdictStore>,
        resolver: Arc<MxResolver>,
        limiter: Arc<ProbeLimiter>,
        rcpt: Arc<dyn RcptVerifier>,
        cheap: Option<Arc<dyn PersonLookup>>,
        expensive: Option<Arc<dyn PersonLookup>>,
    ) -> Arc<Self> {
        let facts = Arc::new(DomainFactsCache::new(config.catch_all_ttl));
        Arc::new(Self {
            config,
            resolver,
            store: Arc::new(BufferedStore::new(store)),
            facts,
            rcpt,
            limiter,
            cheap,
            expensive,
        })
    }

    pub fn store(&self) -> &BufferedStore {
        &self.store
    }

    /// `unknown` verdicts become refresh candidates much sooner than
    /// conclusive ones; this is what turns a DNS or SMTP transient into a
    /// scheduled later retry.
    fn refresh_window(&self, record: &VerdictRecord) -> Duration {
        let window = self.config.freshness_window();
        if record.reachability == Reachability::Unknown {
            window.min(Duration::from_secs(3600))
        } else {
            window
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Verify a single address through the cascade.
    pub async fn verify(self: &Arc<Self>, request: VerifyRequest) -> Result<VerdictRecord, InputError> {
        let addr = EmailAddress::parse(&request.address)?;
        let flags = classify(&addr);
        let name = request.person_name();

        // Tier 1: cache
        if let Ok(Some((record, age))) = self.store.get(&addr.normalized).await {
            let stale = age > self.refresh_window(&record);
            let mut cached = record;
            cached.tier = Tier::Cache;
            TIER_VERDICTS.with_label_values(&["cache"]).inc();
            if stale {
                // Serve the stale verdict now; refresh behind the request
                self.spawn_refresh(addr);
            }
            return Ok(cached);
        }

        let verdict = match tokio::time::timeout(
            self.config.request_budget(),
            self.run_tiers(&addr, &flags, name.as_ref()),
        )
        .await
        {
            Ok(verdict) => verdict,
            Err(_) => {
                let mut verdict = self.base_record(&addr, &flags, "other");
                verdict.tier = Tier::Smtp;
                verdict.error = Some("timeout".to_string());
                verdict.reason = Some("timeout".to_string());
                verdict
            }
        };

        let tier_label = verdict.tier.to_string();
        TIER_VERDICTS.with_label_values(&[tier_label.as_str()]).inc();
        let _ = self.store.put(verdict.clone()).await;
        Ok(verdict)
    }

    /// Verify a batch. Entries are grouped by domain so that MX
    /// resolution and the catch-all probe run once per domain and
    /// recipients share SMTP conversations. Response order matches the
    /// request order; per-entry input errors do not fail the batch.
    pub async fn verify_batch(
        self: &Arc<Self>,
        requests: Vec<VerifyRequest>,
    ) -> Result<Vec<Result<VerdictRecord, InputError>>, InputError> {
        if requests.len() > self.config.max_batch_entries {
            return Err(InputError::BatchTooLarge {
                got: requests.len(),
                limit: self.config.max_batch_entries,
            });
        }

        let mut slots: Vec<Option<Result<VerdictRecord, InputError>>> =
            requests.iter().map(|_| None).collect();
        let mut groups: std::collections::HashMap<String, Vec<(usize, VerifyRequest, EmailAddress)>> =
            std::collections::HashMap::new();

        for (index, request) in requests.into_iter().enumerate() {
            match EmailAddress::parse(&request.address) {
                Ok(addr) => groups
                    .entry(addr.domain.clone())
                    .or_default()
                    .push((index, request, addr)),
                Err(err) => slots[index] = Some(Err(err.into())),
            }
        }

        let mut tasks = JoinSet::new();
        for (_domain, group) in groups {
            let this = self.clone();
            tasks.spawn(async move { this.verify_domain_group(group).await });
        }
        while let Some(result) = tasks.join_next().await {
            let verdicts = result.expect("domain group task does not panic");
            for (index, verdict) in verdicts {
                slots[index] = Some(Ok(verdict));
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.expect("every entry resolved"))
            .collect())
    }

    /// Process all addresses of one domain. The SMTP step is vectorized:
    /// every address that reaches it shares one batched conversation.
    async fn verify_domain_group(
        self: Arc<Self>,
        group: Vec<(usize, VerifyRequest, EmailAddress)>,
    ) -> Vec<(usize, VerdictRecord)> {
        let budget = self.config.request_budget();
        let fallback: Vec<(usize, EmailAddress, AddressFlags)> = group
            .iter()
            .map(|(index, _, addr)| (*index, addr.clone(), classify(addr)))
            .collect();

        match tokio::time::timeout(budget, self.domain_group_inner(group)).await {
            Ok(verdicts) => verdicts,
            Err(_) => fallback
                .into_iter()
                .map(|(index, addr, flags)| {
                    let mut verdict = self.base_record(&addr, &flags, "other");
                    verdict.tier = Tier::Smtp;
                    verdict.error = Some("timeout".to_string());
                    verdict.reason = Some("timeout".to_string());
                    (index, verdict)
                })
                .collect(),
        }
    }

    async fn domain_group_inner(
        self: &Arc<Self>,
        group: Vec<(usize, VerifyRequest, EmailAddress)>,
    ) -> Vec<(usize, VerdictRecord)> {
        let mut done: Vec<(usize, VerdictRecord)> = vec![];
        let mut pending: Vec<(usize, VerifyRequest, EmailAddress, AddressFlags)> = vec![];

        for (index, request, addr) in group {
            let flags = classify(&addr);
            if let Ok(Some((record, age))) = self.store.get(&addr.normalized).await {
                let stale = age > self.refresh_window(&record);
                let mut cached = record;
                cached.tier = Tier::Cache;
                if stale {
                    self.spawn_refresh(addr);
                }
                done.push((index, cached));
                continue;
            }
            pending.push((index, request, addr, flags));
        }

        if pending.is_empty() {
            return done;
        }

        // Disposable domains and DNS-level outcomes apply to everyone in
        // the group uniformly; the shared prologue computes them once
        let domain = pending[0].2.domain.clone();
        let prologue = self.domain_prologue(&domain, &pending[0].3).await;
        let (mx, provider) = match prologue {
            DomainPrologue::Resolved { mx, provider } => (mx, provider),
            DomainPrologue::Verdict {
                reachability,
                tier,
                error,
            } => {
                for (index, _, addr, flags) in pending {
                    let mut verdict = self.base_record(&addr, &flags, "other");
                    verdict.reachability = reachability;
                    verdict.tier = tier;
                    verdict.error = Some(error.clone());
                    if reachability == Reachability::Invalid {
                        verdict.is_deliverable = Some(false);
                    }
                    let _ = self.store.put(verdict.clone()).await;
                    done.push((index, verdict));
                }
                return done;
            }
        };

        // Tier 2 per address
        let mut smtp_queue: Vec<(usize, VerifyRequest, EmailAddress, AddressFlags)> = vec![];
        for (index, request, addr, flags) in pending {
            if self.config.tiered_enabled {
                if let Some(verdict) = self.fast_tier(&addr, &flags, &provider, &mx) {
                    let _ = self.store.put(verdict.clone()).await;
                    done.push((index, verdict));
                    continue;
                }
            }
            smtp_queue.push((index, request, addr, flags));
        }

        if smtp_queue.is_empty() {
            return done;
        }

        // Tier 3, batched: one catch-all determination, one conversation
        let catch_all =
            determine_catch_all(&self.facts, self.rcpt.as_ref(), &mx, &domain).await;
        let recipients: Vec<String> = smtp_queue
            .iter()
            .map(|(_, _, addr, _)| addr.normalized.clone())
            .collect();
        let outcomes = self.rcpt.verify(&mx, &recipients).await;

        for ((index, request, addr, flags), outcome) in
            smtp_queue.into_iter().zip(outcomes.into_iter())
        {
            let decision = self.smtp_decision(&addr, &flags, &provider, catch_all, outcome);
            let verdict = self
                .post_smtp_tiers(&addr, &flags, request.person_name().as_ref(), &provider, &mx, decision)
                .await;
            let _ = self.store.put(verdict.clone()).await;
            done.push((index, verdict));
        }

        done
    }

    /// Tiers 2 through 6 for one address; the cache tier and write-back
    /// are handled by the callers.
    async fn run_tiers(
        self: &Arc<Self>,
        addr: &EmailAddress,
        flags: &AddressFlags,
        name: Option<&PersonName>,
    ) -> VerdictRecord {
        let (mx, provider) = match self.domain_prologue(&addr.domain, flags).await {
            DomainPrologue::Resolved { mx, provider } => (mx, provider),
            DomainPrologue::Verdict {
                reachability,
                tier,
                error,
            } => {
                let mut verdict = self.base_record(addr, flags, "other");
                verdict.reachability = reachability;
                verdict.tier = tier;
                verdict.error = Some(error);
                if reachability == Reachability::Invalid {
                    verdict.is_deliverable = Some(false);
                }
                return verdict;
            }
        };

        if self.config.tiered_enabled {
            if let Some(verdict) = self.fast_tier(addr, flags, &provider, &mx) {
                return verdict;
            }
        }

        // Tier 3: catch-all first, so that a 250 on the target can be
        // interpreted correctly
        let catch_all =
            determine_catch_all(&self.facts, self.rcpt.as_ref(), &mx, &addr.domain).await;
        let outcome = self.probe_with_greylist_retries(&mx, &addr.normalized).await;
        let decision = self.smtp_decision(addr, flags, &provider, catch_all, outcome);

        self.post_smtp_tiers(addr, flags, name, &provider, &mx, decision)
            .await
    }

    /// Everything that is uniform for a whole domain: disposable
    /// rejection, MX resolution, null-MX, and provider classification.
    async fn domain_prologue(&self, domain: &str, flags: &AddressFlags) -> DomainPrologue {
        if flags.is_disposable {
            return DomainPrologue::Verdict {
                reachability: Reachability::Invalid,
                tier: Tier::Fast,
                error: "disposable".to_string(),
            };
        }

        let mx = match self.resolver.resolve(domain).await {
            Ok(mx) => mx,
            Err(DnsError::NxDomain) => {
                return DomainPrologue::Verdict {
                    reachability: Reachability::Invalid,
                    tier: Tier::Fast,
                    error: "nxdomain".to_string(),
                }
            }
            Err(DnsError::InvalidName(_)) => {
                return DomainPrologue::Verdict {
                    reachability: Reachability::Invalid,
                    tier: Tier::Fast,
                    error: "bad_domain".to_string(),
                }
            }
            Err(DnsError::Transient(why)) => {
                tracing::debug!("MX for {domain} unavailable: {why}");
                return DomainPrologue::Verdict {
                    reachability: Reachability::Unknown,
                    tier: Tier::Fast,
                    error: "dns_transient".to_string(),
                };
            }
        };

        if mx.is_null_mx {
            return DomainPrologue::Verdict {
                reachability: Reachability::Invalid,
                tier: Tier::Fast,
                error: "null_mx".to_string(),
            };
        }

        let provider = classify_mx(&mx.hosts);
        DomainPrologue::Resolved { mx, provider }
    }

    /// Tier 2. Emits a safe verdict when the provider prior plus
    /// classifier adjustments clears the threshold; schedules a
    /// background SMTP confirmation for it.
    fn fast_tier(
        self: &Arc<Self>,
        addr: &EmailAddress,
        flags: &AddressFlags,
        provider: &Provider,
        mx: &Arc<MailExchanger>,
    ) -> Option<VerdictRecord> {
        let confidence = fast_confidence(provider, flags);
        if confidence < self.config.fast_confidence_threshold || flags.is_role {
            return None;
        }

        tracing::debug!(
            "{}: fast tier confidence {confidence:.2} via {}",
            addr.normalized,
            provider.tag
        );
        let mut verdict = self.base_record(addr, flags, provider.tag);
        verdict.reachability = Reachability::Safe;
        verdict.tier = Tier::Fast;
        verdict.mx_host = mx.hosts.first().cloned();

        self.spawn_confirmation(addr.clone(), flags.clone(), mx.clone(), provider.clone());
        Some(verdict)
    }

    async fn probe_with_greylist_retries(
        &self,
        mx: &Arc<MailExchanger>,
        normalized: &str,
    ) -> RcptOutcome {
        let mut outcome = self
            .rcpt
            .verify(mx, &[normalized.to_string()])
            .await
            .pop()
            .unwrap_or_else(|| RcptOutcome::no_answer("verifier returned nothing"));

        let mut retries = self.config.greylist_retries;
        while retries > 0 && is_greylisted(&outcome) {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            outcome = self
                .rcpt
                .verify(mx, &[normalized.to_string()])
                .await
                .pop()
                .unwrap_or_else(|| RcptOutcome::no_answer("verifier returned nothing"));
            retries -= 1;
        }
        outcome
    }

    fn smtp_decision(
        &self,
        addr: &EmailAddress,
        flags: &AddressFlags,
        provider: &Provider,
        catch_all: CatchAllState,
        outcome: RcptOutcome,
    ) -> SmtpDecision {
        let mut verdict = self.base_record(addr, flags, provider.tag);
        verdict.tier = Tier::Smtp;
        verdict.is_catch_all = catch_all == CatchAllState::Yes;

        let (mx_host, response) = match outcome {
            RcptOutcome::NoAnswer { why } => {
                verdict.error = Some(if why == "overloaded" {
                    "overloaded".to_string()
                } else {
                    "smtp_unreachable".to_string()
                });
                verdict.reason = Some(why);
                return SmtpDecision::Unknown(verdict);
            }
            RcptOutcome::Reply { mx_host, response } => (mx_host, response),
        };

        verdict.mx_host = Some(mx_host);
        verdict.smtp_code = response.code;
        verdict.smtp_message = response.to_single_line();

        if response.code == 250 || response.code == 251 {
            if catch_all == CatchAllState::Yes {
                verdict.reachability = Reachability::Risky;
                verdict.is_deliverable = Some(true);
                verdict.error = Some("catch_all".to_string());
                return SmtpDecision::CatchAllRisky(verdict);
            }
            verdict.is_deliverable = Some(true);
            if flags.is_role {
                verdict.reachability = Reachability::Risky;
                verdict.error = Some("role_account".to_string());
            } else {
                verdict.reachability = Reachability::Safe;
            }
            return SmtpDecision::Final(verdict);
        }

        let class = ReplyClassifier::builtin().classify_response(&response);
        let class = match class {
            ReplyClass::PreDefined(pre) => pre,
            ReplyClass::UserDefined(_) => PreDefinedReplyClass::Uncategorized,
        };

        match (response.is_permanent(), class) {
            (_, PreDefinedReplyClass::MailboxFull) => {
                // The mailbox exists; it just cannot take more mail
                verdict.reachability = Reachability::Risky;
                verdict.is_deliverable = Some(false);
                verdict.error = Some("mailbox_full".to_string());
                SmtpDecision::Final(verdict)
            }
            (true, PreDefinedReplyClass::MailboxUnknown) => {
                verdict.reachability = Reachability::Invalid;
                verdict.is_deliverable = Some(false);
                verdict.error = Some("mailbox_unknown".to_string());
                SmtpDecision::Final(verdict)
            }
            (true, PreDefinedReplyClass::MailboxDisabled) => {
                verdict.reachability = Reachability::Invalid;
                verdict.is_deliverable = Some(false);
                verdict.error = Some("mailbox_disabled".to_string());
                SmtpDecision::Final(verdict)
            }
            (_, PreDefinedReplyClass::Greylisted) => {
                verdict.error = Some("greylisted".to_string());
                SmtpDecision::Unknown(verdict)
            }
            (_, PreDefinedReplyClass::SpamBlock) => {
                verdict.error = Some("spam_block".to_string());
                SmtpDecision::Unknown(verdict)
            }
            (_, PreDefinedReplyClass::PolicyBlock) => {
                verdict.error = Some("policy_block".to_string());
                SmtpDecision::Unknown(verdict)
            }
            (_, PreDefinedReplyClass::RelayDenied) => {
                verdict.error = Some("relay_denied".to_string());
                SmtpDecision::Unknown(verdict)
            }
            (true, _) => {
                // Unmatched 5xx stays unknown; without a recognized
                // mailbox reason even 550/551/553 prove nothing
                verdict.error = Some("smtp_permanent".to_string());
                SmtpDecision::Unknown(verdict)
            }
            (false, _) => {
                verdict.error = Some("smtp_transient".to_string());
                SmtpDecision::Unknown(verdict)
            }
        }
    }

    /// Tiers 4 through 6.
    async fn post_smtp_tiers(
        self: &Arc<Self>,
        addr: &EmailAddress,
        flags: &AddressFlags,
        name: Option<&PersonName>,
        provider: &Provider,
        mx: &Arc<MailExchanger>,
        decision: SmtpDecision,
    ) -> VerdictRecord {
        let (mut fallback, catch_all_path) = match decision {
            SmtpDecision::Final(verdict) => return verdict,
            SmtpDecision::CatchAllRisky(verdict) => (verdict, true),
            SmtpDecision::Unknown(verdict) => (verdict, false),
        };

        if !self.config.tiered_enabled {
            return fallback;
        }

        // Tier 4: pattern
        if flags.is_role {
            if !catch_all_path {
                fallback.reachability = Reachability::Risky;
                fallback.tier = Tier::Pattern;
                fallback.error = Some("role_account".to_string());
            }
            return fallback;
        }

        let score = score_local_part(&addr.local, name);
        let strong = score.confidence >= self.config.pattern_strong_threshold;
        let (medium_lo, medium_hi) = self.config.pattern_medium_band;
        let medium = score.confidence >= medium_lo && score.confidence < medium_hi;

        if strong && !catch_all_path && !flags.is_free && !provider.is_consumer() {
            fallback.reachability = Reachability::Safe;
            fallback.tier = Tier::Pattern;
            fallback.error = None;
            fallback.reason = Some(score.reasons.join(","));
            return fallback;
        }

        // Tier 5: enrichment waterfall. On the catch-all path a strong
        // pattern also qualifies, since re-verification is the only route
        // from risky back to safe on such a domain.
        let eligible = self.config.enrichment_enabled && (medium || (strong && catch_all_path));
        if !eligible {
            return fallback;
        }
        let candidate = match self.enrich(addr, &score, flags).await {
            Some(candidate) => candidate,
            None => {
                if !catch_all_path {
                    fallback.tier = Tier::Enrichment;
                }
                return fallback;
            }
        };

        tracing::debug!(
            "{}: enrichment candidate {:?} {:?}",
            addr.normalized,
            candidate.first_name,
            candidate.last_name
        );

        // Tier 6: re-verification, exactly once
        let outcome = self
            .rcpt
            .verify(mx, &[addr.normalized.clone()])
            .await
            .pop()
            .unwrap_or_else(|| RcptOutcome::no_answer("verifier returned nothing"));

        match outcome {
            RcptOutcome::Reply { mx_host, response } if response.code == 250 => {
                fallback.reachability = Reachability::Safe;
                fallback.tier = Tier::ReVerify;
                fallback.mx_host = Some(mx_host);
                fallback.smtp_code = response.code;
                fallback.smtp_message = response.to_single_line();
                fallback.is_deliverable = Some(true);
                fallback.error = None;
                fallback.reason = None;
                fallback
            }
            RcptOutcome::Reply { mx_host, response } => {
                fallback.reachability = Reachability::Risky;
                fallback.tier = Tier::ReVerify;
                fallback.mx_host = Some(mx_host);
                fallback.smtp_code = response.code;
                fallback.smtp_message = response.to_single_line();
                fallback.reason = Some("risky-enriched".to_string());
                fallback
            }
            RcptOutcome::NoAnswer { why } => {
                fallback.reachability = Reachability::Risky;
                fallback.tier = Tier::ReVerify;
                fallback.reason = Some("risky-enriched".to_string());
                fallback.error = Some("smtp_unreachable".to_string());
                tracing::debug!("{}: re-verify got no answer: {why}", addr.normalized);
                fallback
            }
        }
    }

    /// Cheap-then-expensive lookup waterfall. Provider outages are
    /// swallowed: the tier is skipped as if the provider had returned
    /// nothing.
    async fn enrich(
        &self,
        addr: &EmailAddress,
        score: &PatternScore,
        flags: &AddressFlags,
    ) -> Option<PersonCandidate> {
        let _permit = self.limiter.acquire_enrichment().await.ok()?;

        if let Some(cheap) = &self.cheap {
            match cheap.search(addr).await {
                Ok(Some(candidate)) => return Some(candidate),
                Ok(None) => {}
                Err(err) => tracing::warn!("cheap enrichment failed: {err:#}"),
            }
        }

        // The expensive provider is consulted only for plausible person
        // patterns, and only after the cheap one came up empty
        let (medium_lo, medium_hi) = self.config.pattern_medium_band;
        let plausible_person =
            !flags.is_role && score.confidence >= medium_lo && score.confidence <= medium_hi;
        if !plausible_person {
            return None;
        }
        if let Some(expensive) = &self.expensive {
            match expensive.search(addr).await {
                Ok(candidate) => return candidate,
                Err(err) => tracing::warn!("expensive enrichment failed: {err:#}"),
            }
        }
        None
    }

    /// Background refresh for a stale cache hit. Carries its own deadline
    /// and never blocks the foreground request.
    fn spawn_refresh(self: &Arc<Self>, addr: EmailAddress) {
        let this = self.clone();
        tokio::spawn(async move {
            let flags = classify(&addr);
            let budget = this.config.request_budget();
            if let Ok(verdict) =
                tokio::time::timeout(budget, this.run_tiers(&addr, &flags, None)).await
            {
                let _ = this.store.put(verdict).await;
            }
        });
    }

    /// Background SMTP confirmation for a fast-tier verdict. Writes back
    /// only conclusive outcomes; an inconclusive probe must not downgrade
    /// the fast tier's safe.
    fn spawn_confirmation(
        self: &Arc<Self>,
        addr: EmailAddress,
        flags: AddressFlags,
        mx: Arc<MailExchanger>,
        provider: Provider,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let budget = this.config.overall_budget;
            let result = tokio::time::timeout(budget, async {
                let catch_all =
                    determine_catch_all(&this.facts, this.rcpt.as_ref(), &mx, &addr.domain).await;
                let outcome = this.probe_with_greylist_retries(&mx, &addr.normalized).await;
                this.smtp_decision(&addr, &flags, &provider, catch_all, outcome)
            })
            .await;

            match result {
                Ok(SmtpDecision::Final(verdict)) | Ok(SmtpDecision::CatchAllRisky(verdict)) => {
                    let _ = this.store.put(verdict).await;
                }
                Ok(SmtpDecision::Unknown(_)) | Err(_) => {}
            }
        });
    }

    fn base_record(
        &self,
        addr: &EmailAddress,
        flags: &AddressFlags,
        provider_tag: &str,
    ) -> VerdictRecord {
        VerdictRecord {
            email: addr.normalized.clone(),
            domain: addr.domain.clone(),
            reachability: Reachability::Unknown,
            is_deliverable: None,
            is_catch_all: false,
            is_disposable: flags.is_disposable,
            is_role: flags.is_role,
            is_free: flags.is_free,
            mx_host: None,
            smtp_code: 0,
            smtp_message: String::new(),
            provider: provider_tag.to_string(),
            verified_at: Utc::now(),
            error: None,
            tier: Tier::Fast,
            reason: None,
        }
    }
}

enum DomainPrologue {
    Resolved {
        mx: Arc<MailExchanger>,
        provider: Provider,
    },
    Verdict {
        reachability: Reachability,
        tier: Tier,
        error: String,
    },
}

fn is_greylisted(outcome: &RcptOutcome) -> bool {
    match outcome {
        RcptOutcome::Reply { response, .. } if response.is_transient() => {
            ReplyClassifier::builtin().classify_response(response)
                == ReplyClass::PreDefined(PreDefinedReplyClass::Greylisted)
        }
        _ => false,
    }
}

/// Provider prior plus classifier adjustments.
fn fast_confidence(provider: &Provider, flags: &AddressFlags) -> f32 {
    let mut confidence = provider.prior;
    match provider.tag {
        "gmail" => confidence += 0.30,
        "microsoft365" => confidence += 0.20,
        _ if flags.is_free => confidence += 0.10,
        _ => {}
    }
    if !flags.is_role && !flags.is_disposable {
        confidence += 0.10;
    }
    if flags.is_disposable {
        confidence -= 0.20;
    }
    if provider.tag == "other" {
        confidence -= 0.10;
    }
    confidence
}
