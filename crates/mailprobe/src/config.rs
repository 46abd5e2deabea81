use serde::{Deserialize, Serialize};
use smtp_probe::{SmtpClientTimeouts, TlsMode};
use std::time::Duration;

/// The enumerated configuration surface. Every knob is typed and carries a
/// default so that an empty config file yields a working verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Domain presented in EHLO
    #[serde(default = "default_helo_domain")]
    pub helo_domain: String,

    /// Envelope sender for MAIL FROM
    #[serde(default = "default_from_address")]
    pub from_address: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    /// Global cap on concurrent SMTP conversations
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Cap on concurrent conversations to a single destination host
    #[serde(default = "default_per_host_concurrency")]
    pub per_host_concurrency: usize,

    /// How many tier invocations may wait for a saturated cap before new
    /// requests are answered `unknown` with reason=overloaded
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// When false, only the cache and SMTP tiers run
    #[serde(default = "default_true")]
    pub tiered_enabled: bool,

    #[serde(default = "default_fast_confidence_threshold")]
    pub fast_confidence_threshold: f32,

    #[serde(default = "default_pattern_strong_threshold")]
    pub pattern_strong_threshold: f32,

    /// Pattern confidences in this half-open band qualify for enrichment
    #[serde(default = "default_pattern_medium_band")]
    pub pattern_medium_band: (f32, f32),

    /// Verdict freshness window; older records are refreshed in the
    /// background when read
    #[serde(default = "default_freshness_days")]
    pub freshness_days: u32,

    /// Cap applied to DNS TTLs for the MX cache
    #[serde(default = "default_dns_ttl_cap", with = "smtp_probe::duration_serde")]
    pub dns_ttl_cap: Duration,

    /// How long a catch-all determination is memoized
    #[serde(default = "default_catch_all_ttl", with = "smtp_probe::duration_serde")]
    pub catch_all_ttl: Duration,

    /// In-request retries after a greylist rejection. Disabled by default
    /// to preserve throughput.
    #[serde(default)]
    pub greylist_retries: usize,

    /// Per-request budget when the short cascade runs
    #[serde(default = "default_overall_budget", with = "smtp_probe::duration_serde")]
    pub overall_budget: Duration,

    /// Per-request budget when all six tiers may run
    #[serde(default = "default_extended_budget", with = "smtp_probe::duration_serde")]
    pub extended_budget: Duration,

    /// Maximum recipients carried by one SMTP conversation
    #[serde(default = "default_batch_conversation_cap")]
    pub batch_conversation_cap: usize,

    /// Maximum entries accepted in one batch request
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,

    #[serde(default)]
    pub enrichment_enabled: bool,

    #[serde(default = "default_enrichment_concurrency")]
    pub enrichment_concurrency: usize,

    /// Endpoint for the cheap person-lookup capability
    #[serde(default)]
    pub enrichment_cheap: Option<String>,

    /// Endpoint for the expensive person-lookup capability, consulted only
    /// when the cheap one returns nothing and the address looks like a
    /// plausible person
    #[serde(default)]
    pub enrichment_expensive: Option<String>,

    #[serde(default)]
    pub tls: TlsMode,

    #[serde(default)]
    pub timeouts: SmtpClientTimeouts,

    #[serde(default)]
    pub cache_backend: CacheBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheBackend {
    /// SQLite file alongside the service
    Embedded { path: String },
    /// No durability; verdicts live for the lifetime of the process
    #[default]
    Memory,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes via defaults")
    }
}

impl ProbeConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.freshness_days) * 86400)
    }

    /// The budget for one request, depending on whether the long cascade
    /// is even possible
    pub fn request_budget(&self) -> Duration {
        if self.tiered_enabled && self.enrichment_enabled {
            self.extended_budget
        } else {
            self.overall_budget
        }
    }
}

fn default_helo_domain() -> String {
    "verifier.internal".to_string()
}
fn default_from_address() -> String {
    "verify@verifier.internal".to_string()
}
fn default_smtp_port() -> u16 {
    25
}
fn default_concurrency() -> usize {
    20
}
fn default_per_host_concurrency() -> usize {
    4
}
fn default_queue_depth() -> usize {
    128
}
fn default_true() -> bool {
    true
}
fn default_fast_confidence_threshold() -> f32 {
    0.85
}
fn default_pattern_strong_threshold() -> f32 {
    0.88
}
fn default_pattern_medium_band() -> (f32, f32) {
    (0.70, 0.88)
}
fn default_freshness_days() -> u32 {
    30
}
fn default_dns_ttl_cap() -> Duration {
    Duration::from_secs(86400)
}
fn default_catch_all_ttl() -> Duration {
    Duration::from_secs(7 * 86400)
}
fn default_overall_budget() -> Duration {
    Duration::from_secs(20)
}
fn default_extended_budget() -> Duration {
    Duration::from_secs(30)
}
fn default_batch_conversation_cap() -> usize {
    750
}
fn default_max_batch_entries() -> usize {
    1000
}
fn default_enrichment_concurrency() -> usize {
    8
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ProbeConfig::default();
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.per_host_concurrency, 4);
        assert_eq!(config.fast_confidence_threshold, 0.85);
        assert_eq!(config.pattern_strong_threshold, 0.88);
        assert_eq!(config.pattern_medium_band, (0.70, 0.88));
        assert_eq!(config.freshness_days, 30);
        assert_eq!(config.greylist_retries, 0);
        assert_eq!(config.overall_budget, Duration::from_secs(20));
        assert_eq!(config.batch_conversation_cap, 750);
        assert!(config.tiered_enabled);
        assert!(!config.enrichment_enabled);
    }

    #[test]
    fn partial_config_overrides() {
        let config: ProbeConfig = serde_json::from_str(
            r#"{
                "helo_domain": "mx.probe.example",
                "concurrency": 50,
                "overall_budget": "15s",
                "cache_backend": {"kind": "embedded", "path": "/var/lib/probe/verdicts.db"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.helo_domain, "mx.probe.example");
        assert_eq!(config.concurrency, 50);
        assert_eq!(config.overall_budget, Duration::from_secs(15));
        assert!(matches!(config.cache_backend, CacheBackend::Embedded { .. }));
        // untouched knobs keep their defaults
        assert_eq!(config.smtp_port, 25);
    }
}
