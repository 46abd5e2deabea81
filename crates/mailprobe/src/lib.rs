//! mailprobe decides whether a mailbox is deliverable without ever
//! sending mail. A request walks a cascade of increasingly expensive
//! tiers: the verdict cache, syntactic and DNS classification, a live
//! SMTP dialogue (never past RCPT TO), local-part pattern scoring, an
//! optional person-lookup enrichment, and a final re-verification. Each
//! tier may answer definitively or defer to the next; `unknown` is a
//! first-class answer.

pub mod catchall;
pub mod config;
pub mod dispatcher;
pub mod enrichment;
pub mod limits;
pub mod pattern;
pub mod provider;
pub mod smtp_tier;

pub use config::{CacheBackend, ProbeConfig};
pub use dispatcher::{InputError, Verifier, VerifyRequest};
pub use enrichment::{HttpPersonLookup, LookupCost, PersonCandidate, PersonLookup, StaticLookup};
pub use limits::{Overloaded, ProbeLimiter};
pub use pattern::{score_local_part, PersonName, PatternScore};
pub use provider::{classify_mx, Provider};
pub use smtp_tier::{RcptOutcome, RcptVerifier, ScriptedRcptVerifier, ScriptedReply, SmtpVerifier};
