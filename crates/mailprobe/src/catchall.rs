use crate::smtp_tier::{RcptOutcome, RcptVerifier};
use dns_resolver::MailExchanger;
use rand::distributions::Alphanumeric;
use rand::Rng;
use verdict_store::{CatchAllState, DomainFactsCache};

const RANDOM_LOCAL_LEN: usize = 20;

/// An unpredictable local part for the catch-all probe. Long enough that
/// collision with a real mailbox is not a practical concern.
pub fn random_local_part() -> String {
    let mut rng = rand::thread_rng();
    let tail: String = (&mut rng)
        .sample_iter(Alphanumeric)
        .take(RANDOM_LOCAL_LEN)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    // Always start with a letter; some servers are picky about leading digits
    format!("v{tail}")
}

/// Decide whether `domain` accepts arbitrary recipients, memoized through
/// the domain facts cache. Only a completed probe round-trip records
/// Yes/No; anything inconclusive is recorded as Unreachable with a short
/// lifetime.
pub async fn determine_catch_all(
    facts: &DomainFactsCache,
    verifier: &dyn RcptVerifier,
    mx: &MailExchanger,
    domain: &str,
) -> CatchAllState {
    facts
        .probe_catch_all(domain, async {
            let probe_address = format!("{}@{domain}", random_local_part());
            tracing::debug!("catch-all probe for {domain} via {probe_address}");
            match verifier.verify(mx, &[probe_address]).await.pop() {
                Some(RcptOutcome::Reply { response, .. }) if response.code == 250 => {
                    CatchAllState::Yes
                }
                Some(RcptOutcome::Reply { response, .. }) if response.is_permanent() => {
                    CatchAllState::No
                }
                // A transient answer is not a completed probe round-trip;
                // nothing is concluded from it
                _ => CatchAllState::Unknown,
            }
        })
        .await
}
