use serde::{Deserialize, Serialize};
use thiserror::Error;

mod lists;
pub use lists::{is_disposable_domain, is_free_domain, is_role_local};

/// Practical subset of RFC 5322: total length, local length, exactly one
/// `@`, and conventional domain label rules. Anything beyond that (quoted
/// locals, domain literals) is rejected; the verifier has no use for
/// addresses that no mailbox provider will accept.
const MAX_ADDRESS_LEN: usize = 254;
const MAX_LOCAL_LEN: usize = 64;
const MAX_DOMAIN_LEN: usize = 253;

/// Free providers that alias local parts: dots are ignored and `+tag`
/// suffixes are stripped when forming the canonical address.
const ALIASING_DOMAINS: &[&str] = &["gmail.com", "googlemail.com"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("address is empty")]
    Empty,
    #[error("address is longer than {MAX_ADDRESS_LEN} characters")]
    TooLong,
    #[error("address must contain exactly one @ sign")]
    AtSign,
    #[error("local part is empty or longer than {MAX_LOCAL_LEN} characters")]
    LocalPart,
    #[error("local part contains invalid character {0:?}")]
    LocalChar(char),
    #[error("invalid domain: {0}")]
    Domain(String),
}

/// A canonical representation of an email address.
/// `normalized` is the verdict key: two addresses with the same normalized
/// form are the same mailbox for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub raw: String,
    pub local: String,
    pub domain: String,
    pub normalized: String,
}

impl EmailAddress {
    /// Parse and canonicalize a raw address string.
    /// Normalization is idempotent: parsing the `normalized` form of any
    /// address yields the same `normalized` form again.
    pub fn parse(raw: &str) -> Result<Self, AddrError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddrError::Empty);
        }
        if trimmed.len() > MAX_ADDRESS_LEN {
            return Err(AddrError::TooLong);
        }

        let mut parts = trimmed.split('@');
        let (local, domain) = match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(domain), None) => (local, domain),
            _ => return Err(AddrError::AtSign),
        };

        if local.is_empty() || local.len() > MAX_LOCAL_LEN {
            return Err(AddrError::LocalPart);
        }
        if let Some(bad) = local
            .chars()
            .find(|c| !c.is_alphanumeric() && !matches!(c, '.' | '_' | '-' | '+' | '\''))
        {
            return Err(AddrError::LocalChar(bad));
        }
        if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
            return Err(AddrError::LocalPart);
        }

        let domain = normalize_domain(domain)?;
        let local = local.to_lowercase();
        let canonical_local = fold_local(&local, &domain);

        Ok(Self {
            raw: raw.to_string(),
            normalized: format!("{canonical_local}@{domain}"),
            local,
            domain,
        })
    }
}

fn normalize_domain(domain: &str) -> Result<String, AddrError> {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return Err(AddrError::Domain("bad length".to_string()));
    }

    let ascii = idna::domain_to_ascii(domain)
        .map_err(|err| AddrError::Domain(format!("{domain}: {err}")))?;
    let ascii = ascii.strip_suffix('.').unwrap_or(&ascii).to_string();

    let labels: Vec<&str> = ascii.split('.').collect();
    if labels.len() < 2 {
        return Err(AddrError::Domain(format!("{ascii} has no dot")));
    }
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return Err(AddrError::Domain(format!("bad label in {ascii}")));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(AddrError::Domain(format!("bad label in {ascii}")));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(AddrError::Domain(format!("bad label in {ascii}")));
        }
    }

    // googlemail.com is the same mailbox namespace as gmail.com
    if ascii == "googlemail.com" {
        return Ok("gmail.com".to_string());
    }
    Ok(ascii)
}

fn fold_local(local: &str, domain: &str) -> String {
    if !ALIASING_DOMAINS.contains(&domain) {
        return local.to_string();
    }
    let base = match local.split_once('+') {
        Some((base, _tag)) => base,
        None => local,
    };
    base.replace('.', "")
}

/// Classifier flags for a parsed address. Pure function of the address and
/// the static lists; no I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressFlags {
    pub is_role: bool,
    pub is_free: bool,
    pub is_disposable: bool,
    /// Populated when the domain looks like a one-character typo of a known
    /// free provider. Advisory only.
    pub suggestion: Option<String>,
}

pub fn classify(addr: &EmailAddress) -> AddressFlags {
    let bare_local = match addr.local.split_once('+') {
        Some((base, _)) => base,
        None => addr.local.as_str(),
    };

    let is_free = is_free_domain(&addr.domain);
    AddressFlags {
        is_role: is_role_local(bare_local),
        is_free,
        is_disposable: is_disposable_domain(&addr.domain),
        suggestion: if is_free {
            None
        } else {
            lists::suggest_domain(&addr.domain).map(|d| format!("{bare_local}@{d}"))
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalization_is_idempotent() {
        for input in [
            "Foo.Bar+news@Gmail.COM",
            "  jane.doe@Example.Com ",
            "someone@googlemail.com",
            "o'brien@corp.example",
        ] {
            let first = EmailAddress::parse(input).unwrap();
            let second = EmailAddress::parse(&first.normalized).unwrap();
            k9::assert_equal!(first.normalized, second.normalized, "input {input}");
        }
    }

    #[test]
    fn gmail_folding() {
        k9::assert_equal!(
            EmailAddress::parse("Foo.Bar+news@Gmail.COM").unwrap(),
            EmailAddress {
                raw: "Foo.Bar+news@Gmail.COM".to_string(),
                local: "foo.bar+news".to_string(),
                domain: "gmail.com".to_string(),
                normalized: "foobar@gmail.com".to_string(),
            }
        );

        // aliasing is provider-specific; a corporate domain keeps its dots
        let addr = EmailAddress::parse("Foo.Bar+news@corp.example").unwrap();
        k9::assert_equal!(addr.normalized, "foo.bar+news@corp.example");
    }

    #[test]
    fn googlemail_is_gmail() {
        let addr = EmailAddress::parse("a.b@googlemail.com").unwrap();
        k9::assert_equal!(addr.normalized, "ab@gmail.com");
    }

    #[test]
    fn rejects() {
        assert_eq!(EmailAddress::parse(""), Err(AddrError::Empty));
        assert_eq!(EmailAddress::parse("no-at-sign"), Err(AddrError::AtSign));
        assert_eq!(EmailAddress::parse("a@b@c.example"), Err(AddrError::AtSign));
        assert!(matches!(
            EmailAddress::parse("user@nodot"),
            Err(AddrError::Domain(_))
        ));
        assert!(matches!(
            EmailAddress::parse("user@-bad.example"),
            Err(AddrError::Domain(_))
        ));
        assert!(matches!(
            EmailAddress::parse(".leading@x.example"),
            Err(AddrError::LocalPart)
        ));
        assert!(matches!(
            EmailAddress::parse("sp ace@x.example"),
            Err(AddrError::LocalChar(' '))
        ));

        let long_local = format!("{}@x.example", "a".repeat(65));
        assert_eq!(EmailAddress::parse(&long_local), Err(AddrError::LocalPart));

        let long = format!("{}@{}.example", "a".repeat(60), "b".repeat(200));
        assert_eq!(EmailAddress::parse(&long), Err(AddrError::TooLong));
    }

    #[test]
    fn classification() {
        let support = EmailAddress::parse("support@acme.example").unwrap();
        let flags = classify(&support);
        assert!(flags.is_role);
        assert!(!flags.is_free);
        assert!(!flags.is_disposable);

        let gmail = EmailAddress::parse("jane@gmail.com").unwrap();
        let flags = classify(&gmail);
        assert!(!flags.is_role);
        assert!(flags.is_free);

        let throwaway = EmailAddress::parse("x@mailinator.com").unwrap();
        assert!(classify(&throwaway).is_disposable);

        // role detection ignores +tags
        let tagged = EmailAddress::parse("admin+ci@acme.example").unwrap();
        assert!(classify(&tagged).is_role);
    }

    #[test]
    fn typo_suggestion() {
        let typo = EmailAddress::parse("jane@gmal.com").unwrap();
        k9::assert_equal!(
            classify(&typo).suggestion.as_deref(),
            Some("jane@gmail.com")
        );

        let exact = EmailAddress::parse("jane@gmail.com").unwrap();
        assert_eq!(classify(&exact).suggestion, None);

        let unrelated = EmailAddress::parse("jane@acme-widgets.example").unwrap();
        assert_eq!(classify(&unrelated).suggestion, None);
    }
}
