//! Static classification lists. These are deliberately compiled in rather
//! than loaded at runtime: the classifier must be a pure function.

/// Local parts that address a function rather than a person.
const ROLE_LOCALS: &[&str] = &[
    "abuse",
    "accounting",
    "admin",
    "administrator",
    "billing",
    "careers",
    "contact",
    "dev",
    "enquiries",
    "feedback",
    "finance",
    "ftp",
    "hello",
    "help",
    "helpdesk",
    "hostmaster",
    "hr",
    "info",
    "inquiries",
    "it",
    "jobs",
    "legal",
    "mail",
    "mailer-daemon",
    "marketing",
    "media",
    "newsletter",
    "no-reply",
    "noreply",
    "notifications",
    "office",
    "orders",
    "postmaster",
    "press",
    "privacy",
    "root",
    "sales",
    "security",
    "services",
    "support",
    "team",
    "webmaster",
];

/// Consumer mailbox providers. Membership feeds the fast-tier confidence
/// adjustments and suppresses the typo suggestion.
const FREE_DOMAINS: &[&str] = &[
    "126.com",
    "163.com",
    "aol.com",
    "att.net",
    "comcast.net",
    "fastmail.com",
    "free.fr",
    "gmail.com",
    "gmx.com",
    "gmx.de",
    "gmx.net",
    "hotmail.co.uk",
    "hotmail.com",
    "hotmail.fr",
    "icloud.com",
    "laposte.net",
    "libero.it",
    "live.com",
    "mac.com",
    "mail.com",
    "mail.ru",
    "me.com",
    "msn.com",
    "naver.com",
    "orange.fr",
    "outlook.com",
    "outlook.fr",
    "proton.me",
    "protonmail.com",
    "qq.com",
    "t-online.de",
    "verizon.net",
    "wanadoo.fr",
    "web.de",
    "yahoo.co.uk",
    "yahoo.com",
    "yahoo.fr",
    "yandex.com",
    "yandex.ru",
    "zoho.com",
];

/// Known disposable/temporary inbox providers. A match short-circuits the
/// pipeline to `invalid` without an SMTP conversation.
const DISPOSABLE_DOMAINS: &[&str] = &[
    "10minutemail.com",
    "33mail.com",
    "burnermail.io",
    "discard.email",
    "dispostable.com",
    "emailondeck.com",
    "fakeinbox.com",
    "getnada.com",
    "grr.la",
    "guerrillamail.biz",
    "guerrillamail.com",
    "guerrillamail.net",
    "inboxkitten.com",
    "maildrop.cc",
    "mailinator.com",
    "mailnesia.com",
    "mailsac.com",
    "mintemail.com",
    "moakt.com",
    "mohmal.com",
    "mytemp.email",
    "pokemail.net",
    "sharklasers.com",
    "spam4.me",
    "spamgourmet.com",
    "temp-mail.org",
    "tempinbox.com",
    "tempmail.com",
    "tempr.email",
    "throwawaymail.com",
    "trashmail.com",
    "trashmail.net",
    "yopmail.com",
    "yopmail.fr",
];

pub fn is_role_local(local: &str) -> bool {
    ROLE_LOCALS.binary_search(&local).is_ok()
}

pub fn is_free_domain(domain: &str) -> bool {
    FREE_DOMAINS.binary_search(&domain).is_ok()
}

pub fn is_disposable_domain(domain: &str) -> bool {
    DISPOSABLE_DOMAINS.binary_search(&domain).is_ok()
}

/// Returns the free-provider domain this one looks like a typo of, if the
/// edit distance is exactly one.
pub(crate) fn suggest_domain(domain: &str) -> Option<&'static str> {
    FREE_DOMAINS
        .iter()
        .find(|candidate| within_one_edit(domain, candidate))
        .copied()
}

fn within_one_edit(a: &str, b: &str) -> bool {
    let (a, b): (Vec<char>, Vec<char>) = (a.chars().collect(), b.chars().collect());
    match a.len().abs_diff(b.len()) {
        0 => {
            // exactly one substitution
            a.iter().zip(b.iter()).filter(|(x, y)| x != y).count() == 1
        }
        1 => {
            // one insertion or deletion
            let (short, long) = if a.len() < b.len() { (&a, &b) } else { (&b, &a) };
            let mut i = 0;
            let mut j = 0;
            let mut edited = false;
            while i < short.len() && j < long.len() {
                if short[i] == long[j] {
                    i += 1;
                    j += 1;
                } else if edited {
                    return false;
                } else {
                    edited = true;
                    j += 1;
                }
            }
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lists_are_sorted_for_binary_search() {
        for list in [ROLE_LOCALS, FREE_DOMAINS, DISPOSABLE_DOMAINS] {
            let mut sorted = list.to_vec();
            sorted.sort_unstable();
            assert_eq!(list, &sorted[..]);
        }
    }

    #[test]
    fn edit_distance() {
        assert!(within_one_edit("gmal.com", "gmail.com"));
        assert!(within_one_edit("gmaill.com", "gmail.com"));
        assert!(within_one_edit("gnail.com", "gmail.com"));
        assert!(!within_one_edit("gmail.com", "gmail.com"));
        assert!(!within_one_edit("gml.com", "gmail.com"));
    }
}
