use serde::Serialize;

/// A provider identity derived from the MX host set, with a prior
/// reflecting how reliable RCPT acceptance is from that provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provider {
    pub tag: &'static str,
    pub prior: f32,
}

const GMAIL: Provider = Provider {
    tag: "gmail",
    prior: 0.50,
};
const MICROSOFT365: Provider = Provider {
    tag: "microsoft365",
    prior: 0.45,
};
const YAHOO: Provider = Provider {
    tag: "yahoo",
    prior: 0.35,
};
const ICLOUD: Provider = Provider {
    tag: "icloud",
    prior: 0.35,
};
const PROOFPOINT: Provider = Provider {
    tag: "proofpoint",
    prior: 0.25,
};
const MIMECAST: Provider = Provider {
    tag: "mimecast",
    prior: 0.25,
};
const OTHER: Provider = Provider {
    tag: "other",
    prior: 0.20,
};

/// MX hostname suffix -> provider. The table covers the providers whose
/// RCPT behavior we have priors for; everything else lands in the default
/// bucket.
const SUFFIX_TABLE: &[(&str, &Provider)] = &[
    (".google.com", &GMAIL),
    (".googlemail.com", &GMAIL),
    (".mail.protection.outlook.com", &MICROSOFT365),
    (".olc.protection.outlook.com", &MICROSOFT365),
    (".yahoodns.net", &YAHOO),
    (".mail.icloud.com", &ICLOUD),
    (".mail.me.com", &ICLOUD),
    (".pphosted.com", &PROOFPOINT),
    (".ppe-hosted.com", &PROOFPOINT),
    (".mimecast.com", &MIMECAST),
    (".mimecast.co.za", &MIMECAST),
];

/// Classify an MX host set. Pure function: the first host that matches a
/// known suffix decides, in preference order.
pub fn classify_mx(hosts: &[String]) -> Provider {
    for host in hosts {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        for (suffix, provider) in SUFFIX_TABLE {
            if host.ends_with(suffix) || host == suffix[1..] {
                return (*provider).clone();
            }
        }
    }
    OTHER
}

impl Provider {
    /// Consumer mailbox providers; pattern-tier promotion applies only to
    /// the corporate/default bucket
    pub fn is_consumer(&self) -> bool {
        matches!(self.tag, "gmail" | "yahoo" | "icloud")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn known_providers() {
        assert_eq!(
            classify_mx(&hosts(&["gmail-smtp-in.l.google.com."])).tag,
            "gmail"
        );
        assert_eq!(
            classify_mx(&hosts(&["aspmx.l.google.com"])).tag,
            "gmail",
            "Google Workspace shares the Gmail infrastructure"
        );
        assert_eq!(
            classify_mx(&hosts(&["acme-com.mail.protection.outlook.com."])).tag,
            "microsoft365"
        );
        assert_eq!(
            classify_mx(&hosts(&["mta5.am0.yahoodns.net"])).tag,
            "yahoo"
        );
        assert_eq!(classify_mx(&hosts(&["mx01.mail.icloud.com"])).tag, "icloud");
        assert_eq!(
            classify_mx(&hosts(&["mxa-00123456.gslb.pphosted.com"])).tag,
            "proofpoint"
        );
        assert_eq!(
            classify_mx(&hosts(&["us-smtp-inbound-1.mimecast.com"])).tag,
            "mimecast"
        );
    }

    #[test]
    fn unknown_providers_get_the_default_bucket() {
        let provider = classify_mx(&hosts(&["mail.smallco.test"]));
        assert_eq!(provider.tag, "other");
        assert_eq!(provider.prior, 0.20);
        assert!(!provider.is_consumer());

        assert_eq!(classify_mx(&[]).tag, "other");
    }

    #[test]
    fn priors_reflect_rcpt_reliability() {
        // Gmail answers RCPT honestly; the generic bucket gets no credit
        assert!(classify_mx(&hosts(&["alt1.gmail-smtp-in.l.google.com"])).prior > 0.45);
        assert!(classify_mx(&hosts(&["mail.smallco.test"])).prior <= 0.25);
    }
}
