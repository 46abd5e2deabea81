use ordermap::OrderMap;
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::LazyLock;

/// The classes the verifier can act on. Classification is a pure function
/// of the reply text: the same text always yields the same class.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Ord, PartialOrd)]
#[serde(from = "String", into = "String")]
pub enum ReplyClass {
    PreDefined(PreDefinedReplyClass),
    UserDefined(String),
}

impl From<String> for ReplyClass {
    fn from(s: String) -> ReplyClass {
        if let Ok(pre) = PreDefinedReplyClass::from_str(&s) {
            ReplyClass::PreDefined(pre)
        } else {
            ReplyClass::UserDefined(s)
        }
    }
}

impl From<ReplyClass> for String {
    fn from(class: ReplyClass) -> String {
        match class {
            ReplyClass::PreDefined(pre) => pre.to_string(),
            ReplyClass::UserDefined(s) => s,
        }
    }
}

impl From<PreDefinedReplyClass> for ReplyClass {
    fn from(c: PreDefinedReplyClass) -> ReplyClass {
        ReplyClass::PreDefined(c)
    }
}

impl Default for ReplyClass {
    fn default() -> Self {
        PreDefinedReplyClass::Uncategorized.into()
    }
}

#[derive(
    Serialize,
    Deserialize,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Copy,
    Clone,
    Ord,
    PartialOrd,
    strum::EnumString,
    strum::Display,
)]
pub enum PreDefinedReplyClass {
    /// The mailbox does not exist
    MailboxUnknown,
    /// The mailbox exists but is over quota
    MailboxFull,
    /// The mailbox has been disabled or suspended by the provider
    MailboxDisabled,
    /// Transient rejection asking the sender to come back later
    Greylisted,
    /// The host will not relay for this recipient
    RelayDenied,
    /// Rejected by a DNSBL or reputation system
    SpamBlock,
    /// Rejected for an administrative policy reason
    PolicyBlock,
    /// No rule matched
    Uncategorized,
}

/// The on-disk shape of a rules file
#[derive(Deserialize, Serialize, Debug)]
pub struct ReplyClassifierFile {
    pub rules: OrderMap<ReplyClass, Vec<String>>,
}

/// Holds state for compiling rules files into a classifier
#[derive(Default)]
pub struct ReplyClassifierBuilder {
    rules: Vec<(ReplyClass, String)>,
}

impl ReplyClassifierBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, class: ReplyClass, rule: String) {
        self.rules.push((class, rule));
    }

    pub fn merge(&mut self, decoded_file: ReplyClassifierFile) {
        for (class, rules) in decoded_file.rules {
            for rule in rules {
                self.add_rule(class.clone(), rule);
            }
        }
    }

    /// Merge the compiled-in multilingual rule set
    pub fn merge_builtin(&mut self) {
        let decoded: ReplyClassifierFile = toml::from_str(include_str!("../assets/default.toml"))
            .expect("builtin rules file is valid");
        self.merge(decoded);
    }

    pub fn merge_toml_file(&mut self, file_name: &str) -> Result<(), String> {
        let data = std::fs::read_to_string(file_name)
            .map_err(|err| format!("reading file: {file_name}: {err:#}"))?;
        let decoded: ReplyClassifierFile = toml::from_str(&data)
            .map_err(|err| format!("decoding {file_name} as ReplyClassifierFile: {err:#}"))?;
        self.merge(decoded);
        Ok(())
    }

    pub fn build(self) -> Result<ReplyClassifier, String> {
        let mut pattern_to_class = vec![];
        let mut patterns = vec![];
        for (class, rule) in self.rules {
            // Implicit reverse map from pattern index to class; RegexSet
            // reports the earliest matching pattern index, which preserves
            // the file-order precedence of the rules
            pattern_to_class.push(class.clone());
            patterns.push(rule);
        }

        pattern_to_class.shrink_to_fit();

        let set = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()
            .map_err(|err| format!("compiling rules: {err:#}"))?;
        Ok(ReplyClassifier {
            set,
            pattern_to_class,
        })
    }
}

pub struct ReplyClassifier {
    set: RegexSet,
    pattern_to_class: Vec<ReplyClass>,
}

impl ReplyClassifier {
    /// The classifier built from the compiled-in rule set
    pub fn builtin() -> &'static ReplyClassifier {
        static BUILTIN: LazyLock<ReplyClassifier> = LazyLock::new(|| {
            let mut builder = ReplyClassifierBuilder::new();
            builder.merge_builtin();
            builder.build().expect("builtin rules compile")
        });
        &BUILTIN
    }

    pub fn classify_str(&self, s: &str) -> ReplyClass {
        self.set
            .matches(s)
            .into_iter()
            .next()
            .and_then(|idx| self.pattern_to_class.get(idx))
            .cloned()
            .unwrap_or(ReplyClass::PreDefined(PreDefinedReplyClass::Uncategorized))
    }

    pub fn classify_response(&self, response: &smtp_probe::Response) -> ReplyClass {
        let line = response.to_single_line();
        self.classify_str(&line)
    }
}
