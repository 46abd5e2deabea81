use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonName {
    pub first: String,
    pub last: String,
}

impl PersonName {
    pub fn new(first: &str, last: &str) -> Self {
        Self {
            first: first.trim().to_lowercase(),
            last: last.trim().to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternScore {
    pub confidence: f32,
    /// The shape the local part matched, plus any name-match adjustment
    pub reasons: Vec<String>,
}

/// Deterministic person-likeness score for a local part, per the shape
/// table. When a name is known, exact shape agreement lifts the floor to
/// 0.95, a partial overlap lifts it to 0.80, and a contradiction caps the
/// score at 0.20.
pub fn score_local_part(local: &str, name: Option<&PersonName>) -> PatternScore {
    let local = local.to_lowercase();
    let bare = match local.split_once('+') {
        Some((base, _)) => base,
        None => local.as_str(),
    };

    let (mut confidence, shape) = base_confidence(bare);
    let mut reasons = vec![format!("shape:{shape}")];

    if let Some(name) = name {
        match match_name(bare, name) {
            NameMatch::Exact => {
                confidence = confidence.max(0.95);
                reasons.push("name:exact".to_string());
            }
            NameMatch::Partial => {
                confidence = confidence.max(0.80);
                reasons.push("name:partial".to_string());
            }
            NameMatch::Contradiction => {
                confidence = confidence.min(0.20);
                reasons.push("name:contradiction".to_string());
            }
        }
    }

    PatternScore { confidence, reasons }
}

fn base_confidence(local: &str) -> (f32, &'static str) {
    let tokens: Vec<&str> = local.split(['.', '_', '-']).collect();

    match tokens.as_slice() {
        [a, b] if is_alpha(a) && is_alpha(b) => {
            if a.len() == 1 {
                (0.80, "f.last")
            } else {
                (0.90, "first.last")
            }
        }
        [single] if is_alpha(single) => {
            if looks_like_initial_plus_last(single) {
                (0.80, "flast")
            } else if single.len() >= 7 {
                (0.85, "firstlast")
            } else if single.len() >= 3 {
                (0.75, "first")
            } else {
                (0.10, "random")
            }
        }
        [single] => match split_trailing_digits(single) {
            Some((alpha, digits)) if is_alpha(alpha) && alpha.len() >= 3 && digits.len() <= 4 => {
                (0.50, "first+digits")
            }
            _ => (0.10, "random"),
        },
        _ => (0.10, "random"),
    }
}

fn is_alpha(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic())
}

fn split_trailing_digits(s: &str) -> Option<(&str, &str)> {
    let split = s.find(|c: char| c.is_ascii_digit())?;
    let (alpha, digits) = s.split_at(split);
    digits
        .chars()
        .all(|c| c.is_ascii_digit())
        .then_some((alpha, digits))
}

/// Leading digraphs that start ordinary given names; anything else
/// starting with two consonants reads as initial + surname ("jdoe").
const NAME_DIGRAPHS: &[&str] = &[
    "bl", "br", "ch", "chr", "cl", "cr", "dr", "fl", "fr", "gl", "gr", "kh", "kl", "kr", "ph",
    "pl", "pr", "qu", "sc", "sh", "sk", "sl", "sm", "sn", "sp", "st", "sv", "sw", "th", "tr",
    "vl", "wh", "wr", "zh",
];

fn looks_like_initial_plus_last(s: &str) -> bool {
    let bytes = s.as_bytes();
    if s.len() < 4 || s.len() > 10 {
        return false;
    }
    let first_two_consonants =
        !is_vowel(bytes[0] as char) && !is_vowel(bytes[1] as char);
    first_two_consonants
        && !NAME_DIGRAPHS
            .iter()
            .any(|digraph| s.starts_with(digraph))
}

fn is_vowel(c: char) -> bool {
    matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y')
}

enum NameMatch {
    Exact,
    Partial,
    Contradiction,
}

fn match_name(local: &str, name: &PersonName) -> NameMatch {
    let first = name.first.as_str();
    let last = name.last.as_str();
    if first.is_empty() && last.is_empty() {
        return NameMatch::Partial;
    }
    let initial = &first[0..first.len().min(1)];

    let exact_forms = [
        format!("{first}.{last}"),
        format!("{first}{last}"),
        format!("{initial}.{last}"),
        format!("{initial}{last}"),
        format!("{first}_{last}"),
        format!("{first}-{last}"),
        first.to_string(),
    ];
    if exact_forms.iter().any(|form| !form.is_empty() && local == form) {
        return NameMatch::Exact;
    }

    let has_first = !first.is_empty() && local.contains(first);
    let has_last = !last.is_empty() && local.contains(last);
    if has_first || has_last {
        return NameMatch::Partial;
    }

    NameMatch::Contradiction
}

#[cfg(test)]
mod test {
    use super::*;

    fn confidence(local: &str) -> f32 {
        score_local_part(local, None).confidence
    }

    #[test]
    fn shape_table() {
        k9::assert_equal!(confidence("jane.doe"), 0.90);
        k9::assert_equal!(confidence("janedoe"), 0.85);
        k9::assert_equal!(confidence("j.doe"), 0.80);
        k9::assert_equal!(confidence("jdoe"), 0.80);
        k9::assert_equal!(confidence("jane"), 0.75);
        k9::assert_equal!(confidence("jane42"), 0.50);
        k9::assert_equal!(confidence("x7q9zk1"), 0.10);
        k9::assert_equal!(confidence("xq"), 0.10);
    }

    #[test]
    fn common_digraph_names_are_not_initials() {
        // "smith" starts with two consonants but is a plain name shape
        assert_eq!(confidence("smith"), 0.75);
        assert_eq!(confidence("chris"), 0.75);
    }

    #[test]
    fn tags_are_ignored() {
        assert_eq!(confidence("jane.doe+crm"), 0.90);
    }

    #[test]
    fn name_match_lifts_and_caps() {
        let name = PersonName::new("Jane", "Doe");

        let exact = score_local_part("jane.doe", Some(&name));
        k9::assert_equal!(exact.confidence, 0.95);
        assert!(exact.reasons.contains(&"name:exact".to_string()));

        let exact_initial = score_local_part("jdoe", Some(&name));
        k9::assert_equal!(exact_initial.confidence, 0.95);

        // a weak shape containing the last name is lifted to the floor
        let partial = score_local_part("doefam", Some(&name));
        k9::assert_equal!(partial.confidence, 0.80);

        let contradiction = score_local_part("bob.smith", Some(&name));
        assert!(contradiction.confidence <= 0.20);
        assert!(contradiction
            .reasons
            .contains(&"name:contradiction".to_string()));
    }

    #[test]
    fn scoring_is_deterministic() {
        for _ in 0..5 {
            assert_eq!(confidence("jane.doe"), 0.90);
        }
    }
}
