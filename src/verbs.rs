//! English verb conjugation for action lifecycle labels.
//!
//! Given a base verb, derive the third-person-singular and gerund forms:
//! `publish` → `publishes` / `publishing`. A known-verbs table covers
//! irregulars; rule chains handle everything else.

/// Conjugated forms of one base verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerbForms {
    /// Base form, e.g. `run`.
    pub action: String,
    /// Third person singular, e.g. `runs`.
    pub act: String,
    /// Gerund, e.g. `running`.
    pub activity: String,
}

/// Irregulars and verbs the rule chains would mangle.
const KNOWN_VERBS: &[(&str, &str, &str)] = &[
    ("run", "runs", "running"),
    ("fetch", "fetches", "fetching"),
    ("publish", "publishes", "publishing"),
    ("do", "does", "doing"),
    ("go", "goes", "going"),
    ("have", "has", "having"),
    ("be", "is", "being"),
];

/// Conjugate a base verb into `(action, act, activity)`.
pub fn conjugate(verb: &str) -> VerbForms {
    let verb = verb.trim().to_ascii_lowercase();
    if let Some((base, act, activity)) = KNOWN_VERBS.iter().find(|(base, _, _)| *base == verb) {
        return VerbForms {
            action: (*base).into(),
            act: (*act).into(),
            activity: (*activity).into(),
        };
    }
    VerbForms {
        act: third_person(&verb),
        activity: gerund(&verb),
        action: verb,
    }
}

/// Third person singular, rules applied in order:
/// 1. consonant + `y` → `ies`
/// 2. `s`, `x`, `z`, `ch`, `sh` → append `es`
/// 3. otherwise append `s`
pub fn third_person(verb: &str) -> String {
    let bytes = verb.as_bytes();
    if let Some(&last) = bytes.last() {
        if last == b'y' && bytes.len() >= 2 && !is_vowel(bytes[bytes.len() - 2]) {
            return format!("{}ies", &verb[..verb.len() - 1]);
        }
        if matches!(last, b's' | b'x' | b'z')
            || verb.ends_with("ch")
            || verb.ends_with("sh")
        {
            return format!("{verb}es");
        }
    }
    format!("{verb}s")
}

/// Gerund, rules applied in order:
/// 1. `ie` → drop, append `ying`
/// 2. `e` but not `ee` → drop `e`, append `ing`
/// 3. 3-letter CVC with final letter not in `wxy` → double final consonant
/// 4. otherwise append `ing`
pub fn gerund(verb: &str) -> String {
    if verb.ends_with("ie") {
        return format!("{}ying", &verb[..verb.len() - 2]);
    }
    if verb.ends_with('e') && !verb.ends_with("ee") {
        return format!("{}ing", &verb[..verb.len() - 1]);
    }
    let bytes = verb.as_bytes();
    if bytes.len() == 3
        && !is_vowel(bytes[0])
        && is_vowel(bytes[1])
        && !is_vowel(bytes[2])
        && !matches!(bytes[2], b'w' | b'x' | b'y')
    {
        return format!("{verb}{}ing", bytes[2] as char);
    }
    format!("{verb}ing")
}

fn is_vowel(b: u8) -> bool {
    matches!(b, b'a' | b'e' | b'i' | b'o' | b'u')
}
