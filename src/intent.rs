//! Intent schema, problem-type detection, and the email normalizer (§3, §4.9).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{ Deserialize, Serialize };

/// Result of an LLM intent classification (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub kind: IntentKind,
    pub confidence: f32,
    #[serde(default)]
    pub extracted: Extracted,
    #[serde(default)]
    pub requires_clarification: bool,
    #[serde(default)]
    pub off_topic: bool,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl Intent {
    pub fn unclear() -> Self {
        Intent {
            kind: IntentKind::Unclear,
            confidence: 0.0,
            extracted: Extracted::None,
            requires_clarification: true,
            off_topic: false,
            reasoning: None,
        }
    }

    pub fn is_yes(&self, threshold: f32) -> bool {
        self.kind == IntentKind::Yes && self.confidence > threshold
    }

    pub fn is_no(&self) -> bool {
        self.kind == IntentKind::No
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Yes,
    No,
    Unclear,
    OffTopic,
    InternetIssue,
    MobileIssue,
    ModificationRequest,
    EmailProvided,
    IdentityProvided,
    ProblemResolved,
    ProblemPersists,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Extracted {
    #[default]
    None,
    Email {
        address: String,
    },
    Identity {
        name: String,
    },
    Problem {
        problem_type: ProblemType,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProblemType {
    Internet,
    Mobile,
    Unknown,
}

/// Parse an LLM `ClassifyJSON` response body into an [`Intent`].
///
/// On any parse failure, yields `Intent::unclear()` (§4.6/§7 ParseError —
/// degrade, never crash the call).
pub fn parse_classification(body: &str) -> Intent {
    serde_json::from_str(body).unwrap_or_else(|_| Intent::unclear())
}

// ───────────────────────────────────────────────────────────────────────
//  Problem-type detection — deterministic, closed keyword lists
// ───────────────────────────────────────────────────────────────────────

const INTERNET_KEYWORDS: &[&str] = &[
    "internet",
    "wifi",
    "wi-fi",
    "box",
    "modem",
    "connexion",
    "fibre",
    "adsl",
    "routeur",
];

const MOBILE_KEYWORDS: &[&str] = &[
    "portable",
    "mobile",
    "réseau",
    "reseau",
    "forfait",
    "sms",
    "appel",
    "carte sim",
    "sim",
];

/// Score keyword matches against the two closed lists; ties resolve to
/// `Internet` (§4.9). Deterministic and reproducible by construction.
pub fn detect_problem_type(text: &str) -> ProblemType {
    let lowered = text.to_lowercase();
    let internet_score = INTERNET_KEYWORDS.iter().filter(|kw| lowered.contains(*kw)).count();
    let mobile_score = MOBILE_KEYWORDS.iter().filter(|kw| lowered.contains(*kw)).count();

    if internet_score == 0 && mobile_score == 0 {
        ProblemType::Unknown
    } else if mobile_score > internet_score {
        ProblemType::Mobile
    } else {
        ProblemType::Internet
    }
}

// ───────────────────────────────────────────────────────────────────────
//  Email normalizer
// ───────────────────────────────────────────────────────────────────────

static WELLFORMED_EMAIL_RE: Lazy<Regex> = Lazy::new(||
    Regex::new(r"(?i)[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}").expect("valid regex")
);

static SPOKEN_EMAIL_RE: Lazy<Regex> = Lazy::new(||
    Regex::new(
        r"(?i)\b(?P<local>[a-z0-9._-]+)\s+arobase\s+(?P<domain>[a-z0-9-]+)\s+point\s+(?P<tld>[a-z]{2,})\b"
    ).expect("valid regex")
);

/// Find and normalize a spoken or already-formed email phrase.
///
/// `normalize_email(normalize_email(x).unwrap())` equals
/// `normalize_email(x).unwrap()` whenever `x` contains one such phrase,
/// since the normalized output is itself a well-formed email and is
/// recognized by the pass-through branch.
pub fn normalize_email(text: &str) -> Option<String> {
    if let Some(m) = WELLFORMED_EMAIL_RE.find(text) {
        return Some(m.as_str().to_lowercase());
    }
    if let Some(caps) = SPOKEN_EMAIL_RE.captures(text) {
        let local = &caps["local"];
        let domain = &caps["domain"];
        let tld = &caps["tld"];
        return Some(format!("{local}@{domain}.{tld}").to_lowercase());
    }
    None
}

/// `true` when `text` looks like it names an email address, spoken or
/// written — used by the IDENTIFICATION transition guard (§4.9).
pub fn looks_email_shaped(text: &str) -> bool {
    normalize_email(text).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_classification_valid() {
        let body =
            r#"{"kind":"yes","confidence":0.9,"extracted":{"kind":"none"},"requires_clarification":false,"off_topic":false}"#;
        let intent = parse_classification(body);
        assert_eq!(intent.kind, IntentKind::Yes);
        assert!(intent.is_yes(0.6));
    }

    #[test]
    fn test_parse_classification_invalid_degrades_to_unclear() {
        let intent = parse_classification("not json at all");
        assert_eq!(intent.kind, IntentKind::Unclear);
        assert_eq!(intent.confidence, 0.0);
        assert!(intent.requires_clarification);
    }

    #[test]
    fn test_problem_type_mobile_example_from_spec() {
        let pt = detect_problem_type("mon portable n'a pas de réseau");
        assert_eq!(pt, ProblemType::Mobile);
    }

    #[test]
    fn test_problem_type_internet() {
        let pt = detect_problem_type("mon wifi ne marche plus, la box clignote");
        assert_eq!(pt, ProblemType::Internet);
    }

    #[test]
    fn test_problem_type_tie_goes_to_internet() {
        let pt = detect_problem_type("internet et portable");
        assert_eq!(pt, ProblemType::Internet);
    }

    #[test]
    fn test_problem_type_no_keywords_is_unknown() {
        let pt = detect_problem_type("bonjour comment allez vous");
        assert_eq!(pt, ProblemType::Unknown);
    }

    #[test]
    fn test_problem_type_deterministic() {
        let text = "mon portable n'a pas de réseau";
        assert_eq!(detect_problem_type(text), detect_problem_type(text));
    }

    #[test]
    fn test_normalize_email_spoken_phrase() {
        let out = normalize_email("mon email c'est jean arobase acme point com merci");
        assert_eq!(out, Some("jean@acme.com".to_string()));
    }

    #[test]
    fn test_normalize_email_wellformed_passthrough() {
        let out = normalize_email("contactez-moi a Jean@ACME.COM stp");
        assert_eq!(out, Some("jean@acme.com".to_string()));
    }

    #[test]
    fn test_normalize_email_idempotent() {
        let x = "jean arobase acme point com";
        let once = normalize_email(x).unwrap();
        let twice = normalize_email(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_email_none_when_absent() {
        assert_eq!(normalize_email("pas d'email ici"), None);
    }

    #[test]
    fn test_looks_email_shaped() {
        assert!(looks_email_shaped("jean arobase acme point fr"));
        assert!(!looks_email_shaped("je m'appelle jean dupont"));
    }
}
