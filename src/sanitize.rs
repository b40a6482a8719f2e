//! String sanitization (§7, §3 Ticket invariant).
//!
//! Every string value persisted (ticket fields, recording file names) has
//! NUL bytes stripped and the configured profanity list substituted. The
//! sanitizer is total (applies to every string in a structure) and
//! idempotent (`sanitize(sanitize(x)) == sanitize(x)`).

use once_cell::sync::Lazy;
use regex::Regex;

/// Closed list of raw-insult tokens that must never appear in a persisted
/// ticket summary. Matched case-insensitively, whole-word.
const PROFANITY_LIST: &[&str] = &["connard", "merde", "putain", "con", "salope", "encule"];

static PROFANITY_RE: Lazy<Regex> = Lazy::new(|| {
    let alternation = PROFANITY_LIST.join("|");
    Regex::new(&format!(r"(?i)\b({alternation})\b")).expect("profanity regex is valid")
});

/// Strip NUL bytes and mask profanity tokens in a single string. Safe to
/// call repeatedly: `sanitize_string(sanitize_string(x)) == sanitize_string(x)`.
pub fn sanitize_string(input: &str) -> String {
    let no_nul: String = input.chars().filter(|&c| c != '\u{0}').collect();
    PROFANITY_RE.replace_all(&no_nul, "***").into_owned()
}

/// Recursively sanitize every string value in a JSON-like structure. Used
/// for ticket fields and anything else persisted or passed to downstream
/// storage/file paths (§4.7: "All string inputs and outputs ... are
/// sanitized").
pub fn sanitize_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            *s = sanitize_string(s);
        }
        serde_json::Value::Array(items) => {
            for item in items {
                sanitize_value(item);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                sanitize_value(v);
            }
        }
        _ => {}
    }
}

/// Count of negative/anger keyword matches in a transcript (sentiment
/// guard, §4.9). Each match against the closed negative-keyword list
/// increments the per-call counter by the caller.
const NEGATIVE_KEYWORDS: &[&str] = &[
    "arnaque",
    "incompetent",
    "incompétents",
    "nul",
    "ras le bol",
    "scandaleux",
    "inadmissible",
    "honteux",
];

pub fn count_negative_keywords(text: &str) -> u32 {
    let lowered = text.to_lowercase();
    NEGATIVE_KEYWORDS.iter().filter(|kw| lowered.contains(*kw)).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_nul_bytes() {
        let input = "hello\u{0}world";
        let out = sanitize_string(input);
        assert!(!out.contains('\u{0}'));
    }

    #[test]
    fn test_masks_profanity() {
        let out = sanitize_string("c'est de la merde franchement");
        assert!(!out.to_lowercase().contains("merde"));
    }

    #[test]
    fn test_idempotent() {
        let input = "putain\u{0} de probleme";
        let once = sanitize_string(input);
        let twice = sanitize_string(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_sanitize_value_recursive() {
        let mut v =
            serde_json::json!({
            "summary": "c'est de la merde\u{0}",
            "tags": ["putain", "ok"],
            "nested": { "note": "merde\u{0}encore" }
        });
        sanitize_value(&mut v);
        let s = v.to_string();
        assert!(!s.contains('\u{0}'));
        assert!(!s.to_lowercase().contains("merde"));
        assert!(!s.to_lowercase().contains("putain"));
    }

    #[test]
    fn test_negative_keyword_count() {
        assert_eq!(count_negative_keywords("c'est de l'arnaque, vous etes incompetents, ras le bol"), 3);
        assert_eq!(count_negative_keywords("tout va bien merci"), 0);
    }

    #[test]
    fn test_sanitized_output_is_valid_utf8_and_nul_free() {
        for input in ["a\u{0}b", "", "merde", "normal text"] {
            let out = sanitize_string(input);
            assert!(!out.as_bytes().contains(&0u8));
            assert!(std::str::from_utf8(out.as_bytes()).is_ok());
        }
    }
}
